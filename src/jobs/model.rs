//! Job model and status state machine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque job identifier.
pub type JobId = Uuid;

/// Kind of work a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    EntityResearch,
    EntityScoring,
    ConversationGeneration,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EntityResearch => "entity-research",
            Self::EntityScoring => "entity-scoring",
            Self::ConversationGeneration => "conversation-generation",
        }
    }

    /// Prompt used when the caller does not supply one.
    pub fn default_prompt(&self, entity_id: &str) -> String {
        match self {
            Self::EntityResearch => format!(
                "Research the organization or person with id {entity_id}. \
                 Collect public facts relevant to qualifying them as a lead."
            ),
            Self::EntityScoring => format!(
                "Review the collected research for entity {entity_id} and \
                 summarize the evidence for each qualification criterion."
            ),
            Self::ConversationGeneration => format!(
                "Draft opening conversation starters for entity {entity_id} \
                 based on its research notes."
            ),
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "entity-research" => Ok(Self::EntityResearch),
            "entity-scoring" => Ok(Self::EntityScoring),
            "conversation-generation" => Ok(Self::ConversationGeneration),
            other => Err(format!("unknown job type: {other}")),
        }
    }
}

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for an admission slot.
    Queued,
    /// Agent process spawned.
    Running,
    /// Agent exited with code 0.
    Completed,
    /// Agent failed to start or exited non-zero.
    Error,
    /// Deadline or queue timeout hit.
    Timeout,
    /// Cancelled by request.
    Killed,
}

impl JobStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            // From Queued
            (Queued, Running) | (Queued, Error) | (Queued, Timeout) | (Queued, Killed) |
            // From Running
            (Running, Completed) | (Running, Error) | (Running, Timeout) | (Running, Killed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Error | Self::Timeout | Self::Killed
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::Killed => "killed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            "timeout" => Ok(Self::Timeout),
            "killed" => Ok(Self::Killed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Caller-supplied knobs for one job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Overrides the configured job deadline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// A request to run one job.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub job_type: JobType,
    pub entity_id: String,
    pub options: JobOptions,
}

impl JobSpec {
    pub fn new(job_type: JobType, entity_id: impl Into<String>) -> Self {
        Self {
            job_type,
            entity_id: entity_id.into(),
            options: JobOptions::default(),
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.options.prompt = Some(prompt.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.options.model = Some(model.into());
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.options.timeout_secs = Some(secs);
        self
    }

    /// The prompt actually sent to the agent.
    pub fn prompt(&self) -> String {
        self.options
            .prompt
            .clone()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| self.job_type.default_prompt(&self.entity_id))
    }
}

/// A job record, live or historical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    pub entity_id: String,
    pub status: JobStatus,
    /// Why the job ended; `None` while active.
    pub exit_reason: Option<String>,
    /// Set by recovery when the job was orphaned by a restart.
    pub stuck: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// A freshly queued job for `spec`.
    pub fn queued(spec: &JobSpec) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type: spec.job_type,
            entity_id: spec.entity_id.clone(),
            status: JobStatus::Queued,
            exit_reason: None,
            stuck: false,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Transition to a new status, stamping timestamps.
    pub fn transition_to(
        &mut self,
        new_status: JobStatus,
        reason: Option<String>,
    ) -> Result<(), String> {
        if !self.status.can_transition_to(new_status) {
            return Err(format!(
                "Cannot transition from {} to {}",
                self.status, new_status
            ));
        }

        self.status = new_status;
        match new_status {
            JobStatus::Running => self.started_at = Some(Utc::now()),
            s if s.is_terminal() => {
                self.finished_at = Some(Utc::now());
                self.exit_reason = reason;
            }
            _ => {}
        }
        Ok(())
    }

    /// One-line notification text naming the entity and the outcome.
    pub fn summary(&self) -> String {
        let verb = match self.status {
            JobStatus::Queued => "is queued",
            JobStatus::Running => "is running",
            JobStatus::Completed => "completed",
            JobStatus::Error => "failed",
            JobStatus::Timeout => "timed out",
            JobStatus::Killed => "was killed",
        };
        match self.exit_reason.as_deref() {
            Some(reason) if !reason.is_empty() => format!(
                "{} for {} {verb}: {reason}",
                self.job_type, self.entity_id
            ),
            _ => format!("{} for {} {verb}", self.job_type, self.entity_id),
        }
    }
}
