//! Normalized log entries produced from agent output.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::jobs::model::JobId;

/// Category of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    /// Session initialization.
    System,
    /// Free text written by the agent.
    Assistant,
    /// The agent invoked a tool.
    ToolUse,
    /// Output returned by a tool.
    ToolResult,
    Error,
    Progress,
    /// Browser navigation or interaction.
    Browser,
    /// A fetch was redirected to another URL.
    Redirect,
    Info,
}

impl LogKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Assistant => "assistant",
            Self::ToolUse => "tool_use",
            Self::ToolResult => "tool_result",
            Self::Error => "error",
            Self::Progress => "progress",
            Self::Browser => "browser",
            Self::Redirect => "redirect",
            Self::Info => "info",
        }
    }
}

impl fmt::Display for LogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Self::System),
            "assistant" => Ok(Self::Assistant),
            "tool_use" => Ok(Self::ToolUse),
            "tool_result" => Ok(Self::ToolResult),
            "error" => Ok(Self::Error),
            "progress" => Ok(Self::Progress),
            "browser" => Ok(Self::Browser),
            "redirect" => Ok(Self::Redirect),
            "info" => Ok(Self::Info),
            other => Err(format!("unknown log kind: {other}")),
        }
    }
}

/// An entry before it has been assigned a sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLogEntry {
    pub kind: LogKind,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl NewLogEntry {
    pub fn new(kind: LogKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            tool_name: None,
            metadata: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_tool_name(mut self, name: impl Into<String>) -> Self {
        self.tool_name = Some(name.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Attach the job id and sequence number.
    pub fn into_entry(self, job_id: JobId, seq: i64) -> LogEntry {
        LogEntry {
            job_id,
            seq,
            kind: self.kind,
            content: self.content,
            tool_name: self.tool_name,
            metadata: self.metadata,
            created_at: self.created_at,
        }
    }
}

/// A persisted entry. `seq` starts at 1 and is gapless per job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub job_id: JobId,
    pub seq: i64,
    pub kind: LogKind,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Cap `s` at `cap` characters, appending a marker with the dropped count.
pub fn truncate_content(s: &str, cap: usize) -> String {
    let total = s.chars().count();
    if total <= cap {
        return s.to_string();
    }
    let head_end = s
        .char_indices()
        .nth(cap)
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    format!("{}... [{} chars truncated]", &s[..head_end], total - cap)
}
