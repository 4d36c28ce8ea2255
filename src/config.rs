//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// How the external research agent is invoked.
#[derive(Debug, Clone)]
pub struct AgentCommandConfig {
    /// Executable name or path.
    pub program: String,
    /// Arguments placed before the standard protocol flags (e.g. a wrapper
    /// script path when `program` is an interpreter).
    pub leading_args: Vec<String>,
    /// Default model, passed as `--model` when set.
    pub model: Option<String>,
}

impl Default for AgentCommandConfig {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            leading_args: Vec::new(),
            model: None,
        }
    }
}

/// Batching and retry knobs for the log store.
#[derive(Debug, Clone)]
pub struct LogStoreConfig {
    /// Buffered entries are flushed at least this often.
    pub flush_interval: Duration,
    /// A job's buffer is flushed as soon as it holds this many entries.
    pub flush_threshold: usize,
    /// First retry delay on lock contention.
    pub retry_base_delay: Duration,
    /// Upper bound for a single retry delay.
    pub retry_max_delay: Duration,
    /// Total time a write may spend backing off before it is given up.
    pub retry_budget: Duration,
}

impl Default for LogStoreConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(250),
            flush_threshold: 32,
            retry_base_delay: Duration::from_millis(25),
            retry_max_delay: Duration::from_secs(1),
            retry_budget: Duration::from_secs(5),
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of agent processes alive at once.
    pub max_concurrent_jobs: usize,
    /// How long a job may wait for a free slot.
    pub queue_timeout: Duration,
    /// Hard deadline for one agent process.
    pub job_timeout: Duration,
    /// Time between the graceful and the forceful termination signal.
    pub kill_grace: Duration,
    /// Maximum characters kept per log entry.
    pub content_cap: usize,
    /// Delivery poll fallback interval.
    pub poll_interval: Duration,
    /// Terminal jobs older than this are pruned by housekeeping.
    pub log_retention_days: u32,
    pub agent: AgentCommandConfig,
    pub log_store: LogStoreConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 5,
            queue_timeout: Duration::from_secs(30),
            job_timeout: Duration::from_secs(600), // 10 minutes
            kill_grace: Duration::from_secs(2),
            content_cap: 500,
            poll_interval: Duration::from_secs(1),
            log_retention_days: 30,
            agent: AgentCommandConfig::default(),
            log_store: LogStoreConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Build a config from `LEADQUAL_*` environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(n) = env_parse::<usize>("LEADQUAL_MAX_CONCURRENT")? {
            if n == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "LEADQUAL_MAX_CONCURRENT".to_string(),
                    message: "must be at least 1".to_string(),
                });
            }
            config.max_concurrent_jobs = n;
        }
        if let Some(secs) = env_parse::<u64>("LEADQUAL_QUEUE_TIMEOUT_SECS")? {
            config.queue_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("LEADQUAL_JOB_TIMEOUT_SECS")? {
            config.job_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = env_parse::<u64>("LEADQUAL_KILL_GRACE_MS")? {
            config.kill_grace = Duration::from_millis(ms);
        }
        if let Some(cap) = env_parse::<usize>("LEADQUAL_CONTENT_CAP")? {
            config.content_cap = cap;
        }
        if let Some(ms) = env_parse::<u64>("LEADQUAL_POLL_INTERVAL_MS")? {
            config.poll_interval = Duration::from_millis(ms.max(10));
        }
        if let Some(days) = env_parse::<u32>("LEADQUAL_LOG_RETENTION_DAYS")? {
            config.log_retention_days = days;
        }
        if let Some(ms) = env_parse::<u64>("LEADQUAL_FLUSH_INTERVAL_MS")? {
            config.log_store.flush_interval = Duration::from_millis(ms.max(1));
        }
        if let Some(n) = env_parse::<usize>("LEADQUAL_FLUSH_THRESHOLD")? {
            config.log_store.flush_threshold = n.max(1);
        }
        if let Some(ms) = env_parse::<u64>("LEADQUAL_RETRY_BUDGET_MS")? {
            config.log_store.retry_budget = Duration::from_millis(ms);
        }
        if let Ok(bin) = std::env::var("LEADQUAL_AGENT_BIN")
            && !bin.trim().is_empty()
        {
            config.agent.program = bin;
        }
        config.agent.model = std::env::var("LEADQUAL_AGENT_MODEL")
            .ok()
            .filter(|m| !m.trim().is_empty());

        Ok(config)
    }
}

/// Process-level settings for the binary.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub db_path: PathBuf,
    pub http_port: u16,
    /// Directory for rolling log files; stderr only when unset.
    pub log_dir: Option<PathBuf>,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let db_path = std::env::var("LEADQUAL_DB_PATH")
            .unwrap_or_else(|_| "./data/leadqual.db".to_string());
        let http_port = env_parse::<u16>("LEADQUAL_HTTP_PORT")?.unwrap_or(8080);
        let log_dir = std::env::var("LEADQUAL_LOG_DIR").ok().map(PathBuf::from);
        Ok(Self {
            db_path: PathBuf::from(db_path),
            http_port,
            log_dir,
        })
    }
}

/// Read and parse an environment variable. Unset or empty yields `None`.
fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            }),
        _ => Ok(None),
    }
}
