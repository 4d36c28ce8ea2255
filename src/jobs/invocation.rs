//! Builds the agent command line for a job.

use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::config::AgentCommandConfig;
use crate::error::JobError;
use crate::jobs::model::JobSpec;

/// Program and arguments for one agent run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    /// Standard invocation: prompt, JSON-lines output, verbose, no
    /// interactive permission prompts, optional model.
    pub fn for_job(agent: &AgentCommandConfig, spec: &JobSpec) -> Self {
        let mut args = agent.leading_args.clone();
        args.extend([
            "-p".to_string(),
            spec.prompt(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--dangerously-skip-permissions".to_string(),
        ]);
        if let Some(model) = spec.options.model.as_ref().or(agent.model.as_ref()) {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        Self {
            program: agent.program.clone(),
            args,
        }
    }

    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }
}

/// Locate `program` the way the OS would when spawning it.
///
/// Names containing a path separator are checked directly; bare names are
/// searched on `PATH`.
pub fn resolve_program(program: &str) -> Result<PathBuf, JobError> {
    let not_found = || JobError::ProcessNotFound {
        program: program.to_string(),
    };

    if program.contains(std::path::MAIN_SEPARATOR) || program.contains('/') {
        let path = PathBuf::from(program);
        return if is_executable(&path) {
            Ok(path)
        } else {
            Err(not_found())
        };
    }

    let path_var = std::env::var_os("PATH").ok_or_else(not_found)?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
        .ok_or_else(not_found)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file() || path.with_extension("exe").is_file()
}
