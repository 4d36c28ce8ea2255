//! Agent process supervision.
//!
//! One call to [`ProcessSupervisor::run`] owns a process from spawn to exit.
//! It races natural exit against the job deadline and the job's cancellation
//! token. Timeout and cancellation share one termination path: a graceful
//! signal to the process group, then a forceful kill once the grace window
//! runs out.

use std::io::ErrorKind;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::JobError;
use crate::jobs::invocation::Invocation;

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Exited on its own. Signal deaths report `-1`.
    Completed { exit_code: i32 },
    /// Deadline hit; the process was terminated.
    Timeout,
    /// Cancellation requested; the process was terminated.
    Killed,
}

/// Spawns and supervises agent processes.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    kill_grace: Duration,
}

impl ProcessSupervisor {
    pub fn new(kill_grace: Duration) -> Self {
        Self { kill_grace }
    }

    /// Run `invocation` to completion, streaming each stdout/stderr line to
    /// `sink`. The sink closes when this returns.
    pub async fn run(
        &self,
        invocation: &Invocation,
        deadline: Duration,
        cancel: &CancellationToken,
        sink: mpsc::Sender<String>,
    ) -> Result<ExitOutcome, JobError> {
        let mut cmd = invocation.command();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group so termination reaches the agent's children.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| spawn_error(&invocation.program, e))?;
        info!(
            pid = child.id(),
            program = %invocation.program,
            "Agent process spawned"
        );

        let readers: Vec<JoinHandle<()>> = [
            spawn_reader(child.stdout.take(), sink.clone()),
            spawn_reader(child.stderr.take(), sink.clone()),
        ]
        .into_iter()
        .flatten()
        .collect();
        drop(sink);

        let result = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => Ok(ExitOutcome::Completed {
                    exit_code: status.code().unwrap_or(-1),
                }),
                Err(e) => {
                    self.terminate(&mut child).await;
                    Err(JobError::ProcessSpawnFailure {
                        program: invocation.program.clone(),
                        reason: format!("wait failed: {e}"),
                    })
                }
            },
            _ = tokio::time::sleep(deadline) => {
                info!(pid = child.id(), deadline = ?deadline, "Agent deadline hit, terminating");
                self.terminate(&mut child).await;
                Ok(ExitOutcome::Timeout)
            }
            _ = cancel.cancelled() => {
                info!(pid = child.id(), "Agent cancelled, terminating");
                self.terminate(&mut child).await;
                Ok(ExitOutcome::Killed)
            }
        };

        // Descendants that outlive the agent can hold the pipes open.
        for reader in readers {
            let abort = reader.abort_handle();
            if tokio::time::timeout(self.kill_grace, reader).await.is_err() {
                debug!("Output reader still open after exit, aborting");
                abort.abort();
            }
        }

        result
    }

    /// Graceful signal, then a forceful kill after the grace window.
    #[cfg(unix)]
    async fn terminate(&self, child: &mut Child) {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        let Some(pid) = child.id() else {
            // Already reaped.
            return;
        };
        let pgid = Pid::from_raw(pid as i32);
        let _ = killpg(pgid, Signal::SIGTERM);

        tokio::select! {
            _ = tokio::time::sleep(self.kill_grace) => {
                warn!(pid, grace = ?self.kill_grace, "Agent ignored SIGTERM, sending SIGKILL");
                let _ = killpg(pgid, Signal::SIGKILL);
                let _ = child.kill().await;
            }
            _ = child.wait() => {
                debug!(pid, "Agent exited after SIGTERM");
            }
        }
    }

    #[cfg(not(unix))]
    async fn terminate(&self, child: &mut Child) {
        let _ = child.kill().await;
    }
}

fn spawn_error(program: &str, err: std::io::Error) -> JobError {
    if err.kind() == ErrorKind::NotFound {
        JobError::ProcessNotFound {
            program: program.to_string(),
        }
    } else {
        JobError::ProcessSpawnFailure {
            program: program.to_string(),
            reason: err.to_string(),
        }
    }
}

/// Forward each line of `stream` to `sink`, decoding invalid UTF-8 lossily.
fn spawn_reader<R>(stream: Option<R>, sink: mpsc::Sender<String>) -> Option<JoinHandle<()>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let stream = stream?;
    Some(tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\r', '\n'])
                        .to_string();
                    if sink.send(line).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "Agent output read failed");
                    break;
                }
            }
        }
    }))
}
