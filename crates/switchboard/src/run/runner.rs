//! Agent runner boundary.
//!
//! The embedded coding agent is an external collaborator. [`AgentRunner`]
//! abstracts it as: one request in, a stream of [`AgentEvent`]s out, with
//! steer/followup inputs injectable while the run is live. The event feed
//! is a [`futures::Stream`], consumed by a single owner.
//!
//! [`SubprocessRunner`] is the shipped implementation: one agent process
//! per run, the request as a JSON line on stdin, events as JSON Lines on
//! stdout, further inputs as additional stdin lines. Cancellation kills
//! the process; on Linux the child also dies with the daemon via
//! PR_SET_PDEATHSIG.

use std::pin::Pin;
use std::process::Stdio;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::AgentConfig;

use super::events::{AgentEvent, RunRequest, RunnerInput};

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("agent runner not configured (agent.command is empty)")]
    NotConfigured,

    #[error("failed to spawn agent process: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("failed to encode run request: {0}")]
    Encode(String),
}

/// The event feed of one run; ends when the run ends.
pub type AgentEventStream = Pin<Box<dyn Stream<Item = AgentEvent> + Send>>;

/// Adapt a channel of events into the stream form runs are consumed as.
pub fn event_stream(rx: mpsc::Receiver<AgentEvent>) -> AgentEventStream {
    Box::pin(futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (event, rx))
    }))
}

/// A live agent run: its event stream and input channel.
pub struct RunningAgent {
    pub events: AgentEventStream,
    pub inputs: mpsc::Sender<RunnerInput>,
}

#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Start a run. The returned event stream closes when the run ends;
    /// cancelling the token tears the run down.
    async fn start(
        &self,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> Result<RunningAgent, RunnerError>;
}

/// Spawns one agent process per run.
pub struct SubprocessRunner {
    config: AgentConfig,
}

impl SubprocessRunner {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    fn spawn_child(&self) -> std::io::Result<tokio::process::Child> {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        // On Linux, ensure the agent dies when the daemon dies.
        #[cfg(target_os = "linux")]
        unsafe {
            cmd.pre_exec(|| {
                // PR_SET_PDEATHSIG = 1, SIGTERM = 15
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        cmd.spawn()
    }
}

#[async_trait]
impl AgentRunner for SubprocessRunner {
    async fn start(
        &self,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> Result<RunningAgent, RunnerError> {
        if self.config.command.is_empty() {
            return Err(RunnerError::NotConfigured);
        }

        let mut child = self.spawn_child()?;
        let mut stdin = child.stdin.take().expect("stdin should be piped");
        let stdout = child.stdout.take().expect("stdout should be piped");

        let request_line =
            serde_json::to_string(&request).map_err(|e| RunnerError::Encode(e.to_string()))?;
        stdin.write_all(request_line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;

        let (evt_tx, evt_rx) = mpsc::channel(128);
        let (input_tx, mut input_rx) = mpsc::channel::<RunnerInput>(32);
        let run_id = request.run_id.clone();

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut inputs_open = true;
            let mut saw_end = false;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(run_id = %run_id, "Run cancelled, killing agent process");
                        let _ = child.start_kill();
                        break;
                    }
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            let trimmed = line.trim();
                            if trimmed.is_empty() {
                                continue;
                            }
                            let event = match serde_json::from_str::<AgentEvent>(trimmed) {
                                Ok(event) => event,
                                Err(e) => {
                                    warn!(run_id = %run_id, error = %e,
                                        "Skipping malformed agent event");
                                    continue;
                                }
                            };
                            let is_end = matches!(event, AgentEvent::AgentEnd);
                            if evt_tx.send(event).await.is_err() {
                                debug!(run_id = %run_id, "Event consumer gone");
                                let _ = child.start_kill();
                                break;
                            }
                            if is_end {
                                saw_end = true;
                                break;
                            }
                        }
                        Ok(None) => {
                            if !saw_end {
                                let _ = evt_tx
                                    .send(AgentEvent::StreamError {
                                        message: "agent process exited before agent_end"
                                            .to_string(),
                                    })
                                    .await;
                            }
                            break;
                        }
                        Err(e) => {
                            warn!(run_id = %run_id, error = %e, "Agent stdout read error");
                            break;
                        }
                    },
                    maybe_input = input_rx.recv(), if inputs_open => match maybe_input {
                        Some(input) => {
                            let line = match serde_json::to_string(&input) {
                                Ok(line) => line,
                                Err(e) => {
                                    warn!(run_id = %run_id, error = %e,
                                        "Failed to encode runner input");
                                    continue;
                                }
                            };
                            if stdin.write_all(line.as_bytes()).await.is_err()
                                || stdin.write_all(b"\n").await.is_err()
                                || stdin.flush().await.is_err()
                            {
                                warn!(run_id = %run_id, "Agent stdin closed, dropping input");
                                inputs_open = false;
                            }
                        }
                        None => inputs_open = false,
                    },
                }
            }

            drop(stdin);
            let _ = child.wait().await;
        });

        Ok(RunningAgent {
            events: event_stream(evt_rx),
            inputs: input_tx,
        })
    }
}
