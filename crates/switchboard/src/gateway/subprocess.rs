//! Subprocess driver spawner and supervisor.
//!
//! Spawns external transport-driver processes and supervises them with
//! restart policies, jittered exponential backoff, and cleanup when the
//! parent dies. Drivers speak the gateway protocol as JSON Lines over
//! stdio.

use std::process::Stdio;
use std::time::Duration;

use rand::Rng;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use switchboard_gateway_protocol::{GatewayCommand, GatewayEvent};

use crate::config::{ExternalGatewayConfig, RestartPolicy};

/// Supervisor for a subprocess driver.
pub struct SubprocessGateway {
    config: ExternalGatewayConfig,
}

impl SubprocessGateway {
    pub fn new(config: ExternalGatewayConfig) -> Self {
        Self { config }
    }

    /// Run the driver with supervision.
    ///
    /// Spawns the subprocess, bridges its stdio to the provided channels,
    /// and restarts it per the configured restart policy. Sessions are
    /// never touched from here; a dead driver only stops its own surface.
    pub async fn run(
        self,
        evt_tx: mpsc::Sender<GatewayEvent>,
        mut cmd_rx: mpsc::Receiver<GatewayCommand>,
    ) {
        let mut attempts = 0u32;
        let mut backoff = Duration::from_secs(1);
        const MAX_ATTEMPTS: u32 = 5;
        const MAX_BACKOFF: Duration = Duration::from_secs(60);

        loop {
            attempts += 1;
            info!(
                surface = %self.config.name,
                attempt = attempts,
                command = %self.config.command,
                "Spawning driver subprocess"
            );

            let child = match self.spawn_child() {
                Ok(child) => child,
                Err(e) => {
                    error!(
                        surface = %self.config.name,
                        error = %e,
                        "Failed to spawn driver"
                    );
                    if !self.should_restart(attempts, MAX_ATTEMPTS, false) {
                        let _ = evt_tx
                            .send(GatewayEvent::Error {
                                code: "spawn_failed".to_string(),
                                message: e.to_string(),
                                fatal: true,
                            })
                            .await;
                        return;
                    }
                    tokio::time::sleep(jittered(backoff)).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            };

            let (exit_success, got_ready) = self.run_subprocess(child, &evt_tx, &mut cmd_rx).await;

            // A successful Ready resets the restart counter.
            if got_ready {
                attempts = 0;
                backoff = Duration::from_secs(1);
            }

            if !self.should_restart(attempts, MAX_ATTEMPTS, exit_success) {
                info!(surface = %self.config.name, "Driver subprocess stopped");
                let _ = evt_tx
                    .send(GatewayEvent::Shutdown {
                        reason: "subprocess exited".to_string(),
                    })
                    .await;
                return;
            }

            warn!(
                surface = %self.config.name,
                backoff_secs = backoff.as_secs(),
                "Restarting driver subprocess"
            );
            tokio::time::sleep(jittered(backoff)).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    fn spawn_child(&self) -> std::io::Result<Child> {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        // On Linux, ensure the driver dies when the daemon dies.
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

    /// Bridge the subprocess stdio to the channels.
    ///
    /// Returns (exit_success, got_ready).
    async fn run_subprocess(
        &self,
        mut child: Child,
        evt_tx: &mpsc::Sender<GatewayEvent>,
        cmd_rx: &mut mpsc::Receiver<GatewayCommand>,
    ) -> (bool, bool) {
        let mut stdin = child.stdin.take().expect("stdin should be piped");
        let stdout = child.stdout.take().expect("stdout should be piped");
        let mut stdout_reader = BufReader::new(stdout).lines();

        let mut got_ready = false;
        let surface = self.config.name.clone();

        loop {
            tokio::select! {
                line = stdout_reader.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            match serde_json::from_str::<GatewayEvent>(&line) {
                                Ok(event) => {
                                    if matches!(event, GatewayEvent::Ready { .. }) {
                                        got_ready = true;
                                    }
                                    if matches!(event, GatewayEvent::Shutdown { .. }) {
                                        let _ = evt_tx.send(event).await;
                                        break;
                                    }
                                    if evt_tx.send(event).await.is_err() {
                                        debug!(surface = %surface, "Event channel closed");
                                        break;
                                    }
                                }
                                Err(e) => {
                                    warn!(
                                        surface = %surface,
                                        error = %e,
                                        "Skipping malformed driver event"
                                    );
                                }
                            }
                        }
                        Ok(None) => {
                            debug!(surface = %surface, "Driver stdout closed");
                            break;
                        }
                        Err(e) => {
                            warn!(surface = %surface, error = %e, "Driver stdout read error");
                            break;
                        }
                    }
                }
                command = cmd_rx.recv() => {
                    match command {
                        Some(command) => {
                            let is_shutdown = matches!(command, GatewayCommand::Shutdown);
                            match serde_json::to_string(&command) {
                                Ok(line) => {
                                    if stdin.write_all(line.as_bytes()).await.is_err()
                                        || stdin.write_all(b"\n").await.is_err()
                                        || stdin.flush().await.is_err()
                                    {
                                        warn!(surface = %surface, "Driver stdin closed");
                                        break;
                                    }
                                }
                                Err(e) => {
                                    warn!(surface = %surface, error = %e,
                                        "Failed to encode driver command");
                                }
                            }
                            if is_shutdown {
                                break;
                            }
                        }
                        None => {
                            debug!(surface = %surface, "Command channel closed");
                            break;
                        }
                    }
                }
            }
        }

        drop(stdin);
        let exit_success = match child.wait().await {
            Ok(status) => status.success(),
            Err(_) => false,
        };
        (exit_success, got_ready)
    }

    fn should_restart(&self, attempts: u32, max_attempts: u32, exit_success: bool) -> bool {
        if attempts >= max_attempts {
            return false;
        }
        match self.config.restart {
            RestartPolicy::Always => true,
            RestartPolicy::OnFailure => !exit_success,
            RestartPolicy::Never => false,
        }
    }
}

/// Add up to 25% random jitter so restarting drivers do not stampede.
fn jittered(base: Duration) -> Duration {
    let jitter = rand::rng().random_range(0.0..0.25);
    base.mul_f64(1.0 + jitter)
}
