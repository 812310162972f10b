//! Heartbeat scheduler: periodic self-initiated runs on idle sessions.
//!
//! One timer task per configured job. A tick is skipped while the
//! session has an active run, fails fast (with exponential backoff
//! capped at the base cadence) while the transport control channel is
//! degraded, and otherwise submits a run with the heartbeat prompt. An
//! empty reply or the HEARTBEAT_OK token means nothing needed delivery.
//! The last event per session is kept for the status surface.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{HeartbeatJobConfig, parse_cadence};
use crate::delivery::DeliveryDispatcher;
use crate::gateway::ControlState;
use crate::run::{DeliverTarget, RunCoordinator, RunInput, RunOptions, Submission};
use crate::session::{SessionManager, now_ms};

/// Reply token the agent uses to acknowledge a heartbeat with nothing
/// worth delivering.
pub const HEARTBEAT_OK_TOKEN: &str = "HEARTBEAT_OK";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum HeartbeatStatus {
    Sent,
    OkEmpty,
    OkToken,
    Skipped,
    Failed,
}

/// The last heartbeat attempt for a session, exposed to UIs.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct HeartbeatEvent {
    /// Milliseconds since the epoch.
    pub ts: i64,
    pub status: HeartbeatStatus,
}

pub struct HeartbeatScheduler {
    coordinator: RunCoordinator,
    sessions: Arc<SessionManager>,
    delivery: Arc<DeliveryDispatcher>,
    control: Arc<ControlState>,
    last_events: DashMap<String, HeartbeatEvent>,
    /// Wake texts deferred to the next heartbeat tick.
    pending_wakes: Mutex<Vec<String>>,
}

impl HeartbeatScheduler {
    pub fn new(
        coordinator: RunCoordinator,
        sessions: Arc<SessionManager>,
        delivery: Arc<DeliveryDispatcher>,
        control: Arc<ControlState>,
    ) -> Self {
        Self {
            coordinator,
            sessions,
            delivery,
            control,
            last_events: DashMap::new(),
            pending_wakes: Mutex::new(Vec::new()),
        }
    }

    /// Spawn one timer task per job with a parseable cadence.
    pub fn start(self: &Arc<Self>, jobs: &[HeartbeatJobConfig], shutdown: CancellationToken) {
        for job in jobs {
            let Some(every) = parse_cadence(&job.every) else {
                // Already warned at config validation.
                continue;
            };
            let scheduler = Arc::clone(self);
            let job = job.clone();
            let shutdown = shutdown.clone();
            info!(session = %job.session_key, every = %job.every, "Heartbeat job scheduled");
            tokio::spawn(async move {
                scheduler.job_loop(job, every, shutdown).await;
            });
        }
    }

    async fn job_loop(&self, job: HeartbeatJobConfig, every: Duration, shutdown: CancellationToken) {
        let mut backoff: Option<Duration> = None;
        loop {
            let delay = backoff.unwrap_or(every);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            let status = self
                .fire(&job.session_key, &job.prompt, job.model.clone(), &job.target)
                .await;

            backoff = match status {
                HeartbeatStatus::Failed => Some(next_backoff(backoff, every)),
                _ => None,
            };
        }
    }

    /// One heartbeat attempt. Returns and records the resulting status.
    pub async fn fire(
        &self,
        session_key: &str,
        prompt: &str,
        model: Option<String>,
        target: &str,
    ) -> HeartbeatStatus {
        if self.coordinator.is_active(session_key) {
            debug!(session = %session_key, "Heartbeat skipped: run active");
            return self.record(session_key, HeartbeatStatus::Skipped);
        }
        if self.control.is_degraded() {
            warn!(session = %session_key, "Heartbeat failed: control channel degraded");
            return self.record(session_key, HeartbeatStatus::Failed);
        }

        if !self.sessions.contains(session_key) {
            self.sessions.get_or_create(session_key, "", "");
        }

        // Fold any deferred wake texts into this tick's prompt.
        let mut prompt = prompt.to_string();
        let wakes: Vec<String> = {
            let mut pending = self.pending_wakes.lock().expect("wake lock poisoned");
            std::mem::take(&mut *pending)
        };
        if !wakes.is_empty() {
            prompt.push('\n');
            prompt.push_str(&wakes.join("\n"));
        }

        let submission = self
            .coordinator
            .submit_system(
                session_key,
                RunInput::new(prompt, "", ""),
                RunOptions {
                    model,
                    deliver: DeliverTarget::Silent,
                },
            )
            .await;

        let handle = match submission {
            Submission::Started(handle) => handle,
            _ => {
                debug!(session = %session_key, "Heartbeat skipped: session busy");
                return self.record(session_key, HeartbeatStatus::Skipped);
            }
        };

        let summary = handle.wait_complete().await;
        if summary.incomplete {
            return self.record(session_key, HeartbeatStatus::Failed);
        }

        let text = summary.final_text.trim().to_string();
        if text.is_empty() {
            return self.record(session_key, HeartbeatStatus::OkEmpty);
        }
        if text.starts_with(HEARTBEAT_OK_TOKEN) {
            return self.record(session_key, HeartbeatStatus::OkToken);
        }

        self.deliver(session_key, target, &text).await;
        self.record(session_key, HeartbeatStatus::Sent)
    }

    /// Fire an immediate wake against the main session.
    pub async fn wake_now(&self, text: Option<String>) -> HeartbeatStatus {
        let key = self.sessions.main_key().to_string();
        let prompt = match text {
            Some(text) if !text.is_empty() => format!("HEARTBEAT\n{text}"),
            _ => "HEARTBEAT".to_string(),
        };
        self.fire(&key, &prompt, None, "last").await
    }

    /// Defer a wake text to the next heartbeat tick.
    pub fn queue_wake(&self, text: String) {
        self.pending_wakes
            .lock()
            .expect("wake lock poisoned")
            .push(text);
    }

    /// Last attempt per session.
    pub fn last_event(&self, session_key: &str) -> Option<HeartbeatEvent> {
        self.last_events.get(session_key).map(|e| *e.value())
    }

    /// Snapshot of every session's last heartbeat event.
    pub fn snapshot(&self) -> std::collections::HashMap<String, HeartbeatEvent> {
        self.last_events
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    async fn deliver(&self, session_key: &str, target: &str, text: &str) {
        if target == "none" {
            return;
        }
        let Some(address) = self.sessions.address(session_key) else {
            debug!(session = %session_key, "Heartbeat has no delivery address");
            return;
        };
        let surface = if target == "last" { &address.surface } else { target };
        if surface.is_empty() || address.to.is_empty() {
            debug!(session = %session_key, "Heartbeat has no delivery address");
            return;
        }
        self.delivery.send_text(surface, &address.to, text).await;
    }

    fn record(&self, session_key: &str, status: HeartbeatStatus) -> HeartbeatStatus {
        self.last_events.insert(
            session_key.to_string(),
            HeartbeatEvent {
                ts: now_ms(),
                status,
            },
        );
        status
    }
}

/// Exponential backoff after a degraded tick, capped at the base cadence.
fn next_backoff(current: Option<Duration>, every: Duration) -> Duration {
    let floor = (every / 8).max(Duration::from_secs(1));
    match current {
        None => floor.min(every),
        Some(current) => (current * 2).min(every),
    }
}
