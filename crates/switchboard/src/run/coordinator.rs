//! Run coordination: one active run per session, bounded concurrency.
//!
//! `submit` resolves the session's queue policy, spawns runs under the
//! global concurrency cap (excess submissions queue FIFO on the
//! semaphore), forwards steer/followup inputs into live runs, and drains
//! the backlog into follow-on runs when a run ends. Each run carries a
//! cancellation token and a deadline; cancellation flushes buffered
//! output as a terminal block and releases the session.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::config::{QueueMode, QueueSettings, ReplyConfig, RunLimits};
use crate::delivery::DeliveryDispatcher;
use crate::session::SessionManager;

use super::events::{RunRequest, RunnerInput};
use super::queue::{DrainOutcome, RunInput, SessionQueues, SubmitOutcome};
use super::runner::AgentRunner;
use super::subscriber::{EventSubscriber, ReplyEvent};

/// Where a run's output is delivered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DeliverTarget {
    /// The surface/chat the triggering input came from (or the session's
    /// recorded address for system-initiated runs).
    #[default]
    Origin,
    /// Suppress delivery; the caller consumes the summary itself.
    Silent,
    /// A fixed destination.
    To { surface: String, to: String },
}

/// Options for a run submission.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub model: Option<String>,
    pub deliver: DeliverTarget,
}

/// What a completed run produced, for waiters.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub final_text: String,
    pub incomplete: bool,
    pub compaction_retries: u32,
}

/// Handle to an in-flight run.
///
/// `wait_complete` resolves exactly once per logical run: after
/// `agent_end`, with all compaction retries drained.
#[derive(Debug)]
pub struct RunHandle {
    pub run_id: String,
    cancel: CancellationToken,
    done: watch::Receiver<Option<RunSummary>>,
}

impl RunHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn wait_complete(mut self) -> RunSummary {
        loop {
            if let Some(summary) = self.done.borrow_and_update().clone() {
                return summary;
            }
            if self.done.changed().await.is_err() {
                return RunSummary {
                    incomplete: true,
                    ..Default::default()
                };
            }
        }
    }
}

/// Result of a submission, for callers that want to ack or report.
#[derive(Debug)]
pub enum Submission {
    /// A run started; the handle observes it.
    Started(RunHandle),
    /// Forwarded into the live run (steer or followup).
    Forwarded,
    /// Held in the backlog for the next run.
    Queued,
    /// Held in the debounce window.
    Debounced,
    /// Dropped by the backlog `new` rule.
    Dropped,
    /// The active run was cancelled; the input restarts the session.
    Interrupted,
}

struct ActiveRun {
    run_id: String,
    cancel: CancellationToken,
    inputs: mpsc::Sender<RunnerInput>,
}

struct CoordinatorInner {
    runner: Arc<dyn AgentRunner>,
    sessions: Arc<SessionManager>,
    delivery: Arc<DeliveryDispatcher>,
    queues: SessionQueues,
    queue_cfg: QueueSettings,
    limits: RunLimits,
    reply_cfg: ReplyConfig,
    default_model: Option<String>,
    semaphore: Arc<Semaphore>,
    active: DashMap<String, ActiveRun>,
    shutdown: CancellationToken,
    /// Set while shutting down: no follow-on runs start.
    draining: AtomicBool,
}

#[derive(Clone)]
pub struct RunCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl RunCoordinator {
    pub fn new(
        runner: Arc<dyn AgentRunner>,
        sessions: Arc<SessionManager>,
        delivery: Arc<DeliveryDispatcher>,
        queue_cfg: QueueSettings,
        limits: RunLimits,
        reply_cfg: ReplyConfig,
        default_model: Option<String>,
    ) -> Self {
        let queues = SessionQueues::new();
        queues.clone().spawn_cleanup_task("run_session_queues");

        Self {
            inner: Arc::new(CoordinatorInner {
                runner,
                sessions,
                delivery,
                queues,
                semaphore: Arc::new(Semaphore::new(limits.max_concurrent.max(1))),
                queue_cfg,
                limits,
                reply_cfg,
                default_model,
                active: DashMap::new(),
                shutdown: CancellationToken::new(),
                draining: AtomicBool::new(false),
            }),
        }
    }

    /// Submit a transport input. Applies the debounce window and the
    /// surface's queue policy; replies deliver to the input's origin.
    pub async fn submit(&self, session_key: &str, input: RunInput) -> Submission {
        let mode = self.inner.queue_cfg.mode_for(&input.surface);
        let queue = self.inner.queues.get(session_key);

        let (outcome, start_timer) = if self.inner.queue_cfg.debounce_ms > 0 {
            queue.debounce_or_submit(input).await
        } else {
            (
                queue.submit(input, mode, &self.inner.queue_cfg).await,
                false,
            )
        };

        if start_timer {
            let coordinator = self.clone();
            let key = session_key.to_string();
            let window = Duration::from_millis(self.inner.queue_cfg.debounce_ms);
            tokio::spawn(async move {
                tokio::time::sleep(window).await;
                let queue = coordinator.inner.queues.get(&key);
                if let Some(outcome) = queue
                    .flush_debounce(mode, &coordinator.inner.queue_cfg)
                    .await
                {
                    coordinator
                        .apply_outcome(&key, outcome, RunOptions::default())
                        .await;
                }
            });
        }

        self.apply_outcome(session_key, outcome, RunOptions::default())
            .await
    }

    /// Submit a system-initiated run (heartbeat, webhook), bypassing the
    /// debounce window.
    pub async fn submit_system(
        &self,
        session_key: &str,
        input: RunInput,
        opts: RunOptions,
    ) -> Submission {
        let mode = self.inner.queue_cfg.mode_for(&input.surface);
        let queue = self.inner.queues.get(session_key);
        let outcome = queue.submit(input, mode, &self.inner.queue_cfg).await;
        self.apply_outcome(session_key, outcome, opts).await
    }

    /// Whether the session has an in-flight run.
    pub fn is_active(&self, session_key: &str) -> bool {
        self.inner.active.contains_key(session_key)
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.len()
    }

    /// Cancel the active run for a session, if any.
    pub fn cancel_session(&self, session_key: &str) -> bool {
        match self.inner.active.get(session_key) {
            Some(active) => {
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Graceful shutdown: stop accepting follow-on runs, give active runs
    /// a bounded grace period, then cancel the stragglers.
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.draining.store(true, Ordering::Relaxed);
        let deadline = Instant::now() + grace;
        while !self.inner.active.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        if !self.inner.active.is_empty() {
            info!(
                remaining = self.inner.active.len(),
                "Cancelling runs still active at shutdown"
            );
        }
        self.inner.shutdown.cancel();
        // Give the flush path a moment.
        let flush_deadline = Instant::now() + Duration::from_secs(2);
        while !self.inner.active.is_empty() && Instant::now() < flush_deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn apply_outcome(
        &self,
        session_key: &str,
        outcome: SubmitOutcome,
        opts: RunOptions,
    ) -> Submission {
        match outcome {
            SubmitOutcome::StartRun(input) => {
                Submission::Started(spawn_run(self.inner.clone(), session_key, input, opts))
            }
            SubmitOutcome::Steer(input) => {
                self.forward(session_key, input, true).await;
                Submission::Forwarded
            }
            SubmitOutcome::Followup(input) => {
                self.forward(session_key, input, false).await;
                Submission::Forwarded
            }
            SubmitOutcome::SteerQueued(input) => {
                self.forward(session_key, input, true).await;
                Submission::Forwarded
            }
            SubmitOutcome::Queued => Submission::Queued,
            SubmitOutcome::Debounced => Submission::Debounced,
            SubmitOutcome::DroppedNew => {
                debug!(session = %session_key, "Input dropped by backlog policy");
                Submission::Dropped
            }
            SubmitOutcome::Interrupt => {
                if let Some(active) = self.inner.active.get(session_key) {
                    info!(
                        session = %session_key,
                        run_id = %active.run_id,
                        "Interrupting active run"
                    );
                    active.cancel.cancel();
                }
                Submission::Interrupted
            }
        }
    }

    /// Forward an input into the live run; falls back to a fresh
    /// submission when the run ended in the meantime.
    async fn forward(&self, session_key: &str, input: RunInput, steer: bool) {
        let tx = self
            .inner
            .active
            .get(session_key)
            .map(|a| a.inputs.clone());

        let message = if steer {
            RunnerInput::Steer {
                text: input.text.clone(),
            }
        } else {
            RunnerInput::Followup {
                text: input.text.clone(),
            }
        };

        let delivered = match tx {
            Some(tx) => tx.send(message).await.is_ok(),
            None => false,
        };

        if delivered {
            self.inner
                .sessions
                .append_history(session_key, "user", &input.text);
        } else {
            debug!(session = %session_key, "Live run gone, resubmitting input");
            let queue = self.inner.queues.get(session_key);
            let outcome = queue
                .submit(input, QueueMode::Collect, &self.inner.queue_cfg)
                .await;
            if let SubmitOutcome::StartRun(next) = outcome {
                spawn_run(self.inner.clone(), session_key, next, RunOptions::default());
            }
        }
    }
}

/// Start a run task for a session. The queue has already marked the
/// session busy; this installs the active entry and spawns the worker.
fn spawn_run(
    inner: Arc<CoordinatorInner>,
    session_key: &str,
    input: RunInput,
    opts: RunOptions,
) -> RunHandle {
    let run_id = Ulid::new().to_string();
    let cancel = inner.shutdown.child_token();
    let (done_tx, done_rx) = watch::channel(None);
    let (fwd_tx, fwd_rx) = mpsc::channel(32);

    inner.active.insert(
        session_key.to_string(),
        ActiveRun {
            run_id: run_id.clone(),
            cancel: cancel.clone(),
            inputs: fwd_tx,
        },
    );

    let handle = RunHandle {
        run_id: run_id.clone(),
        cancel: cancel.clone(),
        done: done_rx,
    };

    let key = session_key.to_string();
    tokio::spawn(run_task(
        inner, key, input, opts, run_id, cancel, done_tx, fwd_rx,
    ));

    handle
}

#[allow(clippy::too_many_arguments)]
async fn run_task(
    inner: Arc<CoordinatorInner>,
    key: String,
    input: RunInput,
    opts: RunOptions,
    run_id: String,
    cancel: CancellationToken,
    done_tx: watch::Sender<Option<RunSummary>>,
    mut fwd_rx: mpsc::Receiver<RunnerInput>,
) {
    // Global cap: excess runs wait their turn here, FIFO.
    let permit = tokio::select! {
        _ = cancel.cancelled() => None,
        permit = inner.semaphore.clone().acquire_owned() => permit.ok(),
    };
    let Some(_permit) = permit else {
        finish_run(&inner, &key, &run_id, &done_tx, RunSummary {
            incomplete: true,
            ..Default::default()
        });
        inner.queues.get(&key).mark_idle().await;
        return;
    };

    inner.sessions.record_run(&key);
    let history = inner.sessions.history(&key);
    inner.sessions.append_history(&key, "user", &input.text);

    let request = RunRequest {
        run_id: run_id.clone(),
        session_key: key.clone(),
        prompt: input.text.clone(),
        history,
        model: opts.model.clone().or_else(|| inner.default_model.clone()),
    };

    debug!(session = %key, run_id = %run_id, "Run starting");

    let mut running = match inner.runner.start(request, cancel.clone()).await {
        Ok(running) => running,
        Err(e) => {
            error!(session = %key, run_id = %run_id, error = %e, "Failed to start run");
            finish_run(&inner, &key, &run_id, &done_tx, RunSummary {
                incomplete: true,
                ..Default::default()
            });
            inner.queues.get(&key).mark_idle().await;
            return;
        }
    };

    // Delivery target for subscriber output.
    let target: Option<(String, String)> = match &opts.deliver {
        DeliverTarget::Silent => None,
        DeliverTarget::To { surface, to } => Some((surface.clone(), to.clone())),
        DeliverTarget::Origin => {
            if input.surface.is_empty() {
                inner.sessions.address(&key).map(|a| (a.surface, a.to))
            } else {
                Some((input.surface.clone(), input.chat_id.clone()))
            }
        }
    };

    let mut subscriber = EventSubscriber::new(inner.reply_cfg.clone());
    let deadline = Instant::now() + Duration::from_secs(inner.limits.timeout_seconds.max(1));
    let mut fwd_open = true;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let replies = subscriber.flush_cancelled();
                deliver_all(&inner, &target, &replies).await;
                break;
            }
            _ = tokio::time::sleep_until(deadline) => {
                warn!(
                    session = %key,
                    run_id = %run_id,
                    timeout_seconds = inner.limits.timeout_seconds,
                    "Run deadline exceeded, cancelling"
                );
                cancel.cancel();
                let replies = subscriber.flush_cancelled();
                deliver_all(&inner, &target, &replies).await;
                break;
            }
            forwarded = fwd_rx.recv(), if fwd_open => match forwarded {
                Some(message) => {
                    if running.inputs.send(message).await.is_err() {
                        debug!(session = %key, "Run input channel closed");
                        fwd_open = false;
                    }
                }
                None => fwd_open = false,
            },
            event = running.events.next() => match event {
                Some(event) => {
                    let is_end = matches!(event, super::events::AgentEvent::AgentEnd);
                    let replies = subscriber.handle_event(&event);
                    deliver_all(&inner, &target, &replies).await;
                    if is_end {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    let outcome = subscriber.finish();
    for text in &outcome.assistant_texts {
        inner.sessions.append_history(&key, "assistant", text);
    }

    let summary = RunSummary {
        final_text: outcome.final_text(),
        incomplete: outcome.incomplete,
        compaction_retries: outcome.compaction_retries,
    };
    debug!(
        session = %key,
        run_id = %run_id,
        incomplete = summary.incomplete,
        retries = summary.compaction_retries,
        "Run finished"
    );
    finish_run(&inner, &key, &run_id, &done_tx, summary);

    // Drain the backlog into a follow-on run, unless shutting down.
    match inner.queues.get(&key).drain(&inner.queue_cfg).await {
        DrainOutcome::Idle => {}
        DrainOutcome::StartRun(next) => {
            if inner.draining.load(Ordering::Relaxed) {
                inner.queues.get(&key).mark_idle().await;
            } else {
                spawn_run(inner.clone(), &key, next, RunOptions::default());
            }
        }
    }
}

fn finish_run(
    inner: &Arc<CoordinatorInner>,
    key: &str,
    run_id: &str,
    done_tx: &watch::Sender<Option<RunSummary>>,
    summary: RunSummary,
) {
    let _ = done_tx.send(Some(summary));
    inner
        .active
        .remove_if(key, |_, active| active.run_id == run_id);
}

async fn deliver_all(
    inner: &Arc<CoordinatorInner>,
    target: &Option<(String, String)>,
    replies: &[ReplyEvent],
) {
    let Some((surface, chat_id)) = target else {
        return;
    };
    for reply in replies {
        inner.delivery.dispatch(surface, chat_id, reply).await;
    }
}
