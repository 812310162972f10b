//! Per-session input queues for the run coordinator.
//!
//! A session has at most one active run. Inputs that arrive while a run
//! is active are handled by the configured queue policy: steered into the
//! live run, appended as followup turns, collected for a follow-on run,
//! or used to interrupt. A debounce window coalesces rapid-fire inputs
//! before policy evaluation, and a bounded backlog applies the drop rule
//! on overflow.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::config::{DropRule, QueueMode, QueueSettings};

/// One input bound for a session's agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunInput {
    pub text: String,
    /// Surface the input arrived on (empty for system-initiated runs).
    pub surface: String,
    /// Where replies go.
    pub chat_id: String,
}

impl RunInput {
    pub fn new(
        text: impl Into<String>,
        surface: impl Into<String>,
        chat_id: impl Into<String>,
    ) -> Self {
        Self {
            text: text.into(),
            surface: surface.into(),
            chat_id: chat_id.into(),
        }
    }
}

/// How a queued input will be applied. Fixed at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Steer,
    Followup,
    Collect,
}

#[derive(Debug, Clone)]
struct QueuedInput {
    input: RunInput,
    #[allow(dead_code)]
    disposition: Disposition,
    #[allow(dead_code)]
    enqueued_at: Instant,
    /// How many original messages this item stands for (synthetic
    /// summary items cover several).
    represents: usize,
}

/// Outcome of submitting an input to a session queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Session was idle; the caller starts a run with this input.
    StartRun(RunInput),
    /// Forward into the live run as a steer interruption.
    Steer(RunInput),
    /// Forward into the live run as the next user turn.
    Followup(RunInput),
    /// Steer the live run and keep a copy in the backlog for the next run.
    SteerQueued(RunInput),
    /// Held in the backlog until the run ends.
    Queued,
    /// Backlog full and the drop rule is `new`.
    DroppedNew,
    /// Cancel the active run; the input waits in the backlog for the
    /// restart.
    Interrupt,
    /// Held in the debounce buffer; a flush timer will resubmit it.
    Debounced,
}

/// Outcome of draining the backlog after a run ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Nothing pending; the session is idle again.
    Idle,
    /// Start a follow-on run with the combined backlog.
    StartRun(RunInput),
}

struct QueueInner {
    busy: bool,
    backlog: VecDeque<QueuedInput>,
    debounce: Vec<RunInput>,
}

/// Queue state for one session key.
pub struct SessionQueue {
    inner: Mutex<QueueInner>,
}

impl SessionQueue {
    fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                busy: false,
                backlog: VecDeque::new(),
                debounce: Vec::new(),
            }),
        }
    }

    /// Submit an input, bypassing the debounce window.
    pub async fn submit(&self, input: RunInput, mode: QueueMode, cfg: &QueueSettings) -> SubmitOutcome {
        let mut inner = self.inner.lock().await;
        Self::submit_locked(&mut inner, input, mode, cfg)
    }

    fn submit_locked(
        inner: &mut QueueInner,
        input: RunInput,
        mode: QueueMode,
        cfg: &QueueSettings,
    ) -> SubmitOutcome {
        if !inner.busy {
            inner.busy = true;
            return SubmitOutcome::StartRun(input);
        }

        match mode {
            QueueMode::Steer => SubmitOutcome::Steer(input),
            QueueMode::Followup => SubmitOutcome::Followup(input),
            QueueMode::SteerBacklog => {
                match Self::push_backlog(inner, input.clone(), Disposition::Steer, cfg) {
                    BacklogPush::DroppedNew => SubmitOutcome::DroppedNew,
                    _ => SubmitOutcome::SteerQueued(input),
                }
            }
            QueueMode::Collect => {
                match Self::push_backlog(inner, input, Disposition::Collect, cfg) {
                    BacklogPush::DroppedNew => SubmitOutcome::DroppedNew,
                    _ => SubmitOutcome::Queued,
                }
            }
            QueueMode::Interrupt => {
                Self::push_backlog(inner, input, Disposition::Collect, cfg);
                SubmitOutcome::Interrupt
            }
        }
    }

    /// Hold an input in the debounce buffer, or start immediately when the
    /// session is idle and nothing is buffered (no latency for singles).
    ///
    /// Returns the outcome and whether the caller should start the flush
    /// timer (true for the first buffered input).
    pub async fn debounce_or_submit(&self, input: RunInput) -> (SubmitOutcome, bool) {
        let mut inner = self.inner.lock().await;
        if !inner.busy && inner.debounce.is_empty() {
            inner.busy = true;
            return (SubmitOutcome::StartRun(input), false);
        }
        inner.debounce.push(input);
        let start_timer = inner.debounce.len() == 1;
        (SubmitOutcome::Debounced, start_timer)
    }

    /// Coalesce the debounce buffer into one input and submit it.
    pub async fn flush_debounce(&self, mode: QueueMode, cfg: &QueueSettings) -> Option<SubmitOutcome> {
        let mut inner = self.inner.lock().await;
        if inner.debounce.is_empty() {
            return None;
        }
        let combined = coalesce(std::mem::take(&mut inner.debounce));
        Some(Self::submit_locked(&mut inner, combined, mode, cfg))
    }

    /// Drain the backlog after a run ends.
    ///
    /// A non-empty backlog combines (deduplicated, ordered) into the next
    /// run's input and the session stays busy; otherwise it goes idle.
    pub async fn drain(&self, _cfg: &QueueSettings) -> DrainOutcome {
        let mut inner = self.inner.lock().await;
        if inner.backlog.is_empty() {
            inner.busy = false;
            return DrainOutcome::Idle;
        }
        let items: Vec<QueuedInput> = inner.backlog.drain(..).collect();
        DrainOutcome::StartRun(combine_backlog(items))
    }

    /// Mark the session idle (run failed or was torn down without drain).
    pub async fn mark_idle(&self) {
        let mut inner = self.inner.lock().await;
        inner.busy = false;
    }

    pub async fn is_busy(&self) -> bool {
        self.inner.lock().await.busy
    }

    fn push_backlog(
        inner: &mut QueueInner,
        input: RunInput,
        disposition: Disposition,
        cfg: &QueueSettings,
    ) -> BacklogPush {
        let item = QueuedInput {
            input,
            disposition,
            enqueued_at: Instant::now(),
            represents: 1,
        };

        if inner.backlog.len() < cfg.cap {
            inner.backlog.push_back(item);
            return BacklogPush::Queued;
        }

        match cfg.drop {
            DropRule::Old => {
                inner.backlog.pop_front();
                inner.backlog.push_back(item);
                BacklogPush::Queued
            }
            DropRule::New => BacklogPush::DroppedNew,
            DropRule::Summarize => {
                let total: usize =
                    inner.backlog.iter().map(|q| q.represents).sum::<usize>() + item.represents;
                let surface = item.input.surface.clone();
                let chat_id = item.input.chat_id.clone();
                inner.backlog.clear();
                inner.backlog.push_back(QueuedInput {
                    input: RunInput::new(
                        format!("{total} messages arrived while you were busy"),
                        surface,
                        chat_id,
                    ),
                    disposition: Disposition::Collect,
                    enqueued_at: Instant::now(),
                    represents: total,
                });
                BacklogPush::Summarized
            }
        }
    }
}

enum BacklogPush {
    Queued,
    DroppedNew,
    Summarized,
}

/// Join debounced inputs into one, newline-separated, newest address wins.
fn coalesce(inputs: Vec<RunInput>) -> RunInput {
    let mut iter = inputs.into_iter();
    let mut combined = iter.next().expect("coalesce of empty buffer");
    for input in iter {
        combined.text.push('\n');
        combined.text.push_str(&input.text);
        combined.surface = input.surface;
        combined.chat_id = input.chat_id;
    }
    combined
}

/// Concatenate the backlog for a follow-on run: deduplicated, ordered.
fn combine_backlog(items: Vec<QueuedInput>) -> RunInput {
    let mut seen: Vec<String> = Vec::new();
    let mut surface = String::new();
    let mut chat_id = String::new();
    for item in items {
        surface = item.input.surface;
        chat_id = item.input.chat_id;
        if !seen.contains(&item.input.text) {
            seen.push(item.input.text);
        }
    }
    RunInput::new(seen.join("\n"), surface, chat_id)
}

// ============================================================================
// Queue Collection
// ============================================================================

/// Per-session queues, keyed by session key.
#[derive(Clone)]
pub struct SessionQueues {
    queues: Arc<DashMap<String, Arc<SessionQueue>>>,
}

impl SessionQueues {
    pub fn new() -> Self {
        Self {
            queues: Arc::new(DashMap::new()),
        }
    }

    /// Get or create the queue for a session.
    pub fn get(&self, session_key: &str) -> Arc<SessionQueue> {
        self.queues
            .entry(session_key.to_string())
            .or_insert_with(|| Arc::new(SessionQueue::new()))
            .clone()
    }

    /// Whether the session currently has an active run.
    pub async fn is_active(&self, session_key: &str) -> bool {
        match self.queues.get(session_key) {
            Some(queue) => {
                let queue = queue.clone();
                queue.is_busy().await
            }
            None => false,
        }
    }

    /// Spawn a background task that drops queues no one references.
    pub fn spawn_cleanup_task(self, name: &'static str) {
        let cleanup_interval = Duration::from_secs(3600);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cleanup_interval);
            loop {
                ticker.tick().await;
                let stale_keys: Vec<_> = self
                    .queues
                    .iter()
                    .filter(|entry| Arc::strong_count(entry.value()) == 1)
                    .map(|entry| entry.key().clone())
                    .collect();
                let removed = stale_keys.len();
                for key in stale_keys {
                    self.queues.remove(&key);
                }
                if removed > 0 {
                    debug!(
                        removed,
                        remaining = self.queues.len(),
                        queues = name,
                        "Cleaned up idle session queues"
                    );
                }
            }
        });
    }
}

impl Default for SessionQueues {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(mode: QueueMode, cap: usize, drop: DropRule) -> QueueSettings {
        QueueSettings {
            mode,
            debounce_ms: 0,
            cap,
            drop,
            by_surface: Default::default(),
        }
    }

    fn input(text: &str) -> RunInput {
        RunInput::new(text, "telegram", "chat1")
    }

    // ------------------------------------------------------------------------
    // submit
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn idle_session_starts_run() {
        let queue = SessionQueue::new();
        let cfg = settings(QueueMode::Collect, 10, DropRule::Old);
        let outcome = queue.submit(input("a"), cfg.mode, &cfg).await;
        assert_eq!(outcome, SubmitOutcome::StartRun(input("a")));
        assert!(queue.is_busy().await);
    }

    #[tokio::test]
    async fn busy_collect_queues() {
        let queue = SessionQueue::new();
        let cfg = settings(QueueMode::Collect, 10, DropRule::Old);
        queue.submit(input("a"), cfg.mode, &cfg).await;
        assert_eq!(queue.submit(input("b"), cfg.mode, &cfg).await, SubmitOutcome::Queued);
    }

    #[tokio::test]
    async fn busy_steer_passes_through() {
        let queue = SessionQueue::new();
        let cfg = settings(QueueMode::Steer, 10, DropRule::Old);
        queue.submit(input("a"), cfg.mode, &cfg).await;
        assert_eq!(
            queue.submit(input("b"), cfg.mode, &cfg).await,
            SubmitOutcome::Steer(input("b"))
        );
        // Nothing retained: the next drain goes idle.
        assert_eq!(queue.drain(&cfg).await, DrainOutcome::Idle);
    }

    #[tokio::test]
    async fn busy_followup_passes_through() {
        let queue = SessionQueue::new();
        let cfg = settings(QueueMode::Followup, 10, DropRule::Old);
        queue.submit(input("a"), cfg.mode, &cfg).await;
        assert_eq!(
            queue.submit(input("b"), cfg.mode, &cfg).await,
            SubmitOutcome::Followup(input("b"))
        );
    }

    #[tokio::test]
    async fn busy_steer_backlog_steers_and_retains() {
        let queue = SessionQueue::new();
        let cfg = settings(QueueMode::SteerBacklog, 10, DropRule::Old);
        queue.submit(input("a"), cfg.mode, &cfg).await;
        assert_eq!(
            queue.submit(input("b"), cfg.mode, &cfg).await,
            SubmitOutcome::SteerQueued(input("b"))
        );
        match queue.drain(&cfg).await {
            DrainOutcome::StartRun(combined) => assert_eq!(combined.text, "b"),
            other => panic!("expected follow-on run, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn busy_interrupt_requests_cancel() {
        let queue = SessionQueue::new();
        let cfg = settings(QueueMode::Interrupt, 10, DropRule::Old);
        queue.submit(input("a"), cfg.mode, &cfg).await;
        assert_eq!(
            queue.submit(input("b"), cfg.mode, &cfg).await,
            SubmitOutcome::Interrupt
        );
        // The cancelled run's drain restarts with the queued input.
        match queue.drain(&cfg).await {
            DrainOutcome::StartRun(combined) => assert_eq!(combined.text, "b"),
            other => panic!("expected restart, got {other:?}"),
        }
    }

    // ------------------------------------------------------------------------
    // overflow
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn overflow_drop_old_discards_oldest() {
        let queue = SessionQueue::new();
        let cfg = settings(QueueMode::Collect, 2, DropRule::Old);
        queue.submit(input("run"), cfg.mode, &cfg).await;
        queue.submit(input("a"), cfg.mode, &cfg).await;
        queue.submit(input("b"), cfg.mode, &cfg).await;
        assert_eq!(queue.submit(input("c"), cfg.mode, &cfg).await, SubmitOutcome::Queued);
        match queue.drain(&cfg).await {
            DrainOutcome::StartRun(combined) => assert_eq!(combined.text, "b\nc"),
            other => panic!("expected backlog run, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn overflow_drop_new_rejects_incoming() {
        let queue = SessionQueue::new();
        let cfg = settings(QueueMode::Collect, 1, DropRule::New);
        queue.submit(input("run"), cfg.mode, &cfg).await;
        queue.submit(input("a"), cfg.mode, &cfg).await;
        assert_eq!(
            queue.submit(input("b"), cfg.mode, &cfg).await,
            SubmitOutcome::DroppedNew
        );
    }

    #[tokio::test]
    async fn overflow_summarize_collapses_backlog() {
        let queue = SessionQueue::new();
        let cfg = settings(QueueMode::Collect, 2, DropRule::Summarize);
        queue.submit(input("run"), cfg.mode, &cfg).await;
        queue.submit(input("a"), cfg.mode, &cfg).await;
        queue.submit(input("b"), cfg.mode, &cfg).await;
        queue.submit(input("c"), cfg.mode, &cfg).await;
        match queue.drain(&cfg).await {
            DrainOutcome::StartRun(combined) => {
                assert_eq!(combined.text, "3 messages arrived while you were busy");
            }
            other => panic!("expected synthetic summary, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn summarize_counts_accumulate_across_collapses() {
        let queue = SessionQueue::new();
        let cfg = settings(QueueMode::Collect, 1, DropRule::Summarize);
        queue.submit(input("run"), cfg.mode, &cfg).await;
        queue.submit(input("a"), cfg.mode, &cfg).await;
        queue.submit(input("b"), cfg.mode, &cfg).await; // collapse: 2
        queue.submit(input("c"), cfg.mode, &cfg).await; // collapse: 3
        match queue.drain(&cfg).await {
            DrainOutcome::StartRun(combined) => {
                assert_eq!(combined.text, "3 messages arrived while you were busy");
            }
            other => panic!("expected synthetic summary, got {other:?}"),
        }
    }

    // ------------------------------------------------------------------------
    // drain
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn drain_empty_backlog_goes_idle() {
        let queue = SessionQueue::new();
        let cfg = settings(QueueMode::Collect, 10, DropRule::Old);
        queue.submit(input("run"), cfg.mode, &cfg).await;
        assert_eq!(queue.drain(&cfg).await, DrainOutcome::Idle);
        assert!(!queue.is_busy().await);
    }

    #[tokio::test]
    async fn drain_deduplicates_ordered() {
        let queue = SessionQueue::new();
        let cfg = settings(QueueMode::Collect, 10, DropRule::Old);
        queue.submit(input("run"), cfg.mode, &cfg).await;
        queue.submit(input("a"), cfg.mode, &cfg).await;
        queue.submit(input("b"), cfg.mode, &cfg).await;
        queue.submit(input("a"), cfg.mode, &cfg).await;
        match queue.drain(&cfg).await {
            DrainOutcome::StartRun(combined) => assert_eq!(combined.text, "a\nb"),
            other => panic!("expected backlog run, got {other:?}"),
        }
        // Still busy: the follow-on run owns the session.
        assert!(queue.is_busy().await);
    }

    // ------------------------------------------------------------------------
    // debounce
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn debounce_idle_single_message_has_no_latency() {
        let queue = SessionQueue::new();
        let cfg = settings(QueueMode::Collect, 10, DropRule::Old);
        let (outcome, start_timer) = queue.debounce_or_submit(input("a")).await;
        assert_eq!(outcome, SubmitOutcome::StartRun(input("a")));
        assert!(!start_timer);
    }

    #[tokio::test]
    async fn debounce_buffers_while_busy_and_coalesces() {
        let queue = SessionQueue::new();
        let cfg = settings(QueueMode::Collect, 10, DropRule::Old);
        queue.submit(input("run"), cfg.mode, &cfg).await;

        let (o1, t1) = queue.debounce_or_submit(input("a")).await;
        assert_eq!(o1, SubmitOutcome::Debounced);
        assert!(t1);
        let (o2, t2) = queue.debounce_or_submit(input("b")).await;
        assert_eq!(o2, SubmitOutcome::Debounced);
        assert!(!t2);

        let flushed = queue.flush_debounce(cfg.mode, &cfg).await;
        assert_eq!(flushed, Some(SubmitOutcome::Queued));
        match queue.drain(&cfg).await {
            DrainOutcome::StartRun(combined) => assert_eq!(combined.text, "a\nb"),
            other => panic!("expected coalesced input, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn flush_empty_debounce_is_none() {
        let queue = SessionQueue::new();
        let cfg = settings(QueueMode::Collect, 10, DropRule::Old);
        assert_eq!(queue.flush_debounce(cfg.mode, &cfg).await, None);
    }

    #[tokio::test]
    async fn flush_on_idle_session_starts_run() {
        let queue = SessionQueue::new();
        let cfg = settings(QueueMode::Collect, 10, DropRule::Old);
        queue.submit(input("run"), cfg.mode, &cfg).await;
        queue.debounce_or_submit(input("late")).await;
        // Run ends before the debounce window fires.
        queue.drain(&cfg).await;
        let flushed = queue.flush_debounce(cfg.mode, &cfg).await;
        assert_eq!(flushed, Some(SubmitOutcome::StartRun(input("late"))));
    }

    // ------------------------------------------------------------------------
    // queue collection
    // ------------------------------------------------------------------------

    #[test]
    fn queues_get_returns_same_queue_for_same_session() {
        let queues = SessionQueues::new();
        let q1 = queues.get("s1");
        let q2 = queues.get("s1");
        assert!(Arc::ptr_eq(&q1, &q2));
    }

    #[tokio::test]
    async fn is_active_tracks_busy_flag() {
        let queues = SessionQueues::new();
        assert!(!queues.is_active("s1").await);
        let cfg = settings(QueueMode::Collect, 10, DropRule::Old);
        let q = queues.get("s1");
        q.submit(input("a"), cfg.mode, &cfg).await;
        assert!(queues.is_active("s1").await);
    }
}
