//! Session table ownership: key derivation, lifecycle, idle expiry.
//!
//! The manager is the only component that mutates the table. The run
//! coordinator reads history snapshots and reports run activity through
//! the methods here; transports never touch sessions directly.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, info};

use switchboard_gateway_protocol::{ChatType, InboundMessage};

use crate::config::{SessionConfig, SessionScope};

use super::store::{HistoryEntry, SessionDocument, SessionEntry, SessionStore};

/// Minimum spacing between idle sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Milliseconds since the epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Identity of a session for delivery purposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionAddress {
    pub surface: String,
    pub to: String,
}

pub struct SessionManager {
    cfg: SessionConfig,
    table: DashMap<String, SessionEntry>,
    store: SessionStore,
    last_sweep: Mutex<Option<Instant>>,
}

impl SessionManager {
    /// Build the manager, seeding the table from the recovered document.
    ///
    /// Entries already past their idle deadline stay on disk but are not
    /// loaded into the live table.
    pub fn new(cfg: SessionConfig, store: SessionStore, recovered: SessionDocument) -> Self {
        let idle_ms = cfg.idle_minutes as i64 * 60_000;
        let now = now_ms();
        let table = DashMap::new();
        let mut skipped = 0usize;
        for (key, entry) in recovered {
            if now - entry.updated_at <= idle_ms {
                table.insert(key, entry);
            } else {
                skipped += 1;
            }
        }
        if !table.is_empty() || skipped > 0 {
            info!(
                recovered = table.len(),
                skipped_idle = skipped,
                "Recovered sessions from store"
            );
        }
        Self {
            cfg,
            table,
            store,
            last_sweep: Mutex::new(None),
        }
    }

    /// Derive the session key for an inbound message per the configured scope.
    pub fn resolve_key(&self, msg: &InboundMessage) -> String {
        match self.cfg.scope {
            SessionScope::PerSender => format!("{}:{}", msg.surface, msg.from),
            SessionScope::PerGroup => match msg.chat_type {
                ChatType::Group => format!("{}:group:{}", msg.surface, msg.group_key()),
                ChatType::Direct => format!("{}:{}", msg.surface, msg.from),
            },
            SessionScope::Global => self.cfg.main_key.clone(),
        }
    }

    /// The key used by wakes and the global scope.
    pub fn main_key(&self) -> &str {
        &self.cfg.main_key
    }

    /// Look up or create the session for a key. Returns whether it was created.
    pub fn get_or_create(&self, key: &str, surface: &str, to: &str) -> bool {
        let now = now_ms();
        let mut is_new = false;
        let mut entry = self.table.entry(key.to_string()).or_insert_with(|| {
            is_new = true;
            SessionEntry {
                surface: surface.to_string(),
                to: to.to_string(),
                created_at: now,
                updated_at: now,
                last_run_at: None,
                history: Vec::new(),
            }
        });
        if !is_new {
            // Delivery follows the most recent transport address.
            entry.surface = surface.to_string();
            entry.to = to.to_string();
            entry.updated_at = now;
        }
        let snapshot = entry.clone();
        drop(entry);
        self.store.upsert(key, snapshot);
        if is_new {
            debug!(key = %key, surface = %surface, "Created session");
        }
        is_new
    }

    /// Whether a session exists for the key.
    pub fn contains(&self, key: &str) -> bool {
        self.table.contains_key(key)
    }

    /// True when the body, trimmed, equals a configured reset trigger.
    pub fn is_reset_trigger(&self, body: &str) -> bool {
        let trimmed = body.trim();
        self.cfg.reset_triggers.iter().any(|t| t == trimmed)
    }

    /// Drop the session for a key. Returns whether one existed.
    pub fn reset(&self, key: &str) -> bool {
        let existed = self.table.remove(key).is_some();
        if existed {
            self.store.remove(key);
            info!(key = %key, "Session reset");
        }
        existed
    }

    /// Append a message to the session's bounded history.
    pub fn append_history(&self, key: &str, role: &str, content: &str) {
        let Some(mut entry) = self.table.get_mut(key) else {
            return;
        };
        let now = now_ms();
        entry.history.push(HistoryEntry {
            role: role.to_string(),
            content: content.to_string(),
            ts: now,
        });
        let limit = self.cfg.history_limit;
        if entry.history.len() > limit {
            let excess = entry.history.len() - limit;
            entry.history.drain(..excess);
        }
        entry.updated_at = now;
        let snapshot = entry.clone();
        drop(entry);
        self.store.upsert(key, snapshot);
    }

    /// Record that a run started against the session.
    pub fn record_run(&self, key: &str) {
        if let Some(mut entry) = self.table.get_mut(key) {
            let now = now_ms();
            entry.last_run_at = Some(now);
            entry.updated_at = now;
            let snapshot = entry.clone();
            drop(entry);
            self.store.upsert(key, snapshot);
        }
    }

    /// Snapshot of a session's history, oldest first.
    pub fn history(&self, key: &str) -> Vec<HistoryEntry> {
        self.table
            .get(key)
            .map(|e| e.history.clone())
            .unwrap_or_default()
    }

    /// Where replies for this session go.
    pub fn address(&self, key: &str) -> Option<SessionAddress> {
        self.table.get(key).map(|e| SessionAddress {
            surface: e.surface.clone(),
            to: e.to.clone(),
        })
    }

    /// Short human-readable state line for the in-chat status command.
    pub fn describe(&self, key: &str) -> Option<String> {
        self.table.get(key).map(|e| {
            let age_min = (now_ms() - e.created_at) / 60_000;
            format!(
                "Session {key}: {} history messages, created {age_min}m ago",
                e.history.len()
            )
        })
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Evict idle sessions. Rate-limited to once per [`SWEEP_INTERVAL`];
    /// sessions with an active run are skipped. Returns evicted count.
    pub fn sweep_idle(&self, is_active: impl Fn(&str) -> bool) -> usize {
        {
            let mut last = self.last_sweep.lock().expect("sweep lock poisoned");
            if let Some(at) = *last
                && at.elapsed() < SWEEP_INTERVAL
            {
                return 0;
            }
            *last = Some(Instant::now());
        }

        let idle_ms = self.cfg.idle_minutes as i64 * 60_000;
        let now = now_ms();
        let expired: Vec<String> = self
            .table
            .iter()
            .filter(|e| now - e.value().updated_at > idle_ms && !is_active(e.key()))
            .map(|e| e.key().clone())
            .collect();

        let mut evicted = 0;
        for key in expired {
            if let Some((_, entry)) = self.table.remove(&key) {
                // Final state stays persisted; only the live table shrinks.
                self.store.upsert(&key, entry);
                evicted += 1;
                debug!(key = %key, "Evicted idle session");
            }
        }
        if evicted > 0 {
            info!(evicted, remaining = self.table.len(), "Idle sweep complete");
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use tempfile::TempDir;

    use super::*;

    async fn manager_with(cfg: SessionConfig) -> (SessionManager, TempDir) {
        let dir = TempDir::new().unwrap();
        let (store, doc) = SessionStore::open(dir.path().join("sessions.json"))
            .await
            .unwrap();
        (SessionManager::new(cfg, store, doc), dir)
    }

    fn msg(surface: &str, chat_type: ChatType, from: &str) -> InboundMessage {
        InboundMessage {
            surface: surface.to_string(),
            chat_type,
            from: from.to_string(),
            to: "dest".to_string(),
            body: "hi".to_string(),
            mentions_bot: false,
            text_mention_hit: false,
            media: Vec::new(),
            transcript: None,
            message_id: "m1".to_string(),
            received_at: Utc::now(),
            group_id: Some("g7".to_string()),
            group_subject: None,
            sender_name: None,
            bot_id: None,
        }
    }

    #[tokio::test]
    async fn key_derivation_per_scope() {
        let (per_sender, _d1) = manager_with(SessionConfig {
            scope: SessionScope::PerSender,
            ..Default::default()
        })
        .await;
        assert_eq!(
            per_sender.resolve_key(&msg("whatsapp", ChatType::Group, "+1")),
            "whatsapp:+1"
        );

        let (per_group, _d2) = manager_with(SessionConfig {
            scope: SessionScope::PerGroup,
            ..Default::default()
        })
        .await;
        assert_eq!(
            per_group.resolve_key(&msg("whatsapp", ChatType::Group, "+1")),
            "whatsapp:group:g7"
        );
        assert_eq!(
            per_group.resolve_key(&msg("whatsapp", ChatType::Direct, "+1")),
            "whatsapp:+1"
        );

        let (global, _d3) = manager_with(SessionConfig::default()).await;
        assert_eq!(
            global.resolve_key(&msg("telegram", ChatType::Direct, "42")),
            "main"
        );
    }

    #[tokio::test]
    async fn get_or_create_reports_is_new_once() {
        let (mgr, _dir) = manager_with(SessionConfig::default()).await;
        assert!(mgr.get_or_create("main", "telegram", "42"));
        assert!(!mgr.get_or_create("main", "telegram", "42"));
        assert_eq!(mgr.len(), 1);
    }

    #[tokio::test]
    async fn history_bounded_drops_oldest() {
        let (mgr, _dir) = manager_with(SessionConfig {
            history_limit: 3,
            ..Default::default()
        })
        .await;
        mgr.get_or_create("main", "t", "1");
        for i in 0..5 {
            mgr.append_history("main", "user", &format!("msg {i}"));
        }
        let history = mgr.history("main");
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].content, "msg 2");
        assert_eq!(history[2].content, "msg 4");
    }

    #[tokio::test]
    async fn reset_trigger_matches_trimmed() {
        let (mgr, _dir) = manager_with(SessionConfig {
            reset_triggers: vec!["/new".to_string()],
            ..Default::default()
        })
        .await;
        assert!(mgr.is_reset_trigger("/new"));
        assert!(mgr.is_reset_trigger("  /new  "));
        assert!(!mgr.is_reset_trigger("/news"));
    }

    #[tokio::test]
    async fn reset_removes_session() {
        let (mgr, _dir) = manager_with(SessionConfig::default()).await;
        mgr.get_or_create("main", "t", "1");
        assert!(mgr.reset("main"));
        assert!(!mgr.contains("main"));
        assert!(!mgr.reset("main"));
    }

    #[tokio::test]
    async fn sweep_rate_limited_to_once_per_minute() {
        let (mgr, _dir) = manager_with(SessionConfig {
            idle_minutes: 0,
            ..Default::default()
        })
        .await;
        mgr.get_or_create("a", "t", "1");
        // idle_minutes = 0 makes anything older than "now" eligible; the
        // entry was just touched, so nothing expires on the first pass.
        assert_eq!(mgr.sweep_idle(|_| false), 0);
        // Second sweep inside the interval is a no-op regardless of state.
        assert_eq!(mgr.sweep_idle(|_| true), 0);
    }

    #[tokio::test]
    async fn sweep_skips_sessions_with_active_runs() {
        let (mgr, _dir) = manager_with(SessionConfig {
            idle_minutes: 0,
            ..Default::default()
        })
        .await;
        mgr.get_or_create("busy", "t", "1");
        // Backdate the entry so it is past the idle deadline.
        if let Some(mut e) = mgr.table.get_mut("busy") {
            e.updated_at -= 10_000;
        }
        assert_eq!(mgr.sweep_idle(|_| true), 0);
        assert!(mgr.contains("busy"));
    }

    #[tokio::test]
    async fn sweep_evicts_idle_sessions() {
        let (mgr, _dir) = manager_with(SessionConfig {
            idle_minutes: 0,
            ..Default::default()
        })
        .await;
        mgr.get_or_create("old", "t", "1");
        if let Some(mut e) = mgr.table.get_mut("old") {
            e.updated_at -= 10_000;
        }
        assert_eq!(mgr.sweep_idle(|_| false), 1);
        assert!(!mgr.contains("old"));
    }

    #[tokio::test]
    async fn recovery_skips_entries_past_idle_deadline() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions.json");

        {
            let (store, _) = SessionStore::open(&path).await.unwrap();
            let now = now_ms();
            store.upsert(
                "fresh",
                SessionEntry {
                    surface: "t".into(),
                    to: "1".into(),
                    created_at: now,
                    updated_at: now,
                    last_run_at: None,
                    history: Vec::new(),
                },
            );
            store.upsert(
                "stale",
                SessionEntry {
                    surface: "t".into(),
                    to: "1".into(),
                    created_at: now - 7_200_000,
                    updated_at: now - 7_200_000,
                    last_run_at: None,
                    history: Vec::new(),
                },
            );
            store.flush().await;
        }

        let (store, doc) = SessionStore::open(&path).await.unwrap();
        let mgr = SessionManager::new(
            SessionConfig {
                idle_minutes: 60,
                ..Default::default()
            },
            store,
            doc,
        );
        assert!(mgr.contains("fresh"));
        assert!(!mgr.contains("stale"));
    }
}
