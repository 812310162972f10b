//! Inbound pipeline: gate, reset triggers, session resolution, submission.
//!
//! Bridges transport-driver messages into the session and run systems.
//! The gate decides whether the bot reacts at all; reset triggers drop
//! the session before anything else runs; everything accepted lands in
//! the run coordinator under the session's queue policy.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use switchboard_gateway_protocol::{ChatType, InboundMessage};

use crate::gate::{Gate, Verdict};
use crate::run::{RunCoordinator, RunInput, Submission};
use crate::session::SessionManager;

use super::manager::MessageHandler;

/// Window in which trailing reset triggers are treated as part of the
/// first one (first wins; the rest land on the fresh session).
const RESET_BURST_WINDOW: Duration = Duration::from_secs(2);

pub struct InboundHandler {
    gate: Arc<Gate>,
    sessions: Arc<SessionManager>,
    coordinator: RunCoordinator,
    last_reset: DashMap<String, Instant>,
}

impl InboundHandler {
    pub fn new(
        gate: Arc<Gate>,
        sessions: Arc<SessionManager>,
        coordinator: RunCoordinator,
    ) -> Self {
        Self {
            gate,
            sessions,
            coordinator,
            last_reset: DashMap::new(),
        }
    }

    /// Where replies for this message go: the group for group chats, the
    /// sender for DMs.
    fn reply_chat(msg: &InboundMessage) -> &str {
        match msg.chat_type {
            ChatType::Group => &msg.to,
            ChatType::Direct => &msg.from,
        }
    }

    /// The text handed to the agent: body (or transcript for voice), with
    /// media references appended and a sender prefix in group chats.
    fn agent_text(msg: &InboundMessage) -> String {
        let mut text = if msg.body.is_empty() {
            msg.transcript.clone().unwrap_or_default()
        } else {
            msg.body.clone()
        };
        for media in &msg.media {
            text.push_str("\n[media] ");
            text.push_str(media);
        }
        if msg.chat_type == ChatType::Group {
            let sender = msg.sender_name.as_deref().unwrap_or(&msg.from);
            text = format!("{sender}: {text}");
        }
        text
    }

    fn handle_reset(&self, key: &str, surface: &str, reply_chat: &str) -> String {
        let now = Instant::now();
        let burst = self
            .last_reset
            .get(key)
            .is_some_and(|at| now.duration_since(*at) < RESET_BURST_WINDOW);
        if burst {
            // First trigger already won; this one lands on the fresh session.
            return "Session already reset.".to_string();
        }
        self.last_reset.insert(key.to_string(), now);

        // External cancellation: the active run flushes and releases.
        self.coordinator.cancel_session(key);
        let existed = self.sessions.reset(key);
        self.sessions.get_or_create(key, surface, reply_chat);

        if existed {
            "Session reset. Starting fresh.".to_string()
        } else {
            "Nothing to reset. Starting fresh.".to_string()
        }
    }
}

#[async_trait]
impl MessageHandler for InboundHandler {
    async fn handle_message(&self, surface: &str, msg: &InboundMessage) -> Option<String> {
        let verdict = self.gate.check(msg);
        let Verdict::Accept { text_mention_hit } = verdict else {
            return None;
        };

        let mut msg = msg.clone();
        msg.text_mention_hit = text_mention_hit;

        let key = self.sessions.resolve_key(&msg);
        let reply_chat = Self::reply_chat(&msg).to_string();

        if self.sessions.is_reset_trigger(&msg.body) {
            return Some(self.handle_reset(&key, surface, &reply_chat));
        }

        if msg.body.trim() == "/status" {
            return Some(
                self.sessions
                    .describe(&key)
                    .unwrap_or_else(|| "No active session.".to_string()),
            );
        }

        self.sessions.get_or_create(&key, surface, &reply_chat);

        let input = RunInput::new(Self::agent_text(&msg), surface, reply_chat);
        match self.coordinator.submit(&key, input).await {
            Submission::Dropped => {
                // Documented drop policy; nothing goes back to the chat.
                debug!(session = %key, "Inbound input dropped by queue policy");
                None
            }
            _ => None,
        }
    }
}
