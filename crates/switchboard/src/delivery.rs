//! Delivery dispatcher: pushes subscriber output back to the surface.
//!
//! Blocks become messages (plus media sends), partials drive a throttled
//! typing indicator, tool notes become short status messages. Failed
//! sends retry with jittered exponential backoff; after the attempts are
//! exhausted the failure is logged and a minimal notice is attempted on
//! the originating channel.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::Rng;
use tracing::{debug, error, warn};

use crate::config::DeliveryConfig;
use crate::gateway::GatewayManager;
use crate::run::ReplyEvent;

/// Minimum spacing between typing indicators per chat.
const TYPING_THROTTLE: Duration = Duration::from_secs(5);

pub struct DeliveryDispatcher {
    gateways: GatewayManager,
    cfg: DeliveryConfig,
    typing_sent: DashMap<String, Instant>,
}

impl DeliveryDispatcher {
    pub fn new(gateways: GatewayManager, cfg: DeliveryConfig) -> Self {
        Self {
            gateways,
            cfg,
            typing_sent: DashMap::new(),
        }
    }

    /// Deliver one reply event to a chat. Never propagates transport
    /// errors to the run; the run already happened.
    pub async fn dispatch(&self, surface: &str, chat_id: &str, reply: &ReplyEvent) {
        match reply {
            ReplyEvent::Partial { .. } => {
                self.send_typing(surface, chat_id).await;
            }
            ReplyEvent::Block { text, media_urls } => {
                if !text.is_empty() {
                    self.send_with_retry(surface, chat_id, text).await;
                }
                for url in media_urls {
                    if let Err(e) = self.gateways.send_media(surface, chat_id, url, None).await {
                        warn!(surface = %surface, url = %url, error = %e, "Media send failed");
                    }
                }
            }
            ReplyEvent::ToolNote { text } => {
                self.send_with_retry(surface, chat_id, &format!("⚙ {text}")).await;
            }
            // Tool results go to external consumers, not to chat.
            ReplyEvent::ToolResult { .. } => {}
        }
    }

    /// Plain text send with the same retry behavior as block delivery.
    pub async fn send_text(&self, surface: &str, chat_id: &str, text: &str) {
        self.send_with_retry(surface, chat_id, text).await;
    }

    async fn send_typing(&self, surface: &str, chat_id: &str) {
        let key = format!("{surface}:{chat_id}");
        let now = Instant::now();
        let throttled = self
            .typing_sent
            .get(&key)
            .is_some_and(|at| now.duration_since(*at) < TYPING_THROTTLE);
        if throttled {
            return;
        }
        self.typing_sent.insert(key, now);
        if let Err(e) = self.gateways.send_typing(surface, chat_id).await {
            debug!(surface = %surface, error = %e, "Typing indicator failed");
        }
    }

    async fn send_with_retry(&self, surface: &str, chat_id: &str, text: &str) {
        let mut backoff = Duration::from_millis(self.cfg.backoff_ms.max(1));
        for attempt in 1..=self.cfg.max_attempts {
            match self.gateways.send_message(surface, chat_id, text).await {
                Ok(()) => return,
                Err(e) if attempt < self.cfg.max_attempts => {
                    warn!(
                        surface = %surface,
                        chat_id = %chat_id,
                        attempt,
                        error = %e,
                        "Delivery failed, retrying"
                    );
                    tokio::time::sleep(jittered(backoff)).await;
                    backoff *= 2;
                }
                Err(e) => {
                    error!(
                        surface = %surface,
                        chat_id = %chat_id,
                        attempts = self.cfg.max_attempts,
                        error = %e,
                        "Delivery failed permanently"
                    );
                    // Best-effort minimal notice; a dead transport will
                    // drop this too.
                    let _ = self
                        .gateways
                        .send_message(surface, chat_id, "⚠ reply delivery failed")
                        .await;
                    return;
                }
            }
        }
    }
}

/// Up to 25% random jitter on retry backoff.
fn jittered(base: Duration) -> Duration {
    let jitter = rand::rng().random_range(0.0..0.25);
    base.mul_f64(1.0 + jitter)
}
