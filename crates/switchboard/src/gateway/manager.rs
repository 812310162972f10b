//! Gateway manager: the boundary between transport drivers and the core.
//!
//! Provides a unified interface for registering drivers, routing their
//! inbound messages into the message handler, sending outbound commands
//! back by surface name, and lifecycle (start, stop, shutdown).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use switchboard_gateway_protocol::{GatewayCommand, GatewayEvent, InboundMessage, MediaPayload};

/// Health of the transport control channel, read by the heartbeat
/// scheduler. Degraded while any driver reports a fatal error and no
/// fresh Ready has arrived since.
#[derive(Debug, Default)]
pub struct ControlState {
    degraded: AtomicBool,
}

impl ControlState {
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn set_degraded(&self, value: bool) {
        self.degraded.store(value, Ordering::Relaxed);
    }
}

/// Consumer of inbound messages from all drivers.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one inbound message. An optional short text reply is sent
    /// straight back to the originating chat (acks, command output).
    async fn handle_message(&self, surface: &str, msg: &InboundMessage) -> Option<String>;
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("surface '{0}' has no registered driver")]
    UnknownSurface(String),

    #[error("driver command channel closed")]
    ChannelClosed,
}

/// Handle to one registered driver.
#[derive(Clone)]
pub struct GatewayHandle {
    pub name: String,
    pub command_tx: mpsc::Sender<GatewayCommand>,
    pub capabilities: Vec<String>,
}

struct GatewayManagerInner {
    gateways: HashMap<String, GatewayHandle>,
    handler: Option<Arc<dyn MessageHandler>>,
    handler_timeout: Duration,
    event_handles: Vec<tokio::task::JoinHandle<()>>,
}

/// Manager for all transport drivers.
#[derive(Clone)]
pub struct GatewayManager {
    inner: Arc<RwLock<GatewayManagerInner>>,
    control: Arc<ControlState>,
}

impl GatewayManager {
    /// `handler_timeout` bounds message-handler execution (the handler
    /// may submit an agent run; this should match the run deadline).
    pub fn new(handler_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(GatewayManagerInner {
                gateways: HashMap::new(),
                handler: None,
                handler_timeout,
                event_handles: Vec::new(),
            })),
            control: Arc::new(ControlState::default()),
        }
    }

    pub fn control(&self) -> Arc<ControlState> {
        self.control.clone()
    }

    /// Set the handler for inbound messages.
    pub async fn set_handler(&self, handler: Arc<dyn MessageHandler>) {
        let mut inner = self.inner.write().await;
        inner.handler = Some(handler);
    }

    /// Register a driver and get its communication channels.
    ///
    /// Returns the command receiver (daemon → driver) and the event
    /// sender (driver → daemon).
    pub async fn register(
        &self,
        name: impl Into<String>,
    ) -> (mpsc::Receiver<GatewayCommand>, mpsc::Sender<GatewayEvent>) {
        let name = name.into();
        let (cmd_tx, cmd_rx) = mpsc::channel(100);
        let (evt_tx, evt_rx) = mpsc::channel(100);

        let handle = GatewayHandle {
            name: name.clone(),
            command_tx: cmd_tx,
            capabilities: Vec::new(),
        };

        {
            let mut inner = self.inner.write().await;
            inner.gateways.insert(name.clone(), handle);
        }

        let manager = self.clone();
        let gateway_name = name.clone();
        let join_handle = tokio::spawn(async move {
            manager.handle_events(gateway_name, evt_rx).await;
        });

        {
            let mut inner = self.inner.write().await;
            inner.event_handles.push(join_handle);
        }

        info!(surface = %name, "Driver registered");
        (cmd_rx, evt_tx)
    }

    pub async fn unregister(&self, name: &str) {
        let mut inner = self.inner.write().await;
        if inner.gateways.remove(name).is_some() {
            info!(surface = %name, "Driver unregistered");
        }
    }

    pub async fn list(&self) -> Vec<String> {
        let inner = self.inner.read().await;
        inner.gateways.keys().cloned().collect()
    }

    /// Deliver a text block to a chat.
    pub async fn send_message(
        &self,
        surface: &str,
        chat_id: &str,
        content: &str,
    ) -> Result<(), SendError> {
        self.send_command(
            surface,
            GatewayCommand::SendMessage {
                request_id: Ulid::new().to_string(),
                chat_id: chat_id.to_string(),
                content: content.to_string(),
                reply_to: None,
            },
        )
        .await
    }

    /// Deliver media referenced by URL.
    pub async fn send_media(
        &self,
        surface: &str,
        chat_id: &str,
        url: &str,
        caption: Option<&str>,
    ) -> Result<(), SendError> {
        self.send_command(
            surface,
            GatewayCommand::SendMedia {
                request_id: Ulid::new().to_string(),
                chat_id: chat_id.to_string(),
                media: MediaPayload::Url {
                    url: url.to_string(),
                    mime_type: None,
                },
                caption: caption.map(str::to_string),
            },
        )
        .await
    }

    /// Show a typing indicator; best-effort.
    pub async fn send_typing(&self, surface: &str, chat_id: &str) -> Result<(), SendError> {
        self.send_command(
            surface,
            GatewayCommand::SendTyping {
                chat_id: chat_id.to_string(),
                duration: 5,
            },
        )
        .await
    }

    async fn send_command(&self, surface: &str, command: GatewayCommand) -> Result<(), SendError> {
        let tx = {
            let inner = self.inner.read().await;
            inner.gateways.get(surface).map(|h| h.command_tx.clone())
        };
        let Some(tx) = tx else {
            return Err(SendError::UnknownSurface(surface.to_string()));
        };
        tx.send(command).await.map_err(|_| SendError::ChannelClosed)
    }

    /// Graceful shutdown: ask every driver to stop, then await the event
    /// loops.
    pub async fn shutdown(&self) {
        let handles: Vec<GatewayHandle> = {
            let inner = self.inner.read().await;
            inner.gateways.values().cloned().collect()
        };
        for handle in handles {
            let _ = handle.command_tx.send(GatewayCommand::Shutdown).await;
        }

        let event_handles = {
            let mut inner = self.inner.write().await;
            inner.gateways.clear();
            std::mem::take(&mut inner.event_handles)
        };
        for handle in event_handles {
            handle.abort();
        }
        info!("Gateway manager shut down");
    }

    /// Per-driver event loop.
    async fn handle_events(&self, surface: String, mut evt_rx: mpsc::Receiver<GatewayEvent>) {
        while let Some(event) = evt_rx.recv().await {
            match event {
                GatewayEvent::Ready {
                    surface: reported,
                    version,
                    capabilities,
                } => {
                    info!(surface = %reported, version = %version, "Driver ready");
                    self.control.set_degraded(false);
                    let mut inner = self.inner.write().await;
                    if let Some(handle) = inner.gateways.get_mut(&surface) {
                        handle.capabilities = capabilities;
                    }
                }
                GatewayEvent::MessageReceived(msg) => {
                    self.dispatch_message(&surface, *msg).await;
                }
                GatewayEvent::CommandOk { request_id, .. } => {
                    debug!(surface = %surface, request_id = %request_id, "Command ok");
                }
                GatewayEvent::CommandError {
                    request_id,
                    code,
                    message,
                } => {
                    warn!(
                        surface = %surface,
                        request_id = %request_id,
                        code = %code,
                        error = %message,
                        "Command failed"
                    );
                }
                GatewayEvent::Pong { request_id, .. } => {
                    debug!(surface = %surface, request_id = %request_id, "Pong");
                }
                GatewayEvent::Error {
                    code,
                    message,
                    fatal,
                } => {
                    if fatal {
                        error!(surface = %surface, code = %code, error = %message,
                            "Driver reported fatal error");
                        self.control.set_degraded(true);
                    } else {
                        warn!(surface = %surface, code = %code, error = %message,
                            "Driver error");
                    }
                }
                GatewayEvent::Shutdown { reason } => {
                    info!(surface = %surface, reason = %reason, "Driver shut down");
                    break;
                }
            }
        }
        self.unregister(&surface).await;
    }

    /// Run one inbound message through the handler, bounded by the
    /// handler timeout, and send back any short reply it returns.
    async fn dispatch_message(&self, surface: &str, msg: InboundMessage) {
        let (handler, timeout) = {
            let inner = self.inner.read().await;
            (inner.handler.clone(), inner.handler_timeout)
        };
        let Some(handler) = handler else {
            warn!(surface = %surface, "No message handler installed, dropping message");
            return;
        };

        let manager = self.clone();
        let surface = surface.to_string();
        tokio::spawn(async move {
            let reply =
                match tokio::time::timeout(timeout, handler.handle_message(&surface, &msg)).await {
                    Ok(reply) => reply,
                    Err(_) => {
                        warn!(
                            surface = %surface,
                            message_id = %msg.message_id,
                            "Message handler timed out"
                        );
                        None
                    }
                };
            // Acks go to the group for group chats, to the sender for DMs.
            let reply_chat = match msg.chat_type {
                switchboard_gateway_protocol::ChatType::Group => &msg.to,
                switchboard_gateway_protocol::ChatType::Direct => &msg.from,
            };
            if let Some(text) = reply
                && let Err(e) = manager.send_message(&surface, reply_chat, &text).await
            {
                warn!(surface = %surface, error = %e, "Failed to send handler reply");
            }
        });
    }
}
