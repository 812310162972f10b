//! Wire protocol between Switchboard and transport-driver plugins.
//!
//! Transport drivers (phone messaging, bot APIs, guild chat, desktop
//! messaging, web chat) run as separate processes and speak this protocol
//! as JSON Lines (newline-delimited JSON) over stdio:
//!
//! - **Commands** (Switchboard → driver): deliver text, media, typing state
//! - **Events** (driver → Switchboard): readiness, inbound messages, acks
//!
//! # Example: minimal driver
//!
//! ```ignore
//! use switchboard_gateway_protocol::{GatewayCommand, GatewayEvent};
//!
//! // Read commands from stdin
//! let line = read_line_from_stdin();
//! let command: GatewayCommand = serde_json::from_str(&line)?;
//!
//! // Send events to stdout
//! let event = GatewayEvent::Ready {
//!     surface: "my-surface".to_string(),
//!     version: "1.0.0".to_string(),
//!     capabilities: vec![],
//! };
//! println!("{}", serde_json::to_string(&event)?);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Commands (Switchboard → driver)
// ============================================================================

/// Commands sent from Switchboard to a transport driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayCommand {
    /// Deliver a text block to a chat.
    SendMessage {
        request_id: String,
        chat_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<String>,
    },

    /// Deliver media (image, audio, document) to a chat.
    SendMedia {
        request_id: String,
        chat_id: String,
        media: MediaPayload,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },

    /// Show a typing indicator in a chat.
    SendTyping {
        chat_id: String,
        /// Duration in seconds (0 = stop typing indicator).
        #[serde(default)]
        duration: u32,
    },

    /// Health check / ping.
    Ping { request_id: String },

    /// Request graceful shutdown.
    Shutdown,
}

/// Media payload for the SendMedia command.
///
/// Raw bytes never travel over the protocol; media is always referenced
/// by URL or by a path the driver can read.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum MediaPayload {
    /// Fetch media from a URL.
    Url {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
    /// Read media from a local path shared with the driver.
    Path {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
}

// ============================================================================
// Events (driver → Switchboard)
// ============================================================================

/// Events sent from a transport driver to Switchboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEvent {
    /// Driver is connected and ready to receive commands.
    Ready {
        surface: String,
        version: String,
        #[serde(default)]
        capabilities: Vec<String>,
    },

    /// Incoming message from a user.
    MessageReceived(Box<InboundMessage>),

    /// Command completed successfully.
    CommandOk {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },

    /// Command failed.
    CommandError {
        request_id: String,
        code: String,
        message: String,
    },

    /// Response to the Ping command.
    Pong {
        request_id: String,
        uptime_seconds: u64,
        connected: bool,
    },

    /// Driver-level error (not tied to a specific command).
    Error {
        code: String,
        message: String,
        /// Whether this error is fatal (driver will shut down).
        #[serde(default)]
        fatal: bool,
    },

    /// Driver is shutting down.
    Shutdown { reason: String },
}

/// Chat kind of an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatType {
    /// One-on-one conversation.
    Direct,
    /// Group, guild channel, or room.
    Group,
}

/// One normalised inbound message from any surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Surface the message arrived on (e.g. "telegram", "webchat").
    pub surface: String,
    pub chat_type: ChatType,
    /// Sender identity in the surface's namespace.
    pub from: String,
    /// Recipient identity (the bot account, or the group/channel id).
    pub to: String,
    /// Message text, already decoded by the driver.
    pub body: String,
    /// Native platform mention of the bot identity (metadata flag).
    #[serde(default)]
    pub mentions_bot: bool,
    /// Set by the gate when a configured mention pattern matched the body.
    /// Drivers never populate this.
    #[serde(default)]
    pub text_mention_hit: bool,
    /// Media references (URLs or driver-local paths).
    #[serde(default)]
    pub media: Vec<String>,
    /// Voice transcript, when the driver transcribed audio.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
    pub message_id: String,
    pub received_at: DateTime<Utc>,
    /// Group identifier, present when `chat_type` is Group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    /// Human-readable group subject, when the platform exposes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_subject: Option<String>,
    /// Display name of the sender, when the platform exposes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    /// Identity of the bot account on this surface. Lets the gate detect
    /// self-chat setups where the allowlist names the account itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_id: Option<String>,
}

impl InboundMessage {
    /// The group descriptor used for gate resolution: id when present,
    /// otherwise the `to` field.
    pub fn group_key(&self) -> &str {
        self.group_id.as_deref().unwrap_or(&self.to)
    }
}

// ============================================================================
// Driver Capabilities
// ============================================================================

/// Well-known driver capabilities.
pub mod capabilities {
    /// Driver supports sending media.
    pub const MEDIA: &str = "media";
    /// Driver supports typing indicators.
    pub const TYPING: &str = "typing";
    /// Driver supports reply-to (threading).
    pub const REPLY: &str = "reply";
    /// Driver supplies voice transcripts.
    pub const TRANSCRIPT: &str = "transcript";
}

// ============================================================================
// Error Codes
// ============================================================================

/// Well-known error codes for CommandError and Error events.
pub mod error_codes {
    /// Chat/conversation not found.
    pub const CHAT_NOT_FOUND: &str = "chat_not_found";
    /// Rate limited by platform.
    pub const RATE_LIMITED: &str = "rate_limited";
    /// Not authorized to perform the action.
    pub const UNAUTHORIZED: &str = "unauthorized";
    /// Platform API error.
    pub const PLATFORM_ERROR: &str = "platform_error";
    /// Invalid request from Switchboard.
    pub const INVALID_REQUEST: &str = "invalid_request";
    /// Driver not connected to its platform.
    pub const NOT_CONNECTED: &str = "not_connected";
}
