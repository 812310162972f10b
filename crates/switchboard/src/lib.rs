//! Switchboard: a multi-transport chat-to-agent gateway.
//!
//! Transport drivers feed normalised inbound messages through a gate,
//! a session manager resolves each accepted message to a conversation
//! session, a run coordinator serialises agent runs per session, and an
//! event subscriber turns the agent's stream into deliverable chunks.
//! A heartbeat scheduler wakes idle sessions and a token-gated webhook
//! surface lets external producers inject wakes or full runs.

pub mod config;
pub mod delivery;
pub mod gate;
pub mod gateway;
pub mod heartbeat;
pub mod hooks;
pub mod run;
pub mod server;
pub mod session;
pub mod template;
