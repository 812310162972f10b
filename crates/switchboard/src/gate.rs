//! Inbound filtering: decides whether the bot reacts to a message at all.
//!
//! The gate is a pure function over an [`InboundMessage`] and the compiled
//! per-surface configuration. It never fails; a malformed event rejects.
//! Rules are evaluated in order: surface enabled, DM allowlist, group
//! resolution, mention requirement, with per-group overrides winning over
//! surface defaults.

use std::collections::HashMap;

use dashmap::DashMap;
use regex::{Regex, RegexBuilder};
use tracing::debug;

use switchboard_gateway_protocol::{ChatType, InboundMessage};

use crate::config::SurfaceConfig;

// ============================================================================
// Verdict
// ============================================================================

/// Outcome of gate evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept {
        /// True when a configured mention pattern matched the body.
        text_mention_hit: bool,
    },
    Reject {
        reason: RejectReason,
    },
}

impl Verdict {
    pub fn is_accept(&self) -> bool {
        matches!(self, Verdict::Accept { .. })
    }
}

/// Why the gate rejected an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    /// Surface has no config block or is explicitly disabled.
    SurfaceDisabled,
    /// Sender not in the direct-message allowlist.
    SenderNotAllowed,
    /// Group not configured and no wildcard entry exists.
    UnknownGroup,
    /// Mention required but neither a native mention nor a pattern hit.
    MentionRequired,
    /// Event is missing required fields.
    Malformed,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::SurfaceDisabled => "surface_disabled",
            RejectReason::SenderNotAllowed => "sender_not_allowed",
            RejectReason::UnknownGroup => "unknown_group",
            RejectReason::MentionRequired => "mention_required",
            RejectReason::Malformed => "malformed",
        }
    }
}

// ============================================================================
// Compiled Configuration
// ============================================================================

/// A surface's gate rules with mention patterns compiled once.
#[derive(Debug)]
struct CompiledSurface {
    enabled: bool,
    allow_from: Option<Vec<String>>,
    mention_patterns: Vec<Regex>,
    groups: HashMap<String, CompiledGroup>,
}

#[derive(Debug)]
struct CompiledGroup {
    require_mention: Option<bool>,
    allow_from: Option<Vec<String>>,
    /// Group-level patterns replace the surface set when present.
    mention_patterns: Option<Vec<Regex>>,
}

fn compile_patterns(surface: &str, patterns: &[String]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| {
            match RegexBuilder::new(p).case_insensitive(true).build() {
                Ok(re) => Some(re),
                Err(e) => {
                    // Already warned at config validation; keep the gate quiet.
                    debug!(surface = %surface, pattern = %p, error = %e,
                        "Skipping invalid mention pattern");
                    None
                }
            }
        })
        .collect()
}

// ============================================================================
// Gate
// ============================================================================

/// The inbound gate. Side-effect free apart from reject counters.
pub struct Gate {
    surfaces: HashMap<String, CompiledSurface>,
    /// Reject counters by reason, for observability.
    rejects: DashMap<&'static str, u64>,
}

impl Gate {
    /// Compile the per-surface configuration into a gate.
    pub fn new(surfaces: &HashMap<String, SurfaceConfig>) -> Self {
        let compiled = surfaces
            .iter()
            .map(|(name, cfg)| {
                let groups = cfg
                    .groups
                    .iter()
                    .map(|(gid, g)| {
                        (
                            gid.clone(),
                            CompiledGroup {
                                require_mention: g.require_mention,
                                allow_from: g.allow_from.clone(),
                                mention_patterns: g
                                    .mention_patterns
                                    .as_ref()
                                    .map(|p| compile_patterns(name, p)),
                            },
                        )
                    })
                    .collect();
                (
                    name.clone(),
                    CompiledSurface {
                        enabled: cfg.enabled,
                        allow_from: cfg.allow_from.clone(),
                        mention_patterns: compile_patterns(name, &cfg.mention_patterns),
                        groups,
                    },
                )
            })
            .collect();

        Self {
            surfaces: compiled,
            rejects: DashMap::new(),
        }
    }

    /// Evaluate an inbound message.
    pub fn check(&self, msg: &InboundMessage) -> Verdict {
        let verdict = self.evaluate(msg);
        if let Verdict::Reject { reason } = &verdict {
            *self.rejects.entry(reason.as_str()).or_insert(0) += 1;
            debug!(
                surface = %msg.surface,
                from = %msg.from,
                reason = reason.as_str(),
                "Gate rejected message"
            );
        }
        verdict
    }

    /// Snapshot of the reject counters.
    pub fn reject_counts(&self) -> HashMap<&'static str, u64> {
        self.rejects.iter().map(|e| (*e.key(), *e.value())).collect()
    }

    fn evaluate(&self, msg: &InboundMessage) -> Verdict {
        if msg.surface.is_empty() || msg.from.is_empty() {
            return Verdict::Reject {
                reason: RejectReason::Malformed,
            };
        }

        // 1. Surface enabled?
        let Some(surface) = self.surfaces.get(&msg.surface) else {
            return Verdict::Reject {
                reason: RejectReason::SurfaceDisabled,
            };
        };
        if !surface.enabled {
            return Verdict::Reject {
                reason: RejectReason::SurfaceDisabled,
            };
        }

        // Self-chat mode: an empty allowlist, or one naming only the bot's
        // own identity on this surface. Metadata mentions are unreliable
        // there (the platform flags the account's own messages).
        let self_chat = match &surface.allow_from {
            Some(list) if list.is_empty() => true,
            Some(list) => msg
                .bot_id
                .as_ref()
                .is_some_and(|id| list.iter().all(|a| a == id)),
            None => false,
        };

        match msg.chat_type {
            ChatType::Direct => {
                // 2. Direct-message allowlist.
                if let Some(allow) = &surface.allow_from {
                    let allowed = if allow.is_empty() {
                        msg.bot_id.as_deref() == Some(msg.from.as_str()) || msg.from == msg.to
                    } else {
                        allow.iter().any(|a| a == &msg.from)
                    };
                    if !allowed {
                        return Verdict::Reject {
                            reason: RejectReason::SenderNotAllowed,
                        };
                    }
                }
                Verdict::Accept {
                    text_mention_hit: self.pattern_hit(surface, None, &msg.body),
                }
            }
            ChatType::Group => {
                // 3. Group resolution by id (preferred) or slug, else wildcard.
                // The DM allowlist does not apply to group senders.
                let group = surface
                    .groups
                    .get(msg.group_key())
                    .or_else(|| surface.groups.get("*"));
                let Some(group) = group else {
                    return Verdict::Reject {
                        reason: RejectReason::UnknownGroup,
                    };
                };

                // 5. Per-group sender override tightens the group rule.
                if let Some(allow) = group.allow_from.as_ref()
                    && !allow.iter().any(|a| a == &msg.from)
                {
                    return Verdict::Reject {
                        reason: RejectReason::SenderNotAllowed,
                    };
                }

                // 4. Mention requirement; groups default to requiring one.
                let require_mention = group.require_mention.unwrap_or(true);
                let pattern_hit = self.pattern_hit(surface, Some(group), &msg.body);
                let native_hit = msg.mentions_bot && !self_chat;

                if require_mention && !native_hit && !pattern_hit {
                    return Verdict::Reject {
                        reason: RejectReason::MentionRequired,
                    };
                }

                Verdict::Accept {
                    text_mention_hit: pattern_hit,
                }
            }
        }
    }

    fn pattern_hit(
        &self,
        surface: &CompiledSurface,
        group: Option<&CompiledGroup>,
        body: &str,
    ) -> bool {
        let patterns = group
            .and_then(|g| g.mention_patterns.as_ref())
            .unwrap_or(&surface.mention_patterns);
        patterns.iter().any(|re| re.is_match(body))
    }
}
