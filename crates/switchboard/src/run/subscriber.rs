//! Assistant stream processing.
//!
//! Consumes a run's [`AgentEvent`] stream and produces three output
//! streams: incrementally growing partial text, complete deliverable
//! blocks, and short tool summaries. Thinking tags are stripped before
//! any consumer sees text; `<final>` enforcement, chunking, media
//! extraction, tool debounce and compaction-retry buffer resets all
//! happen here.

use std::sync::LazyLock;
use std::time::{Duration, Instant};

use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{BlockBreak, ChunkingConfig, ReplyConfig};

use super::chunker::{find_cut, floor_char_boundary, split_blocks};
use super::events::{AgentEvent, sanitize_tool_result};

/// Window in which identical consecutive tool invocations aggregate.
const TOOL_DEBOUNCE: Duration = Duration::from_secs(2);

static THINK_PAIR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<think(?:ing)?>.*?</think(?:ing)?>").expect("static regex"));
static THINK_OPEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<think(?:ing)?>").expect("static regex"));
static THINK_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)</?think(?:ing)?>").expect("static regex"));
static FINAL_OPEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<final>").expect("static regex"));
static FINAL_CLOSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)</final>").expect("static regex"));
static MEDIA_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bMEDIA:(\S+)").expect("static regex"));

// ============================================================================
// Output Types
// ============================================================================

/// Output produced by the subscriber for delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyEvent {
    /// Incrementally growing assistant text, for surfaces that render
    /// typing indicators or live updates.
    Partial { text: String },
    /// A complete, deliverable chunk sized for transport constraints.
    Block {
        text: String,
        media_urls: Vec<String>,
    },
    /// Short human-readable summary of tool activity.
    ToolNote { text: String },
    /// A sanitized tool result for external consumers.
    ToolResult { call_id: String, result: Value },
}

/// Observable state of an active run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Starting,
    Streaming,
    Compacting,
    Ending,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Starting => write!(f, "starting"),
            RunState::Streaming => write!(f, "streaming"),
            RunState::Compacting => write!(f, "compacting"),
            RunState::Ending => write!(f, "ending"),
        }
    }
}

/// What a finished run produced.
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    /// Cleaned assistant messages, one per message boundary.
    pub assistant_texts: Vec<String>,
    /// Sanitized tool results in stream order.
    pub tool_results: Vec<(String, Value)>,
    pub compaction_retries: u32,
    /// Set when the stream errored, timed out, or was cancelled.
    pub incomplete: bool,
}

impl RunOutcome {
    /// The run's final reply text.
    pub fn final_text(&self) -> String {
        self.assistant_texts.join("\n\n")
    }
}

// ============================================================================
// Text Cleaning
// ============================================================================

/// Remove thinking segments.
///
/// Paired `<think>…</think>` / `<thinking>…</thinking>` regions go first.
/// In streaming mode an unclosed open tag suppresses everything after it
/// (the model is still thinking); at a message boundary any leftover bare
/// tags are dropped and the text around them kept.
fn strip_thinking(text: &str, streaming: bool) -> String {
    let mut s = text.to_string();
    loop {
        let replaced = THINK_PAIR.replace_all(&s, "").into_owned();
        if replaced == s {
            break;
        }
        s = replaced;
    }
    if streaming {
        if let Some(m) = THINK_OPEN.find(&s) {
            s.truncate(m.start());
        }
        trim_partial_tag(&mut s);
    }
    THINK_TAG.replace_all(&s, "").into_owned()
}

/// Drop a trailing incomplete tag like `<thi` so it never flashes in
/// partial output.
fn trim_partial_tag(s: &mut String) {
    const TAGS: [&str; 6] = [
        "<think>",
        "<thinking>",
        "</think>",
        "</thinking>",
        "<final>",
        "</final>",
    ];
    if let Some(pos) = s.rfind('<') {
        let suffix = &s[pos..];
        if suffix.contains('>') {
            return;
        }
        let lower = suffix.to_ascii_lowercase();
        if TAGS.iter().any(|t| t.starts_with(&lower)) {
            s.truncate(pos);
        }
    }
}

/// Apply `<final>` enforcement to a complete message.
///
/// A well-formed region publishes exactly its interior. A lone or
/// out-of-order tag is elided and the raw remainder published unchanged.
fn extract_final(text: &str) -> String {
    let open = FINAL_OPEN.find(text);
    let close = FINAL_CLOSE.find(text);
    match (open, close) {
        (Some(o), Some(c)) if c.start() >= o.end() => text[o.end()..c.start()].to_string(),
        (None, None) => text.to_string(),
        _ => {
            let without_open = FINAL_OPEN.replace_all(text, "");
            FINAL_CLOSE.replace_all(&without_open, "").into_owned()
        }
    }
}

/// Pull `MEDIA:<url>` pseudo-URLs out of a chunk.
fn extract_media(text: &str) -> (String, Vec<String>) {
    let mut urls = Vec::new();
    let cleaned = MEDIA_TOKEN
        .replace_all(text, |caps: &regex::Captures| {
            urls.push(caps[1].to_string());
            ""
        })
        .into_owned();
    (cleaned, urls)
}

// ============================================================================
// Subscriber
// ============================================================================

struct ToolStreak {
    base: String,
    count: u32,
    last_at: Instant,
}

/// Stream processor for one run. Single owner; not shared across tasks.
pub struct EventSubscriber {
    cfg: ReplyConfig,
    state: RunState,
    /// Raw text of the current assistant message.
    raw: String,
    /// Byte cursor into the cleaned text already emitted as blocks.
    emitted: usize,
    last_partial: String,
    last_block: Option<String>,
    tool_streak: Option<ToolStreak>,
    compaction_in_flight: bool,
    outcome: RunOutcome,
}

impl EventSubscriber {
    pub fn new(cfg: ReplyConfig) -> Self {
        Self {
            cfg,
            state: RunState::Starting,
            raw: String::new(),
            emitted: 0,
            last_partial: String::new(),
            last_block: None,
            tool_streak: None,
            compaction_in_flight: false,
            outcome: RunOutcome::default(),
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn compaction_in_flight(&self) -> bool {
        self.compaction_in_flight
    }

    /// Process one stream event, returning replies to deliver.
    pub fn handle_event(&mut self, event: &AgentEvent) -> Vec<ReplyEvent> {
        match event {
            AgentEvent::AgentStart => {
                self.state = RunState::Streaming;
                Vec::new()
            }
            AgentEvent::MessageUpdate { delta } => {
                self.raw.push_str(delta);
                self.emit_text_updates()
            }
            AgentEvent::TextEnd => {
                if self.cfg.block_reply_break == BlockBreak::TextEnd
                    && !self.cfg.enforce_final_tag
                {
                    self.flush_pending()
                } else {
                    Vec::new()
                }
            }
            AgentEvent::MessageEnd => self.flush_message(),
            AgentEvent::ToolStart { name, meta, .. } => self.tool_note(name, meta),
            AgentEvent::ToolUpdate { .. } => Vec::new(),
            AgentEvent::ToolEnd { call_id, result } => {
                let sanitized = sanitize_tool_result(result);
                self.outcome
                    .tool_results
                    .push((call_id.clone(), sanitized.clone()));
                vec![ReplyEvent::ToolResult {
                    call_id: call_id.clone(),
                    result: sanitized,
                }]
            }
            AgentEvent::AutoCompactionStart => {
                self.compaction_in_flight = true;
                self.state = RunState::Compacting;
                Vec::new()
            }
            AgentEvent::AutoCompactionEnd { will_retry } => {
                self.compaction_in_flight = false;
                self.state = RunState::Streaming;
                if *will_retry {
                    // The run restarts transparently; everything buffered
                    // so far belongs to the discarded attempt.
                    self.raw.clear();
                    self.emitted = 0;
                    self.last_partial.clear();
                    self.last_block = None;
                    self.tool_streak = None;
                    self.outcome.assistant_texts.clear();
                    self.outcome.tool_results.clear();
                    self.outcome.compaction_retries += 1;
                    debug!(
                        retries = self.outcome.compaction_retries,
                        "Compaction retry, buffers reset"
                    );
                }
                Vec::new()
            }
            AgentEvent::AgentEnd => {
                self.state = RunState::Ending;
                let mut out = self.flush_message();
                out.extend(self.flush_tool_streak());
                out
            }
            AgentEvent::StreamError { message } => {
                warn!(error = %message, "Model stream error mid-run");
                self.outcome.incomplete = true;
                self.state = RunState::Ending;
                let mut out = self.flush_message();
                out.extend(self.flush_tool_streak());
                out
            }
            AgentEvent::Unknown => {
                debug!("Ignoring unknown agent event");
                Vec::new()
            }
        }
    }

    /// Flush buffered text as a terminal block after cancellation or timeout.
    pub fn flush_cancelled(&mut self) -> Vec<ReplyEvent> {
        self.outcome.incomplete = true;
        self.state = RunState::Ending;
        let mut out = self.flush_message();
        out.extend(self.flush_tool_streak());
        out
    }

    /// Finish the run and take its outcome.
    pub fn finish(self) -> RunOutcome {
        self.outcome
    }

    fn chunking(&self) -> &ChunkingConfig {
        &self.cfg.block_chunking
    }

    /// Emit fill-triggered blocks and the growing partial after a delta.
    fn emit_text_updates(&mut self) -> Vec<ReplyEvent> {
        let cleaned = strip_thinking(&self.raw, true);
        let mut out = Vec::new();

        // Normal fill: with <final> enforcement the publishable region is
        // only known at the message boundary, so slicing waits until then.
        if !self.cfg.enforce_final_tag {
            self.emitted = floor_char_boundary(&cleaned, self.emitted);
            loop {
                let pending = &cleaned[self.emitted..];
                let skip = pending.len() - pending.trim_start().len();
                self.emitted += skip;
                let pending = &cleaned[self.emitted..];
                if pending.len() < self.chunking().max_chars {
                    break;
                }
                let cut = find_cut(pending, self.chunking());
                let chunk = pending[..cut].to_string();
                self.emitted += cut;
                out.extend(self.push_block(&chunk));
            }
        }

        let partial = if self.cfg.enforce_final_tag {
            extract_final(&cleaned)
        } else {
            cleaned
        };
        if !partial.trim().is_empty() && partial != self.last_partial {
            self.last_partial = partial.clone();
            out.push(ReplyEvent::Partial { text: partial });
        }
        out
    }

    /// Flush the not-yet-emitted remainder as blocks (text_end boundary).
    fn flush_pending(&mut self) -> Vec<ReplyEvent> {
        let cleaned = strip_thinking(&self.raw, true);
        self.emitted = floor_char_boundary(&cleaned, self.emitted);
        let pending = cleaned[self.emitted..].to_string();
        self.emitted = cleaned.len();
        let mut out = Vec::new();
        for block in split_blocks(&pending, self.chunking()) {
            out.extend(self.push_block(&block));
        }
        out
    }

    /// Message boundary: force-flush, record the message, reset buffers.
    fn flush_message(&mut self) -> Vec<ReplyEvent> {
        let cleaned = strip_thinking(&self.raw, false);
        let mut out = Vec::new();

        if self.cfg.enforce_final_tag {
            let publish = extract_final(&cleaned);
            for block in split_blocks(&publish, self.chunking()) {
                out.extend(self.push_block(&block));
            }
            let publish = publish.trim();
            if !publish.is_empty() {
                self.outcome.assistant_texts.push(publish.to_string());
            }
        } else {
            self.emitted = floor_char_boundary(&cleaned, self.emitted);
            let remainder = cleaned[self.emitted..].to_string();
            for block in split_blocks(&remainder, self.chunking()) {
                out.extend(self.push_block(&block));
            }
            let full = cleaned.trim();
            if !full.is_empty() {
                self.outcome.assistant_texts.push(full.to_string());
            }
        }

        self.raw.clear();
        self.emitted = 0;
        self.last_partial.clear();
        out
    }

    /// Emit one block, extracting media and suppressing empties and
    /// consecutive duplicates.
    fn push_block(&mut self, text: &str) -> Option<ReplyEvent> {
        let (clean, media_urls) = extract_media(text);
        let clean = clean.trim().to_string();
        if clean.is_empty() && media_urls.is_empty() {
            return None;
        }
        if media_urls.is_empty() && self.last_block.as_deref() == Some(clean.as_str()) {
            return None;
        }
        if !clean.is_empty() {
            self.last_block = Some(clean.clone());
        }
        Some(ReplyEvent::Block {
            text: clean,
            media_urls,
        })
    }

    /// Tool-note debounce: identical consecutive invocations inside the
    /// window aggregate into a single "name (n×)" note.
    fn tool_note(&mut self, name: &str, meta: &str) -> Vec<ReplyEvent> {
        let base = if meta.is_empty() {
            name.to_string()
        } else {
            format!("{name}: {meta}")
        };
        let now = Instant::now();
        if let Some(streak) = &mut self.tool_streak
            && streak.base == base
            && now.duration_since(streak.last_at) < TOOL_DEBOUNCE
        {
            streak.count += 1;
            streak.last_at = now;
            return Vec::new();
        }
        let mut out = self.flush_tool_streak();
        self.tool_streak = Some(ToolStreak {
            base: base.clone(),
            count: 1,
            last_at: now,
        });
        out.push(ReplyEvent::ToolNote { text: base });
        out
    }

    fn flush_tool_streak(&mut self) -> Vec<ReplyEvent> {
        match self.tool_streak.take() {
            Some(streak) if streak.count > 1 => vec![ReplyEvent::ToolNote {
                text: format!("{} ({}×)", streak.base, streak.count),
            }],
            _ => Vec::new(),
        }
    }
}
