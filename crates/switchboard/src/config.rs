use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tokio::fs;
use tracing::warn;

// ============================================================================
// Config (root)
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// State directory for the session store and other runtime files.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    #[serde(default)]
    pub server: ServerConfig,
    /// Per-surface gate configuration. A surface with no block is disabled.
    #[serde(default)]
    pub surfaces: HashMap<String, SurfaceConfig>,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub runs: RunLimits,
    #[serde(default)]
    pub reply: ReplyConfig,
    #[serde(default)]
    pub heartbeats: Vec<HeartbeatJobConfig>,
    #[serde(default)]
    pub hooks: HooksConfig,
    /// Agent runner subprocess (one process per run).
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub gateways: GatewaysConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_saphyr::Error),

    #[error("environment variable '{0}' is not set")]
    MissingEnvVar(String),

    #[error("unclosed variable reference '${{' (missing '}}')")]
    UnclosedVarReference,
}

impl Config {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        let expanded = expand_env_vars(&contents)?;
        Ok(serde_saphyr::from_str(&expanded)?)
    }

    /// Log validation warnings that do not prevent startup.
    ///
    /// Invalid mention regexes are reported here and skipped when the gate
    /// compiles its pattern set. The legacy `interrupt` queue mode gets an
    /// explicit note because it cancels the active run instead of steering it.
    pub fn log_warnings(&self) {
        for (surface, cfg) in &self.surfaces {
            for pattern in cfg.all_mention_patterns() {
                if let Err(e) = regex::RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                {
                    warn!(surface = %surface, pattern = %pattern, error = %e,
                        "Invalid mention pattern, skipping");
                }
            }
        }

        let mut modes = vec![&self.queue.mode];
        modes.extend(self.queue.by_surface.values());
        if modes.contains(&&QueueMode::Interrupt) {
            warn!(
                "queue mode 'interrupt' cancels the active run and restarts; \
                 use 'steer' to preempt in place"
            );
        }

        for job in &self.heartbeats {
            if parse_cadence(&job.every).is_none() {
                warn!(session = %job.session_key, every = %job.every,
                    "Unparseable heartbeat cadence, job disabled");
            }
        }

        for mapping in &self.hooks.mappings {
            if mapping.match_rule.path.is_none() && mapping.match_rule.source.is_none() {
                warn!(mapping = %mapping.name, "Hook mapping matches nothing");
            }
        }
    }
}

/// Resolve a path relative to the config file directory.
///
/// Absolute paths are returned as-is; relative paths are joined with the
/// config file's parent directory so behavior does not depend on the
/// current working directory.
pub fn resolve_path(config_path: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }

    let config_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
    config_dir.join(path)
}

// ============================================================================
// Default Paths
// ============================================================================

/// Default state directory (relative to config file).
pub const DEFAULT_STATE_DIR: &str = ".switchboard";
/// Session store document path (relative to state dir).
pub const SESSIONS_FILE: &str = "sessions/sessions.json";

// ============================================================================
// Private Helpers (Serde Defaults)
// ============================================================================

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8390
}

fn default_request_timeout() -> u64 {
    300
}

fn default_max_connections() -> usize {
    64
}

fn default_body_limit() -> usize {
    256 * 1024
}

/// Serde default for bool fields that should be `true` (serde's default is `false`).
fn default_true() -> bool {
    true
}

fn default_main_key() -> String {
    "main".to_string()
}

fn default_idle_minutes() -> u64 {
    60
}

fn default_history_limit() -> usize {
    50
}

fn default_debounce_ms() -> u64 {
    700
}

fn default_queue_cap() -> usize {
    10
}

fn default_max_concurrent() -> usize {
    4
}

fn default_run_timeout() -> u64 {
    600
}

fn default_min_chars() -> usize {
    800
}

fn default_max_chars() -> usize {
    1200
}

fn default_heartbeat_prompt() -> String {
    "HEARTBEAT".to_string()
}

fn default_heartbeat_target() -> String {
    "last".to_string()
}

fn default_delivery_attempts() -> u32 {
    3
}

fn default_delivery_backoff_ms() -> u64 {
    500
}

// ============================================================================
// Environment Variable Expansion
// ============================================================================

/// Expand `${VAR}` and `${VAR:-default}` references in the raw config text.
///
/// `${VAR}` errors when the variable is unset; `${VAR:-default}` falls back
/// (an empty default is allowed). `$$` escapes a literal dollar and a bare
/// `$` not followed by `{` passes through untouched, so shell-ish values
/// like `$100` need no escaping. Defaults are plain text: a `${...}` inside
/// one is not expanded, and a `${` without its `}` is an error.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut expanded = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(dollar) = rest.find('$') {
        expanded.push_str(&rest[..dollar]);
        let after = &rest[dollar + 1..];

        if let Some(after_escape) = after.strip_prefix('$') {
            expanded.push('$');
            rest = after_escape;
        } else if let Some(reference) = after.strip_prefix('{') {
            let Some(close) = reference.find('}') else {
                return Err(ConfigError::UnclosedVarReference);
            };
            expanded.push_str(&resolve_var(&reference[..close])?);
            rest = &reference[close + 1..];
        } else {
            expanded.push('$');
            rest = after;
        }
    }

    expanded.push_str(rest);
    Ok(expanded)
}

/// Resolve the interior of one `${...}` reference.
fn resolve_var(reference: &str) -> Result<String, ConfigError> {
    let (name, default) = match reference.split_once(":-") {
        Some((name, default)) => (name, Some(default)),
        None => (reference, None),
    };
    match std::env::var(name) {
        Ok(value) => Ok(value),
        Err(_) => default
            .map(str::to_string)
            .ok_or_else(|| ConfigError::MissingEnvVar(name.to_string())),
    }
}

// ============================================================================
// ServerConfig
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Webhook body size cap in bytes (413 above this).
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
    /// Gateway token for webhook and status endpoints. If not set, those
    /// endpoints only accept requests from loopback addresses.
    #[serde(default)]
    pub token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_seconds: default_request_timeout(),
            max_connections: default_max_connections(),
            body_limit_bytes: default_body_limit(),
            token: None,
        }
    }
}

// ============================================================================
// SurfaceConfig (gate)
// ============================================================================

/// Gate configuration for one surface.
#[derive(Debug, Clone, Deserialize)]
pub struct SurfaceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Direct-message allowlist. Omitted = no allowlist (all senders pass).
    /// An empty list means "own identity only" (self-chat mode).
    #[serde(default)]
    pub allow_from: Option<Vec<String>>,

    /// Mention patterns matched case-insensitively against the body.
    #[serde(default)]
    pub mention_patterns: Vec<String>,

    /// Group descriptors by id (preferred) or slug. `"*"` is a wildcard.
    #[serde(default)]
    pub groups: HashMap<String, GroupConfig>,
}

impl SurfaceConfig {
    /// All mention patterns configured on this surface, including group overrides.
    pub fn all_mention_patterns(&self) -> impl Iterator<Item = &String> {
        self.mention_patterns.iter().chain(
            self.groups
                .values()
                .filter_map(|g| g.mention_patterns.as_ref())
                .flatten(),
        )
    }
}

/// Per-group overrides. Deeper overrides win over the surface defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GroupConfig {
    /// Groups default to requiring a mention.
    #[serde(default)]
    pub require_mention: Option<bool>,

    /// Restrict which group members may trigger the bot.
    #[serde(default)]
    pub allow_from: Option<Vec<String>>,

    /// Group-specific mention patterns (replace the surface-level set).
    #[serde(default)]
    pub mention_patterns: Option<Vec<String>>,
}

// ============================================================================
// SessionConfig
// ============================================================================

/// Session key scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionScope {
    /// One session per sender identity.
    PerSender,
    /// One session per group (sender for DMs).
    PerGroup,
    /// A single shared session.
    #[default]
    Global,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub scope: SessionScope,
    /// Key used by the `global` scope and by wake hooks.
    #[serde(default = "default_main_key")]
    pub main_key: String,
    #[serde(default = "default_idle_minutes")]
    pub idle_minutes: u64,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Bodies that, trimmed, drop the session and start a fresh one.
    #[serde(default)]
    pub reset_triggers: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            scope: SessionScope::default(),
            main_key: default_main_key(),
            idle_minutes: default_idle_minutes(),
            history_limit: default_history_limit(),
            reset_triggers: Vec::new(),
        }
    }
}

// ============================================================================
// Queue Settings
// ============================================================================

/// What to do with an input that arrives while the session's run is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueMode {
    /// Pass the input to the running agent as an interruption.
    Steer,
    /// Deliver as the next user turn after the current turn completes.
    Followup,
    /// Hold until the run ends, then start a new run with the backlog.
    #[default]
    Collect,
    /// Steer, and also retain the backlog for the next run.
    SteerBacklog,
    /// Cancel the current run, then start a new one with the queued input.
    Interrupt,
}

/// Which end of a full backlog gives way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DropRule {
    /// Discard the oldest queued item.
    #[default]
    Old,
    /// Reject the incoming item.
    New,
    /// Collapse the backlog into a single synthetic summary item.
    Summarize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueSettings {
    #[serde(default)]
    pub mode: QueueMode,
    /// Inputs arriving within this window are coalesced before policy
    /// evaluation. 0 disables debouncing.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_queue_cap")]
    pub cap: usize,
    #[serde(default)]
    pub drop: DropRule,
    /// Per-surface mode overrides.
    #[serde(default)]
    pub by_surface: HashMap<String, QueueMode>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            mode: QueueMode::default(),
            debounce_ms: default_debounce_ms(),
            cap: default_queue_cap(),
            drop: DropRule::default(),
            by_surface: HashMap::new(),
        }
    }
}

impl QueueSettings {
    /// Effective mode for a surface.
    pub fn mode_for(&self, surface: &str) -> QueueMode {
        self.by_surface.get(surface).copied().unwrap_or(self.mode)
    }
}

// ============================================================================
// Run Limits
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct RunLimits {
    /// Global cap on concurrent runs; excess submissions queue FIFO.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Per-run deadline; exceeding it cancels the run and flushes partial output.
    #[serde(default = "default_run_timeout")]
    pub timeout_seconds: u64,
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            timeout_seconds: default_run_timeout(),
        }
    }
}

// ============================================================================
// Reply Shaping
// ============================================================================

/// Where block-sized chunks break when slicing assistant output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakPreference {
    #[default]
    Paragraph,
    Newline,
    Sentence,
}

/// Which stream boundary flushes a pending block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockBreak {
    /// Flush pending text at each text_end.
    TextEnd,
    /// Flush only at message_end.
    #[default]
    MessageEnd,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChunkingConfig {
    #[serde(default = "default_min_chars")]
    pub min_chars: usize,
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default)]
    pub break_preference: BreakPreference,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            min_chars: default_min_chars(),
            max_chars: default_max_chars(),
            break_preference: BreakPreference::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReplyConfig {
    /// Publish only the contents between `<final>` and `</final>`.
    #[serde(default)]
    pub enforce_final_tag: bool,
    #[serde(default)]
    pub block_chunking: ChunkingConfig,
    #[serde(default)]
    pub block_reply_break: BlockBreak,
}

// ============================================================================
// Heartbeat Jobs
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatJobConfig {
    /// Session the wakeup runs against.
    pub session_key: String,
    /// Cadence, e.g. "30m", "2h", "45s".
    pub every: String,
    /// Optional model override for heartbeat runs.
    #[serde(default)]
    pub model: Option<String>,
    /// Prompt override; defaults to the literal HEARTBEAT token.
    #[serde(default = "default_heartbeat_prompt")]
    pub prompt: String,
    /// Delivery target: "last", "none", or a surface name.
    #[serde(default = "default_heartbeat_target")]
    pub target: String,
}

/// Parse a cadence like "30m", "2h", "45s", or "1d" into a duration.
pub fn parse_cadence(s: &str) -> Option<std::time::Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let (num, unit) = s.split_at(s.len() - 1);
    let value: u64 = num.parse().ok()?;
    if value == 0 {
        return None;
    }
    let secs = match unit {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        "d" => value * 86400,
        _ => return None,
    };
    Some(std::time::Duration::from_secs(secs))
}

// ============================================================================
// Webhook Hooks
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookAction {
    /// Fire a wake pulse.
    Wake,
    /// Create or reuse a session and submit a full agent run.
    Agent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WakeMode {
    #[default]
    Now,
    NextHeartbeat,
}

/// Match rule for `POST /hooks/<name>` dispatch.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HookMatch {
    /// Match the trailing path segment.
    #[serde(default)]
    pub path: Option<String>,
    /// Match a `source` field in the JSON payload.
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HookMapping {
    pub name: String,
    #[serde(rename = "match", default)]
    pub match_rule: HookMatch,
    pub action: HookAction,
    /// Session key template; `{{path.to.field}}` reads into the payload.
    #[serde(default)]
    pub session_key: Option<String>,
    /// Message template with the same substitution vocabulary.
    #[serde(default)]
    pub message_template: Option<String>,
    #[serde(default)]
    pub wake_mode: WakeMode,
    /// Name of a registered transform applied to the payload before dispatch.
    #[serde(default)]
    pub transform: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HooksConfig {
    #[serde(default)]
    pub mappings: Vec<HookMapping>,
}

// ============================================================================
// Agent Runner
// ============================================================================

/// The agent subprocess invoked once per run.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentConfig {
    /// Command to execute (path to the agent binary).
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Default model identifier passed through to the agent.
    #[serde(default)]
    pub model: Option<String>,
}

// ============================================================================
// Delivery
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "default_delivery_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_delivery_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_delivery_attempts(),
            backoff_ms: default_delivery_backoff_ms(),
        }
    }
}

// ============================================================================
// Transport Drivers
// ============================================================================

/// Configuration for all transport drivers.
#[derive(Debug, Default, Deserialize)]
pub struct GatewaysConfig {
    /// External driver subprocesses.
    #[serde(default)]
    pub external: Vec<ExternalGatewayConfig>,
}

/// Configuration for an external (subprocess) transport driver.
#[derive(Debug, Clone, Deserialize)]
pub struct ExternalGatewayConfig {
    /// Driver name; doubles as the surface name for routing and logging.
    pub name: String,

    /// Command to execute (path to binary).
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default)]
    pub restart: RestartPolicy,
}

/// Restart policy for external drivers.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicy {
    /// Always restart on exit.
    Always,
    /// Restart only on non-zero exit.
    #[default]
    OnFailure,
    /// Never restart.
    Never,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8390);
        assert_eq!(config.server.body_limit_bytes, 256 * 1024);
        assert_eq!(config.session.scope, SessionScope::Global);
        assert_eq!(config.session.main_key, "main");
        assert_eq!(config.queue.mode, QueueMode::Collect);
        assert_eq!(config.runs.max_concurrent, 4);
        assert_eq!(config.runs.timeout_seconds, 600);
        assert_eq!(config.reply.block_chunking.min_chars, 800);
        assert_eq!(config.reply.block_chunking.max_chars, 1200);
        assert!(config.surfaces.is_empty());
        assert!(config.heartbeats.is_empty());
    }

    #[tokio::test]
    async fn load_missing_file_returns_defaults() {
        let config = Config::load("/nonexistent/switchboard.yaml").await.unwrap();
        assert_eq!(config.server.port, 8390);
    }

    #[tokio::test]
    async fn load_parses_surfaces_and_queue() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
surfaces:
  telegram:
    allow_from: ["+15555550123"]
    mention_patterns: ["@clawd"]
    groups:
      "*":
        require_mention: true
queue:
  mode: steer
  debounce_ms: 250
  cap: 3
  drop: summarize
  by_surface:
    webchat: followup
"#
        )
        .unwrap();

        let config = Config::load(file.path()).await.unwrap();
        let surface = config.surfaces.get("telegram").unwrap();
        assert!(surface.enabled);
        assert_eq!(surface.allow_from.as_deref(), Some(&["+15555550123".to_string()][..]));
        assert!(surface.groups.contains_key("*"));
        assert_eq!(config.queue.mode, QueueMode::Steer);
        assert_eq!(config.queue.mode_for("webchat"), QueueMode::Followup);
        assert_eq!(config.queue.mode_for("telegram"), QueueMode::Steer);
        assert_eq!(config.queue.drop, DropRule::Summarize);
    }

    #[tokio::test]
    async fn load_expands_env_vars() {
        // SAFETY: test-local variable, no concurrent reader depends on it.
        unsafe { std::env::set_var("SWITCHBOARD_TEST_TOKEN", "sekrit") };
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
server:
  token: ${{SWITCHBOARD_TEST_TOKEN}}
  host: ${{SWITCHBOARD_TEST_HOST:-127.0.0.1}}
"#
        )
        .unwrap();

        let config = Config::load(file.path()).await.unwrap();
        assert_eq!(config.server.token.as_deref(), Some("sekrit"));
        assert_eq!(config.server.host, "127.0.0.1");
    }

    #[test]
    fn expand_missing_required_var_errors() {
        let result = expand_env_vars("token: ${SWITCHBOARD_NO_SUCH_VAR}");
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(_))));
    }

    #[test]
    fn expand_unclosed_reference_errors() {
        let result = expand_env_vars("token: ${OOPS");
        assert!(matches!(result, Err(ConfigError::UnclosedVarReference)));
    }

    #[test]
    fn expand_escaped_dollar() {
        assert_eq!(expand_env_vars("price: $$100").unwrap(), "price: $100");
        assert_eq!(expand_env_vars("price: $100").unwrap(), "price: $100");
        // Escaping suppresses expansion of a following reference.
        assert_eq!(
            expand_env_vars("raw: $${NOT_A_VAR}").unwrap(),
            "raw: ${NOT_A_VAR}"
        );
    }

    #[test]
    fn expand_empty_default_yields_empty_string() {
        assert_eq!(
            expand_env_vars("key: ${SWITCHBOARD_NO_SUCH_VAR:-}").unwrap(),
            "key: "
        );
    }

    #[test]
    fn parse_cadence_units() {
        assert_eq!(parse_cadence("45s"), Some(std::time::Duration::from_secs(45)));
        assert_eq!(parse_cadence("30m"), Some(std::time::Duration::from_secs(1800)));
        assert_eq!(parse_cadence("2h"), Some(std::time::Duration::from_secs(7200)));
        assert_eq!(parse_cadence("1d"), Some(std::time::Duration::from_secs(86400)));
        assert_eq!(parse_cadence("0m"), None);
        assert_eq!(parse_cadence("30x"), None);
        assert_eq!(parse_cadence(""), None);
        assert_eq!(parse_cadence("m"), None);
    }

    #[test]
    fn resolve_path_absolute_passthrough() {
        let config_path = Path::new("/etc/switchboard/switchboard.yaml");
        let abs = Path::new("/var/lib/switchboard");
        assert_eq!(resolve_path(config_path, abs), PathBuf::from("/var/lib/switchboard"));
    }

    #[test]
    fn resolve_path_relative_to_config_dir() {
        let config_path = Path::new("/etc/switchboard/switchboard.yaml");
        let rel = Path::new("state");
        assert_eq!(
            resolve_path(config_path, rel),
            PathBuf::from("/etc/switchboard/state")
        );
    }
}
