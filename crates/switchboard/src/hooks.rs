//! Token-gated webhook ingestor.
//!
//! Three endpoints translate external HTTP events into gateway actions:
//!
//! - `POST /hooks/wake` — fire an immediate wake or defer to the next
//!   heartbeat.
//! - `POST /hooks/agent` — create or reuse a session and submit a run.
//! - `POST /hooks/<name>` — resolve through configured mappings, with
//!   `{{path.to.field}}` template substitution against the JSON body and
//!   an optional named transform.
//!
//! Auth accepts `Authorization: Bearer <token>`, `X-Gateway-Token:
//! <token>`, or `?token=<token>`. Missing or wrong token is 401; with no
//! token configured only loopback callers pass. Oversized bodies are 413
//! (body-limit layer), non-JSON bodies 400.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::{HookAction, HookMapping, WakeMode};
use crate::run::{DeliverTarget, RunInput, RunOptions, Submission};
use crate::server::AppState;
use crate::template::{self, TemplateContext};

// ============================================================================
// Authentication
// ============================================================================

/// Check a request against the configured gateway token.
///
/// - Token configured: any of the three carriers must match (compared via
///   SHA-256 for constant time).
/// - No token: only loopback callers are allowed.
pub fn is_authorized(
    token: &Option<String>,
    addr: &SocketAddr,
    headers: &HeaderMap,
    query: Option<&str>,
) -> bool {
    let Some(expected) = token else {
        return addr.ip().is_loopback();
    };

    let provided = bearer_token(headers)
        .or_else(|| {
            headers
                .get("x-gateway-token")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .or_else(|| query_token(query));

    provided.is_some_and(|provided| {
        Sha256::digest(provided.as_bytes()) == Sha256::digest(expected.as_bytes())
    })
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

fn query_token(query: Option<&str>) -> Option<String> {
    query?
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
        .map(str::to_string)
}

/// Middleware guarding the webhook and status routes.
pub async fn require_token(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let query = request.uri().query().map(str::to_string);
    if is_authorized(&state.token, &addr, request.headers(), query.as_deref()) {
        next.run(request).await
    } else {
        StatusCode::UNAUTHORIZED.into_response()
    }
}

// ============================================================================
// Mapping Registry
// ============================================================================

/// A payload rewrite applied before dispatching a mapped hook.
pub type HookTransform = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Configured mappings plus the named transform registry.
pub struct HookRegistry {
    mappings: Vec<HookMapping>,
    transforms: HashMap<String, HookTransform>,
}

impl HookRegistry {
    pub fn new(mappings: Vec<HookMapping>) -> Self {
        Self {
            mappings,
            transforms: HashMap::new(),
        }
    }

    /// Register a named transform for `mapping.transform` references.
    pub fn register_transform(&mut self, name: impl Into<String>, transform: HookTransform) {
        self.transforms.insert(name.into(), transform);
    }

    /// First mapping whose path or payload `source` matches wins.
    pub fn find(&self, path: &str, payload: &Value) -> Option<&HookMapping> {
        let source = payload.get("source").and_then(Value::as_str);
        self.mappings.iter().find(|m| {
            m.match_rule.path.as_deref() == Some(path)
                || (m.match_rule.source.is_some() && m.match_rule.source.as_deref() == source)
        })
    }

    /// Apply the mapping's transform, if any. Unknown names pass the
    /// payload through unchanged.
    pub fn apply_transform(&self, mapping: &HookMapping, payload: Value) -> Value {
        let Some(name) = &mapping.transform else {
            return payload;
        };
        match self.transforms.get(name) {
            Some(transform) => transform(payload),
            None => {
                warn!(mapping = %mapping.name, transform = %name,
                    "Unknown hook transform, dispatching payload unchanged");
                payload
            }
        }
    }
}

// ============================================================================
// Request Bodies
// ============================================================================

#[derive(Debug, Deserialize)]
struct WakeBody {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    mode: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgentBody {
    message: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    session_key: Option<String>,
    #[serde(default)]
    wake_mode: Option<String>,
    #[serde(default)]
    deliver: Option<bool>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    to: Option<String>,
}

fn parse_json(body: &Bytes) -> Result<Value, Response> {
    serde_json::from_slice(body).map_err(|e| {
        debug!(error = %e, "Rejecting non-JSON hook body");
        (StatusCode::BAD_REQUEST, Json(json!({ "error": "invalid JSON body" })))
            .into_response()
    })
}

// ============================================================================
// Handlers
// ============================================================================

/// `POST /hooks/wake` — body `{text?, mode?}`.
pub async fn post_wake(State(state): State<AppState>, body: Bytes) -> Response {
    let payload = match parse_json(&body) {
        Ok(payload) => payload,
        Err(resp) => return resp,
    };
    let wake: WakeBody = match serde_json::from_value(payload) {
        Ok(wake) => wake,
        Err(_) => {
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": "invalid wake body" })))
                .into_response();
        }
    };

    match wake.mode.as_deref() {
        Some("next-heartbeat") => {
            state
                .heartbeat
                .queue_wake(wake.text.unwrap_or_else(|| "wake".to_string()));
            Json(json!({ "ok": true, "deferred": true })).into_response()
        }
        _ => {
            let status = state.heartbeat.wake_now(wake.text).await;
            Json(json!({ "ok": true, "status": status })).into_response()
        }
    }
}

/// `POST /hooks/agent` — body `{message, name?, sessionKey?, ...}`.
pub async fn post_agent(State(state): State<AppState>, body: Bytes) -> Response {
    let payload = match parse_json(&body) {
        Ok(payload) => payload,
        Err(resp) => return resp,
    };
    let agent: AgentBody = match serde_json::from_value(payload) {
        Ok(agent) => agent,
        Err(e) => {
            debug!(error = %e, "Rejecting malformed agent hook body");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "missing or invalid 'message'" })),
            )
                .into_response();
        }
    };

    let session_key = agent
        .session_key
        .clone()
        .or_else(|| agent.name.as_ref().map(|n| format!("hook:{n}")))
        .unwrap_or_else(|| state.sessions.main_key().to_string());

    run_agent_hook(
        &state,
        &session_key,
        agent.message,
        agent.channel,
        agent.to,
        agent.deliver,
        agent.wake_mode,
    )
    .await
}

/// `POST /hooks/<name>` — resolved through configured mappings.
pub async fn post_named(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> Response {
    let payload = match parse_json(&body) {
        Ok(payload) => payload,
        Err(resp) => return resp,
    };

    let Some(mapping) = state.hooks.find(&name, &payload).cloned() else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no mapping for hook '{name}'") })),
        )
            .into_response();
    };

    let payload = state.hooks.apply_transform(&mapping, payload);

    let mut ctx = TemplateContext::with_payload(payload);
    ctx.set("Surface", "webhook");

    let message = mapping
        .message_template
        .as_deref()
        .map(|t| template::expand(t, &ctx))
        .unwrap_or_else(|| {
            ctx.payload
                .as_ref()
                .map(|p| p.to_string())
                .unwrap_or_default()
        });

    info!(mapping = %mapping.name, action = ?mapping.action, "Dispatching mapped hook");

    match mapping.action {
        HookAction::Wake => match mapping.wake_mode {
            WakeMode::Now => {
                let status = state.heartbeat.wake_now(Some(message)).await;
                Json(json!({ "ok": true, "status": status })).into_response()
            }
            WakeMode::NextHeartbeat => {
                state.heartbeat.queue_wake(message);
                Json(json!({ "ok": true, "deferred": true })).into_response()
            }
        },
        HookAction::Agent => {
            let session_key = mapping
                .session_key
                .as_deref()
                .map(|t| template::expand(t, &ctx))
                .unwrap_or_else(|| format!("hook:{}", mapping.name));
            run_agent_hook(&state, &session_key, message, None, None, None, None).await
        }
    }
}

/// Shared agent-hook dispatch: ensure the session, submit, await, reply.
async fn run_agent_hook(
    state: &AppState,
    session_key: &str,
    message: String,
    channel: Option<String>,
    to: Option<String>,
    deliver: Option<bool>,
    wake_mode: Option<String>,
) -> Response {
    if message.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "empty message" })),
        )
            .into_response();
    }

    let is_new = if state.sessions.contains(session_key) {
        false
    } else {
        state.sessions.get_or_create(session_key, "webhook", "")
    };

    // Session-scoped variables only resolve once the session exists.
    let mut session_ctx = TemplateContext::new();
    session_ctx
        .set("SessionId", session_key)
        .set("IsNewSession", is_new.to_string());
    let message = template::expand(&message, &session_ctx);

    if wake_mode.as_deref() == Some("next-heartbeat") {
        state.heartbeat.queue_wake(message);
        return Json(json!({ "ok": true, "deferred": true, "sessionKey": session_key }))
            .into_response();
    }

    let deliver_target = match (channel, to) {
        (Some(surface), Some(to)) if deliver.unwrap_or(true) => DeliverTarget::To { surface, to },
        _ => DeliverTarget::Silent,
    };

    let submission = state
        .coordinator
        .submit_system(
            session_key,
            RunInput::new(message, "", ""),
            RunOptions {
                model: None,
                deliver: deliver_target,
            },
        )
        .await;

    match submission {
        Submission::Started(handle) => {
            let run_id = handle.run_id.clone();
            let summary = handle.wait_complete().await;
            Json(json!({
                "ok": !summary.incomplete,
                "runId": run_id,
                "sessionKey": session_key,
                "isNewSession": is_new,
                "response": summary.final_text,
            }))
            .into_response()
        }
        Submission::Dropped => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "error": "session backlog full" })),
        )
            .into_response(),
        _ => Json(json!({
            "ok": true,
            "queued": true,
            "sessionKey": session_key,
        }))
        .into_response(),
    }
}

/// `GET /status` — session counts and heartbeat state for UIs.
pub async fn get_status(State(state): State<AppState>) -> Response {
    Json(json!({
        "sessions": state.sessions.len(),
        "activeRuns": state.coordinator.active_count(),
        "heartbeats": state.heartbeat.snapshot(),
        "gateRejects": state.gate.reject_counts(),
    }))
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HookMatch;

    fn addr_local() -> SocketAddr {
        "127.0.0.1:9999".parse().unwrap()
    }

    fn addr_remote() -> SocketAddr {
        "203.0.113.7:9999".parse().unwrap()
    }

    #[test]
    fn no_token_allows_loopback_only() {
        let headers = HeaderMap::new();
        assert!(is_authorized(&None, &addr_local(), &headers, None));
        assert!(!is_authorized(&None, &addr_remote(), &headers, None));
    }

    #[test]
    fn bearer_token_accepted() {
        let token = Some("sekrit".to_string());
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer sekrit".parse().unwrap());
        assert!(is_authorized(&token, &addr_remote(), &headers, None));
    }

    #[test]
    fn gateway_token_header_accepted() {
        let token = Some("sekrit".to_string());
        let mut headers = HeaderMap::new();
        headers.insert("x-gateway-token", "sekrit".parse().unwrap());
        assert!(is_authorized(&token, &addr_remote(), &headers, None));
    }

    #[test]
    fn query_token_accepted() {
        let token = Some("sekrit".to_string());
        let headers = HeaderMap::new();
        assert!(is_authorized(
            &token,
            &addr_remote(),
            &headers,
            Some("a=b&token=sekrit")
        ));
    }

    #[test]
    fn wrong_or_missing_token_rejected() {
        let token = Some("sekrit".to_string());
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer nope".parse().unwrap());
        assert!(!is_authorized(&token, &addr_remote(), &headers, None));
        assert!(!is_authorized(&token, &addr_remote(), &HeaderMap::new(), None));
        // Loopback does not bypass a configured token.
        assert!(!is_authorized(&token, &addr_local(), &HeaderMap::new(), None));
    }

    fn mapping(name: &str, path: Option<&str>, source: Option<&str>) -> HookMapping {
        HookMapping {
            name: name.to_string(),
            match_rule: HookMatch {
                path: path.map(str::to_string),
                source: source.map(str::to_string),
            },
            action: HookAction::Wake,
            session_key: None,
            message_template: None,
            wake_mode: WakeMode::Now,
            transform: None,
        }
    }

    #[test]
    fn registry_matches_by_path_first() {
        let registry = HookRegistry::new(vec![
            mapping("github", Some("github"), None),
            mapping("generic", Some("*never*"), Some("ci")),
        ]);
        let payload = json!({ "source": "ci" });
        assert_eq!(registry.find("github", &payload).unwrap().name, "github");
        assert_eq!(registry.find("other", &payload).unwrap().name, "generic");
        assert!(registry.find("other", &json!({})).is_none());
    }

    #[test]
    fn registry_transform_applied_and_unknown_passthrough() {
        let mut registry = HookRegistry::new(vec![mapping("m", Some("m"), None)]);
        registry.register_transform(
            "uppercase",
            Arc::new(|mut v: Value| {
                if let Some(s) = v.get("text").and_then(Value::as_str) {
                    let upper = s.to_uppercase();
                    v["text"] = Value::String(upper);
                }
                v
            }),
        );

        let mut with_transform = mapping("m", Some("m"), None);
        with_transform.transform = Some("uppercase".to_string());
        let out = registry.apply_transform(&with_transform, json!({ "text": "hi" }));
        assert_eq!(out["text"], "HI");

        with_transform.transform = Some("nope".to_string());
        let out = registry.apply_transform(&with_transform, json!({ "text": "hi" }));
        assert_eq!(out["text"], "hi");
    }

    #[test]
    fn query_token_parser_handles_positions() {
        assert_eq!(query_token(Some("token=a")), Some("a".to_string()));
        assert_eq!(query_token(Some("x=1&token=a&y=2")), Some("a".to_string()));
        assert_eq!(query_token(Some("x=1")), None);
        assert_eq!(query_token(None), None);
    }
}
