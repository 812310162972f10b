//! Shared harness for end-to-end tests: a full stack wired like the
//! daemon, with a scripted agent runner in place of the real subprocess.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use switchboard::config::{
    DeliveryConfig, GroupConfig, QueueSettings, ReplyConfig, RunLimits, SessionConfig,
    SessionScope, SurfaceConfig,
};
use switchboard::delivery::DeliveryDispatcher;
use switchboard::gate::Gate;
use switchboard::gateway::{GatewayManager, InboundHandler};
use switchboard::heartbeat::HeartbeatScheduler;
use switchboard::hooks::HookRegistry;
use switchboard::run::{
    AgentEvent, AgentRunner, RunCoordinator, RunRequest, RunnerError, RunningAgent, event_stream,
};
use switchboard::server::{self, AppState};
use switchboard::session::{SessionManager, SessionStore};

/// Replies with a fixed text and records every prompt it receives.
pub struct FixedRunner {
    reply: String,
    pub prompts: Arc<Mutex<Vec<String>>>,
}

impl FixedRunner {
    pub fn new(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl AgentRunner for FixedRunner {
    async fn start(
        &self,
        request: RunRequest,
        _cancel: CancellationToken,
    ) -> Result<RunningAgent, RunnerError> {
        self.prompts.lock().await.push(request.prompt);
        let (evt_tx, evt_rx) = tokio::sync::mpsc::channel(16);
        let (input_tx, _input_rx) = tokio::sync::mpsc::channel(16);
        let reply = self.reply.clone();
        tokio::spawn(async move {
            let _ = evt_tx.send(AgentEvent::AgentStart).await;
            if !reply.is_empty() {
                let _ = evt_tx
                    .send(AgentEvent::MessageUpdate { delta: reply })
                    .await;
            }
            let _ = evt_tx.send(AgentEvent::MessageEnd).await;
            let _ = evt_tx.send(AgentEvent::AgentEnd).await;
        });
        Ok(RunningAgent {
            events: event_stream(evt_rx),
            inputs: input_tx,
        })
    }
}

pub struct TestStack {
    pub app: Router,
    pub state: AppState,
    pub gateways: GatewayManager,
    pub sessions: Arc<SessionManager>,
    pub prompts: Arc<Mutex<Vec<String>>>,
    _dir: tempfile::TempDir,
}

/// Gate config mirroring the self-chat scenario: allowlisted own number,
/// wildcard group requiring a mention, `@clawd` pattern.
pub fn self_chat_surfaces() -> HashMap<String, SurfaceConfig> {
    let mut surfaces = HashMap::new();
    surfaces.insert(
        "whatsapp".to_string(),
        SurfaceConfig {
            enabled: true,
            allow_from: Some(vec!["+15555550123".to_string()]),
            mention_patterns: vec!["@clawd".to_string()],
            groups: HashMap::from([(
                "*".to_string(),
                GroupConfig {
                    require_mention: Some(true),
                    allow_from: None,
                    mention_patterns: None,
                },
            )]),
        },
    );
    surfaces
}

pub async fn stack(
    token: Option<&str>,
    reply: &str,
    body_limit: usize,
    mappings: Vec<switchboard::config::HookMapping>,
) -> TestStack {
    let dir = tempfile::TempDir::new().unwrap();
    let (store, recovered) = SessionStore::open(dir.path().join("sessions.json"))
        .await
        .unwrap();
    let sessions = Arc::new(SessionManager::new(
        SessionConfig {
            scope: SessionScope::PerGroup,
            reset_triggers: vec!["/new".to_string()],
            ..Default::default()
        },
        store,
        recovered,
    ));

    let gate = Arc::new(Gate::new(&self_chat_surfaces()));
    let gateways = GatewayManager::new(Duration::from_secs(10));
    let delivery = Arc::new(DeliveryDispatcher::new(
        gateways.clone(),
        DeliveryConfig {
            max_attempts: 1,
            backoff_ms: 1,
        },
    ));

    let runner = FixedRunner::new(reply);
    let prompts = runner.prompts.clone();
    let coordinator = RunCoordinator::new(
        Arc::new(runner),
        sessions.clone(),
        delivery.clone(),
        QueueSettings {
            debounce_ms: 0,
            ..Default::default()
        },
        RunLimits::default(),
        ReplyConfig::default(),
        None,
    );

    let handler = InboundHandler::new(gate.clone(), sessions.clone(), coordinator.clone());
    gateways.set_handler(Arc::new(handler)).await;

    let heartbeat = Arc::new(HeartbeatScheduler::new(
        coordinator.clone(),
        sessions.clone(),
        delivery,
        gateways.control(),
    ));

    let hooks = Arc::new(HookRegistry::new(mappings));
    let state = AppState {
        sessions: sessions.clone(),
        coordinator,
        heartbeat,
        gate,
        hooks,
        token: token.map(str::to_string),
        start_time: std::time::Instant::now(),
    };
    let app = server::build_app(state.clone(), 10, body_limit, 16);

    TestStack {
        app,
        state,
        gateways,
        sessions,
        prompts,
        _dir: dir,
    }
}
