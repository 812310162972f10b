//! Daemon startup: wiring, signal handling, exit codes.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use switchboard::config::{self, Config};
use switchboard::delivery::DeliveryDispatcher;
use switchboard::gate::Gate;
use switchboard::gateway::{GatewayManager, InboundHandler, SubprocessGateway};
use switchboard::heartbeat::HeartbeatScheduler;
use switchboard::hooks::HookRegistry;
use switchboard::run::{RunCoordinator, SubprocessRunner};
use switchboard::server::{self, AppState};
use switchboard::session::{SessionManager, SessionStore};

/// Bounded wait for active runs at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Exit code for a SIGINT-driven shutdown.
pub const EXIT_CANCELLED: i32 = 130;
/// Exit code when the session store becomes persistently unwritable.
pub const EXIT_STORE_FATAL: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Interrupt,
    Terminate,
    StoreFatal,
}

pub async fn run(
    config_path: &str,
    host_override: Option<IpAddr>,
    port_override: Option<u16>,
) -> Result<i32> {
    let mut cfg = Config::load(config_path)
        .await
        .context("failed to load config")?;
    cfg.log_warnings();

    if let Some(host) = host_override {
        cfg.server.host = host.to_string();
    }
    if let Some(port) = port_override {
        cfg.server.port = port;
    }

    // Resolve the state directory relative to the config file.
    let config_path_ref = Path::new(config_path);
    let state_dir = cfg
        .state_dir
        .as_ref()
        .map(|p| config::resolve_path(config_path_ref, p))
        .unwrap_or_else(|| {
            config::resolve_path(config_path_ref, Path::new(config::DEFAULT_STATE_DIR))
        });
    let sessions_path = state_dir.join(config::SESSIONS_FILE);

    // Session store and table recovery.
    let (store, recovered) = SessionStore::open(&sessions_path)
        .await
        .context("cannot open session store")?;
    let sessions = Arc::new(SessionManager::new(
        cfg.session.clone(),
        store.clone(),
        recovered,
    ));

    // Gate, transports, delivery, runs.
    let gate = Arc::new(Gate::new(&cfg.surfaces));
    let gateways = GatewayManager::new(Duration::from_secs(cfg.runs.timeout_seconds));
    let control = gateways.control();
    let delivery = Arc::new(DeliveryDispatcher::new(
        gateways.clone(),
        cfg.delivery.clone(),
    ));
    let runner = Arc::new(SubprocessRunner::new(cfg.agent.clone()));
    let coordinator = RunCoordinator::new(
        runner,
        sessions.clone(),
        delivery.clone(),
        cfg.queue.clone(),
        cfg.runs.clone(),
        cfg.reply.clone(),
        cfg.agent.model.clone(),
    );

    // Inbound pipeline.
    let handler = InboundHandler::new(gate.clone(), sessions.clone(), coordinator.clone());
    gateways.set_handler(Arc::new(handler)).await;

    // External transport drivers.
    for gateway_cfg in &cfg.gateways.external {
        let mut resolved = gateway_cfg.clone();
        resolved.command = config::resolve_path(config_path_ref, Path::new(&gateway_cfg.command))
            .to_string_lossy()
            .to_string();
        let name = resolved.name.clone();
        let (cmd_rx, evt_tx) = gateways.register(&name).await;
        let gateway = SubprocessGateway::new(resolved);
        tokio::spawn(async move {
            gateway.run(evt_tx, cmd_rx).await;
        });
        info!(surface = %name, "Driver subprocess started");
    }

    // Idle sweep: the manager rate-limits itself to once per minute.
    {
        let sweep_sessions = sessions.clone();
        let sweep_coordinator = coordinator.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            interval.tick().await; // skip the immediate tick
            loop {
                interval.tick().await;
                sweep_sessions.sweep_idle(|key| sweep_coordinator.is_active(key));
            }
        });
    }

    // Heartbeats.
    let heartbeat = Arc::new(HeartbeatScheduler::new(
        coordinator.clone(),
        sessions.clone(),
        delivery.clone(),
        control,
    ));
    let heartbeat_shutdown = CancellationToken::new();
    heartbeat.start(&cfg.heartbeats, heartbeat_shutdown.clone());

    // Webhook surface.
    let hooks = Arc::new(HookRegistry::new(cfg.hooks.mappings.clone()));
    let state = AppState {
        sessions: sessions.clone(),
        coordinator: coordinator.clone(),
        heartbeat: heartbeat.clone(),
        gate,
        hooks,
        token: cfg.server.token.clone(),
        start_time: std::time::Instant::now(),
    };
    let app = server::build_app(
        state,
        cfg.server.request_timeout_seconds,
        cfg.server.body_limit_bytes,
        cfg.server.max_connections,
    );

    let ip: IpAddr = cfg.server.host.parse().context("invalid server.host")?;
    let addr = SocketAddr::new(ip, cfg.server.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind listener on {addr}"))?;

    info!(addr = %addr, "Switchboard listening");

    let stop_reason = Arc::new(Mutex::new(None::<StopReason>));
    let shutdown_fut = {
        let stop_reason = stop_reason.clone();
        let store = store.clone();
        async move {
            let reason = shutdown_signal(&store).await;
            *stop_reason.lock().expect("stop reason lock") = Some(reason);
        }
    };

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_fut)
    .await
    .context("server error")?;

    // Orderly teardown: stop intake, drain runs, flush state.
    heartbeat_shutdown.cancel();
    coordinator.shutdown(SHUTDOWN_GRACE).await;
    gateways.shutdown().await;
    store.flush().await;
    info!("Switchboard stopped");

    let reason = stop_reason.lock().expect("stop reason lock").take();
    Ok(match reason {
        Some(StopReason::Interrupt) => EXIT_CANCELLED,
        Some(StopReason::StoreFatal) => EXIT_STORE_FATAL,
        Some(StopReason::Terminate) | None => 0,
    })
}

async fn shutdown_signal(store: &SessionStore) -> StopReason {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
            StopReason::Interrupt
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
            StopReason::Terminate
        }
        _ = store.unwritable() => {
            error!("Session store persistently unwritable, shutting down");
            StopReason::StoreFatal
        }
    }
}
