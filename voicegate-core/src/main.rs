//! voicegate server binary.
//!
//! Wires the switch adapter, orchestrator, ASR/TTS clients, and admin
//! surface together and runs until SIGINT/SIGTERM.
//!
//! Usage: voicegate-server [config.json]
//! Configuration also honors the VOICEGATE_* environment overrides.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use voicegate_core::admin::{self, AdminState};
use voicegate_core::allowlist::Allowlist;
use voicegate_core::asr::AsrManager;
use voicegate_core::call::{BridgeRegistry, CallRegistry, EventBus};
use voicegate_core::config::Config;
use voicegate_core::orchestrator::Orchestrator;
use voicegate_core::switch::{spawn_event_pump, HttpSwitch, StasisWaiters, SwitchApi};
use voicegate_core::tts::TtsClient;
use voicegate_core::util::TimerSet;
use voicegate_core::webhook::WebhookNotifier;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("VOICEGATE_CONFIG").ok())
        .map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;

    info!("voicegate starting");
    info!("  switch: {} (app {})", config.switch.url, config.switch.app);
    info!(
        "  asr: {}",
        config.asr.url.as_deref().unwrap_or("(disabled)")
    );
    info!(
        "  tts: {}",
        config.tts.url.as_deref().unwrap_or("(disabled)")
    );

    let http_switch = HttpSwitch::new(&config.switch);
    let events_url = http_switch.events_url();
    let link_flag = http_switch.link_flag();
    let switch: Arc<dyn SwitchApi> = Arc::new(http_switch);

    let bus = EventBus::default();
    let timers = TimerSet::new();
    let registry = CallRegistry::new(bus.clone(), Arc::clone(&timers));
    let bridges = Arc::new(BridgeRegistry::new(bus.clone()));
    let webhook = WebhookNotifier::new(config.webhook.url.clone());
    let asr = AsrManager::new(config.asr.clone(), bus.clone(), Arc::clone(&webhook));
    let tts = TtsClient::new(config.tts.clone());
    let allowlist = match &config.allowlist.path {
        Some(path) => Allowlist::from_file(path.clone()),
        None => Allowlist::allow_all(),
    };
    let _watcher = allowlist.spawn_watcher();
    let waiters = StasisWaiters::new();

    let orchestrator = Orchestrator::new(
        config.clone(),
        Arc::clone(&switch),
        registry,
        bridges,
        allowlist,
        asr,
        tts,
        webhook,
        bus,
        Arc::clone(&timers),
        waiters,
    );

    // Switch event link with auto-reconnect.
    let (event_tx, event_rx) = mpsc::channel(256);
    let pump = spawn_event_pump(events_url, link_flag, event_tx);
    let event_loop = tokio::spawn(Arc::clone(&orchestrator).run(event_rx));

    // All state is in-memory; reconstruct the administrative bridge view
    // from the switch once at startup.
    {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            match orchestrator.switch().list_bridges().await {
                Ok(bridges) => orchestrator.bridge_registry().sync_from(&bridges),
                Err(e) => tracing::warn!("bridge listing failed at startup: {e}"),
            }
        });
    }

    // Admin surface.
    let addr: SocketAddr = format!("{}:{}", config.admin.host, config.admin.port).parse()?;
    let admin_state = AdminState {
        orchestrator: Arc::clone(&orchestrator),
        api_key: config.admin.api_key.clone(),
    };
    let admin = tokio::spawn(async move {
        if let Err(e) = admin::serve(admin_state, addr).await {
            error!("admin surface error: {e}");
        }
    });

    info!("voicegate started");
    shutdown_signal().await;
    info!("shutdown signal received");

    orchestrator.shutdown().await;
    pump.abort();
    event_loop.abort();
    admin.abort();

    info!("voicegate stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
