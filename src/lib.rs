pub mod types;
pub mod config;
pub mod error;
pub mod rng;
pub mod rounds;
pub mod pool_generator;
pub mod draft;
pub mod store;
pub mod broadcast;
pub mod session;
pub mod events;
pub mod orchestrator;
pub mod friendly;
pub mod resume;
pub mod overlay;
pub mod match_commands;

use types::*;
use config::*;
use broadcast::BroadcastPublisher;
use error::{MatchError, MatchResult};
use orchestrator::{spawn_stall_watchdog, Orchestrator};
use overlay::{start_overlay_server, OverlayServerState};
use resume::OpenChannels;
use rounds::RoundTable;
use store::JsonFileStore;

use std::{
    fs,
    sync::{Arc, Mutex},
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

// ── Startup ────────────────────────────────────────────────────────────

/// Open the match store under the data dir and load the active event.
pub fn build_orchestrator(config: AppConfig) -> MatchResult<Orchestrator> {
    let data_dir = data_dir_path(&config);
    let store = JsonFileStore::open(&data_dir).map_err(MatchError::Persistence)?;
    let rounds = RoundTable::load(&config.rounds_path).map_err(MatchError::Config)?;
    let publisher = BroadcastPublisher::new(config.broadcast_capacity);
    let mut orchestrator = Orchestrator::new(config, Box::new(store), publisher, rounds, now_ms())?;

    if let Some(event) = orchestrator.active_event() {
        info!("active event: {} ({})", event.name, event.id);
        if orchestrator.catalogs.is_none() {
            match orchestrator.reload_catalogs() {
                Ok(count) => info!("loaded {count} catalog charts for {}", event.name),
                Err(e) => warn!("tier catalogs not loaded: {e}"),
            }
        }
    } else {
        warn!("no active event; create one before starting matches");
    }
    Ok(orchestrator)
}

async fn serve(config: AppConfig) {
    let orchestrator = match build_orchestrator(config.clone()) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            error!("failed to start orchestrator: {e}");
            return;
        }
    };
    let publisher = orchestrator.publisher().clone();
    let shared: SharedOrchestrator = Arc::new(Mutex::new(orchestrator));

    {
        let mut guard = shared.lock().unwrap_or_else(|e| e.into_inner());
        let outcomes = guard.resume_interrupted(&OpenChannels, now_ms());
        let resumed = outcomes.iter().filter(|outcome| outcome.resumed).count();
        if !outcomes.is_empty() {
            info!("resume: {resumed} of {} interrupted matches re-attached", outcomes.len());
        }
    }

    spawn_stall_watchdog(shared.clone(), config.stall_sweep_ms);

    let overlay_dir = resolve_repo_path(&config.overlay_dir);
    let state = OverlayServerState {
        orchestrator: shared,
        publisher,
    };
    start_overlay_server(state, overlay_dir, config.http_addr.clone()).await;
}

// ── Entry point ────────────────────────────────────────────────────────

pub fn run() {
    let env_applied = load_env_file();

    // Initialize tracing with file output
    let logs_dir = logs_dir();
    fs::create_dir_all(&logs_dir).ok();
    let file_appender = tracing_appender::rolling::daily(&logs_dir, "app.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(non_blocking)
        .with_ansi(false)
        .init();
    info!("Speen orchestrator starting");
    if env_applied > 0 {
        info!("applied {env_applied} settings from .env");
    }

    let config = match load_config_inner() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}; falling back to defaults");
            apply_env_defaults(AppConfig::default())
        }
    };
    log_env_warnings(&config);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to start async runtime: {e}");
            return;
        }
    };
    runtime.block_on(serve(config));
}
