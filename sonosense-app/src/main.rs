mod ingest;

use crate::ingest::AppState;
use sonosense_core::clock::{Clock, SystemClock};
use sonosense_core::streaming::StreamingApi;
use sonosense_core::{
    CoreError, Database, EventStore, SecretStore, SensorStore, SonosenseConfig, UserStore,
};
use sonosense_engine::{MotionDispatcher, SessionRegistry, TimeoutSweeper, TokenRefresher};
use sonosense_spotify_api::SpotifyApiClient;
use std::fs::File;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Interval between TTL purge passes (once a day).
const PURGE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[tokio::main]
async fn main() {
    let file_logging_enabled = check_file_logging_enabled();
    init_tracing(file_logging_enabled);

    let config = match SonosenseConfig::load_or_create() {
        Ok(config) => config,
        Err(CoreError::ConfigNotFound { path }) => {
            eprintln!(
                "A configuration template has been created at {}.\n\
                 Edit it with your Spotify credentials and restart.",
                path.display()
            );
            std::process::exit(1);
        }
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = config.streaming.validate() {
        error!("{e}");
        error!(
            "Get Spotify credentials from https://developer.spotify.com/dashboard \
             and set them in {} or via the environment.",
            SonosenseConfig::config_path().display()
        );
        std::process::exit(1);
    }

    if let Err(e) = run(config).await {
        error!("sonosense exited with error: {e}");
        std::process::exit(1);
    }
}

#[allow(clippy::too_many_lines)]
async fn run(config: SonosenseConfig) -> Result<(), CoreError> {
    let db = Database::open(&config.store.db_path).await?;
    let secrets = Arc::new(SecretStore::new(
        config.secrets.dir.clone(),
        Duration::from_secs(config.secrets.cache_ttl_secs),
        config.secrets.cache_capacity,
    )?);

    let call_timeout = Duration::from_secs(config.engine.call_timeout_secs);
    let spotify = SpotifyApiClient::with_timeout(call_timeout)?;
    let streaming: Arc<dyn StreamingApi> = Arc::new(spotify);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let sensors = SensorStore::new(&db);
    let users = UserStore::new(&db);
    let events = EventStore::new(&db);
    let registry = Arc::new(SessionRegistry::new(&db, config.engine.session_ttl_days));

    let dispatcher = Arc::new(MotionDispatcher::new(
        sensors.clone(),
        users.clone(),
        events,
        Arc::clone(&registry),
        Arc::clone(&secrets),
        Arc::clone(&streaming),
        Arc::clone(&clock),
        config.engine.session_ttl_days,
        Duration::from_secs(config.engine.dispatch_budget_secs),
    ));

    // Shared cancellation token for graceful shutdown on Ctrl+C.
    let cancel_token = CancellationToken::new();
    let ctrlc_token = cancel_token.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received Ctrl+C, shutting down gracefully...");
        ctrlc_token.cancel();
    }) {
        error!("Failed to set Ctrl+C handler: {}", e);
    }

    let sweeper = Arc::new(TimeoutSweeper::new(
        Arc::clone(&registry),
        sensors,
        users.clone(),
        Arc::clone(&secrets),
        Arc::clone(&streaming),
        Arc::clone(&clock),
        Duration::from_secs(config.engine.sweep_interval_secs),
        Some(cancel_token.clone()),
    ));
    let sweeper_handle = sweeper.start();

    let refresher = Arc::new(TokenRefresher::new(
        users,
        Arc::clone(&secrets),
        Arc::clone(&streaming),
        Arc::clone(&clock),
        config.streaming.client_id.clone(),
        config.streaming.client_secret.clone(),
        config.engine.token_refresh_buffer_minutes,
        Duration::from_secs(config.engine.refresh_interval_secs),
        Some(cancel_token.clone()),
    ));
    let refresher_handle = refresher.start();

    let purge_handle = tokio::spawn(purge_loop(
        db.clone(),
        Arc::clone(&clock),
        cancel_token.clone(),
    ));

    // Motion ingress.
    let app = ingest::router(AppState {
        dispatcher: Arc::clone(&dispatcher),
    });
    let listener = tokio::net::TcpListener::bind(&config.ingest.bind_addr).await?;
    info!("Motion ingress listening on {}", config.ingest.bind_addr);

    let shutdown_token = cancel_token.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown_token.cancelled().await })
        .await?;

    // Let the scheduled loops wind down, then flush the store.
    let _ = sweeper_handle.await;
    let _ = refresher_handle.await;
    let _ = purge_handle.await;

    if let Err(e) = db.checkpoint().await {
        warn!("WAL checkpoint on shutdown failed: {}", e);
    }
    info!("Shutdown complete");
    Ok(())
}

/// Daily pass deleting sessions and events whose TTL has lapsed.
async fn purge_loop(db: Database, clock: Arc<dyn Clock>, cancel_token: CancellationToken) {
    loop {
        tokio::select! {
            () = cancel_token.cancelled() => break,
            () = tokio::time::sleep(PURGE_INTERVAL) => {
                match db.purge_expired(clock.epoch()).await {
                    Ok(deleted) if deleted > 0 => info!("Purged {} expired records", deleted),
                    Ok(_) => {}
                    Err(e) => warn!("TTL purge failed: {}", e),
                }
            }
        }
    }
}

/// Check if file logging is enabled by reading the config file.
/// This is done before full config loading to set up tracing first.
/// Returns `false` if config doesn't exist or can't be parsed.
fn check_file_logging_enabled() -> bool {
    #[derive(serde::Deserialize)]
    struct PartialConfig {
        #[serde(default)]
        logging: PartialLoggingConfig,
    }
    #[derive(serde::Deserialize, Default)]
    struct PartialLoggingConfig {
        #[serde(default)]
        enabled: bool,
    }

    let config_path = SonosenseConfig::config_path();
    let Ok(content) = std::fs::read_to_string(&config_path) else {
        return false;
    };

    toml::from_str::<PartialConfig>(&content).is_ok_and(|c| c.logging.enabled)
}

/// Initialize tracing with console output and optional file logging
fn init_tracing(file_logging_enabled: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = tracing_subscriber::fmt::layer();

    if file_logging_enabled {
        let log_path = sonosense_core::paths::log_file_path();

        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        match File::create(&log_path) {
            Ok(file) => {
                let file_layer = tracing_subscriber::fmt::layer()
                    .with_writer(Arc::new(file))
                    .with_ansi(false);

                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt_layer)
                    .with(file_layer)
                    .init();

                return;
            }
            Err(e) => {
                eprintln!("Failed to create log file at {}: {e}", log_path.display());
            }
        }
    }

    // Fallback: console only
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
