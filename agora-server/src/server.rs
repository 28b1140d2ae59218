use std::{
    net::SocketAddr,
    sync::{Arc, OnceLock},
    time::Duration,
};

use anyhow::Context;
use axum::{
    Extension, Router,
    http::{HeaderValue, StatusCode, header},
    response::IntoResponse,
    routing::get,
    serve,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use shared::config::server::{Config, LogFormat};
use sqlx::postgres::PgPoolOptions;
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{EnvFilter, fmt};

use crate::{
    app_state::AppState,
    bus::{ChatTransport, Publisher, RedisTransport, RoomHub, Subscriber},
    cache::RoomCacheRepository,
    db::{PgRoomDirectory, RoomDirectory, ensure_liveness},
    routes,
    services::{EditLockService, RoomService},
    store::{KeyValueStore, RedisStore, keys::CachePolicy},
    tracer,
};

const DB_MAX_CONNECTIONS: u32 = 5;

/// How often channels of rooms without local sessions are dropped.
const HUB_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Process-wide Prometheus handle. The recorder is installed on first use.
pub(crate) fn metrics_handle() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let recorder = PrometheusBuilder::new().build_recorder();
            let handle = recorder.handle();
            if metrics::set_global_recorder(recorder).is_err() {
                warn!("a metrics recorder was already installed");
            }
            handle
        })
        .clone()
}

async fn metrics_endpoint(Extension(handle): Extension<PrometheusHandle>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4"),
        )],
        handle.render(),
    )
}

/// Initializes the tracing subscriber for logging using the provided configuration.
pub fn initialize_tracing(config: &Config) -> String {
    let env_filter = build_env_filter(config);

    let fmt_builder = fmt::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false);

    let installed = if matches!(config.log_format, LogFormat::Json) {
        fmt_builder.json().with_ansi(false).try_init()
    } else {
        fmt_builder.with_ansi(true).try_init()
    };
    if installed.is_err() {
        warn!("tracing subscriber already installed, keeping it");
    }

    config.log_level.clone()
}

fn build_env_filter(config: &Config) -> EnvFilter {
    let default_level = config
        .log_level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);

    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::builder()
            .with_default_directive(default_level.into())
            .from_env_lossy()
    })
}

/// Creates the store-of-record connection pool.
///
/// # Errors
/// Returns an error if the database connection pool cannot be created.
pub async fn create_database_pool(url: &str) -> Result<sqlx::PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(DB_MAX_CONNECTIONS)
        .connect(url)
        .await?;
    metrics::gauge!("db_pool_max_connections").set(f64::from(DB_MAX_CONNECTIONS));
    Ok(pool)
}

/// Health, readiness and metrics endpoints with request tracing.
pub fn create_app_router(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    Router::new()
        .merge(routes::health::create_health_router())
        .route("/metrics", get(metrics_endpoint))
        .layer(Extension(metrics_handle))
        .layer(tracer::create_trace_layer())
        .with_state(state)
}

/// Resolves when a shutdown signal is received.
pub async fn create_shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for ctrl-c, shutting down");
    }
    info!("Shutting down...");
}

/// Runs the chat bus listener until `cancel` fires.
pub fn spawn_bus_listener(
    hub: Arc<RoomHub>,
    transport: Arc<dyn ChatTransport>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let subscriber = Subscriber::new(hub);
    tokio::spawn(async move { subscriber.run(transport, cancel).await })
}

fn spawn_hub_pruner(hub: Arc<RoomHub>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HUB_PRUNE_INTERVAL);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    hub.prune();
                }
            }
        }
    })
}

/// Connects every backend, warms the room cache, starts the bus listener and
/// serves the health endpoints until shutdown.
///
/// # Errors
/// Returns an error if a backend is unreachable at startup or the listener
/// cannot bind.
pub async fn run(config: Config) -> anyhow::Result<()> {
    initialize_tracing(&config);
    info!(port = config.server_port, "Starting server...");

    let metrics_handle = metrics_handle();
    let command_timeout = config.cache.command_timeout();

    let pool = create_database_pool(&config.database_url)
        .await
        .context("connecting to the store of record")?;
    ensure_liveness(&pool)
        .await
        .context("store of record liveness check")?;
    let directory: Arc<dyn RoomDirectory> = Arc::new(PgRoomDirectory::new(pool));

    let client = redis::Client::open(config.redis_url.as_str()).context("parsing redis url")?;
    let store: Arc<dyn KeyValueStore> = Arc::new(
        RedisStore::connect(&client, command_timeout)
            .await
            .context("connecting to the shared store")?,
    );
    let transport: Arc<dyn ChatTransport> = Arc::new(
        RedisTransport::connect(client, config.bus.channel.clone(), command_timeout)
            .await
            .context("connecting the chat bus")?,
    );

    let cache = RoomCacheRepository::new(
        store.clone(),
        directory.clone(),
        CachePolicy::from(&config.cache),
    );
    let rooms = RoomService::new(cache, directory);
    match rooms.warm_up(config.cache.warm_up_size).await {
        Ok(warmed) => info!(warmed, "room cache warmed"),
        Err(err) => warn!(error = %err, "room cache warm-up failed, starting cold"),
    }

    let hub = Arc::new(RoomHub::default());
    let state = Arc::new(AppState::new(
        store.clone(),
        rooms,
        EditLockService::new(store, config.lock.lease()),
        Publisher::new(transport.clone()),
        hub.clone(),
    ));

    let cancel = CancellationToken::new();
    let listener_task = spawn_bus_listener(hub.clone(), transport, cancel.clone());
    let pruner_task = spawn_hub_pruner(hub, cancel.clone());

    let app = create_app_router(state, metrics_handle);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("Listening on {}", addr);

    let shutdown = cancel.clone();
    serve(listener, app)
        .with_graceful_shutdown(async move {
            create_shutdown_signal().await;
            shutdown.cancel();
        })
        .await?;

    cancel.cancel();
    let (listener_result, pruner_result) = tokio::join!(listener_task, pruner_task);
    if let Err(err) = listener_result.and(pruner_result) {
        warn!(error = %err, "background task ended abnormally");
    }
    info!("server stopped");
    Ok(())
}
