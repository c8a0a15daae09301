//! Courier attachment server.
//!
//! Wires storage, scanning, persistence, and the HTTP surface together.
//! Without DATABASE_URL everything runs on in-memory repositories, which
//! is enough for local development against the full upload pipeline.

use std::sync::Arc;
use std::time::Instant;

use axum::routing::get;
use axum::Router;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use courier_api::AppState;
use courier_attachments::{
    AccessTokenService, AttachmentRepo, AttachmentService, ExpirySweeper, MemoryAttachmentRepo,
    MemorySessionRepo, SessionRepo,
};
use courier_core::config::AppConfig;
use courier_core::events::{MemoryDirectory, MemoryMessageGateway, MemoryPublisher};
use courier_db::{Database, DatabaseConfig, PgAttachmentRepo, PgSessionRepo};
use courier_scan::ClamAvScanner;
use courier_storage::BlobStore;

mod health;

use health::HealthState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    dotenvy::dotenv().ok();
    let config = AppConfig::from_env();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %config.server.host,
        port = config.server.port,
        scanner_enabled = config.scanner.enabled,
        "Starting Courier"
    );

    let store = BlobStore::new(&config.storage);
    store.init().await?;

    let db = match &config.server.database_url {
        Some(url) => match Database::connect(&DatabaseConfig::with_url(url)).await {
            Ok(db) => {
                info!("Connected to database");
                Some(db)
            }
            Err(err) => {
                warn!(error = %err, "Database unavailable; falling back to in-memory repositories");
                None
            }
        },
        None => {
            info!("No DATABASE_URL set; using in-memory repositories");
            None
        }
    };

    let (attachments, sessions): (Arc<dyn AttachmentRepo>, Arc<dyn SessionRepo>) = match &db {
        Some(db) => (
            Arc::new(PgAttachmentRepo::new(db.pool().clone())),
            Arc::new(PgSessionRepo::new(db.pool().clone())),
        ),
        None => (
            Arc::new(MemoryAttachmentRepo::new()),
            Arc::new(MemorySessionRepo::new()),
        ),
    };

    let directory = Arc::new(MemoryDirectory::new());
    seed_users(&directory).await;
    let publisher = Arc::new(MemoryPublisher::new());

    let service = AttachmentService::new(
        attachments.clone(),
        sessions.clone(),
        store.clone(),
        Arc::new(ClamAvScanner::new(config.scanner.clone())),
        directory,
        Arc::new(MemoryMessageGateway::new()),
        publisher.clone(),
        AccessTokenService::new(&config.token),
        config.limits.clone(),
        config.server.public_base_url.clone(),
    );

    let sweeper = ExpirySweeper::new(attachments, sessions, store, publisher, &config.limits);
    let sweeper_handle = sweeper.spawn();

    let health_state = Arc::new(HealthState {
        started_at: Instant::now(),
        db,
    });
    let app = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .with_state(health_state)
        .merge(courier_api::router().with_state(AppState::new(service)))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                ),
        );

    let addr = config.server_addr();
    info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper_handle.abort();
    info!("Server shutdown complete");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,courier_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

/// Seed the standalone user directory from COURIER_USERS
/// ("1:alice,2:bob"). Production deployments replace the directory with
/// the account subsystem's implementation.
async fn seed_users(directory: &MemoryDirectory) {
    let Ok(raw) = std::env::var("COURIER_USERS") else {
        return;
    };
    for entry in raw.split(',') {
        let Some((id, name)) = entry.split_once(':') else {
            warn!(entry = entry, "Ignoring malformed COURIER_USERS entry");
            continue;
        };
        match id.trim().parse() {
            Ok(id) => directory.add_user(id, name.trim()).await,
            Err(_) => warn!(entry = entry, "Ignoring malformed COURIER_USERS entry"),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            warn!("Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown"),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown"),
    }
}
