//! Haulbay server binary.
//!
//! Exposes the chunked-upload transfer core over HTTP: session start,
//! sequential chunk append, atomic finalization, progress queries, and
//! byte-range reads of completed artifacts. The main entry point builds
//! the Axum router and runs the listener until shutdown.

mod background;
mod config;
mod error;
mod logging;
mod range;
mod session;
mod storage;
mod transfer;

use axum::Router;
use axum::extract::{DefaultBodyLimit, Extension};
use axum::http::Request;
use axum::routing::{get, post};
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span};

use crate::background::spawn_background_tasks;
use crate::config::{Args, TransferConfig};
use crate::session::SessionRegistry;
use crate::storage::Storage;

/// Starts the Haulbay server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let storage = Arc::new(Storage::new(PathBuf::from(&args.data_dir)));
    let registry = Arc::new(SessionRegistry::new());
    let transfer_config = Arc::new(TransferConfig {
        max_chunk_size: args.max_chunk_size,
        finish_overwrite: args.finish_overwrite,
        session_idle_ttl: Duration::from_secs(args.session_ttl_secs),
        deploy_artifact: args.deploy_artifact.clone(),
        deploy_dir: args.deploy_dir.as_deref().map(PathBuf::from),
    });
    storage.ensure_layout().await?;

    let app = Router::new()
        .route("/upload/start", post(transfer::start_upload))
        .route(
            "/upload/chunk",
            post(transfer::upload_chunk).layer(DefaultBodyLimit::disable()),
        )
        .route("/upload/finish", post(transfer::finish_upload))
        .route("/upload/cancel", post(transfer::cancel_upload))
        .route("/upload/progress/{upload_id}", get(transfer::upload_progress))
        .route("/download-range/{name}", get(range::download_range))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(storage.clone()))
        .layer(Extension(registry.clone()))
        .layer(Extension(transfer_config.clone()));

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, args.port);

    spawn_background_tasks(registry, storage, transfer_config);

    info!("🚀 Starting transfer server at {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
}
