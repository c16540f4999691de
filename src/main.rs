//! ModelDepot binary — thin CLI shell over the [`modeldepot`] library crate.

use axum::{
    routing::{delete, get, post, put},
    Router,
};
use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;

use modeldepot::api::*;
use modeldepot::config::{self, EnvOverrides, EXIT_DATA_DIR, EXIT_FATAL_FS, EXIT_INVALID_CONFIG};
use modeldepot::ws::ws_handler;
use modeldepot::Engine;

// ---------------------------------------------------------------------------
// CLI definition (clap derive)
// ---------------------------------------------------------------------------

/// Dual-root storage coordination service for machine-learning model libraries.
#[derive(Parser)]
#[command(name = "modeldepot", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Fast working root (overrides LOCAL_MODELS_ROOT)
    #[arg(long)]
    local_root: Option<PathBuf>,

    /// Slow archival root (overrides LAKE_MODELS_ROOT)
    #[arg(long)]
    lake_root: Option<PathBuf>,

    /// App data directory for queue/cache/dedupe databases (overrides APP_DATA_DIR)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Path to web UI dist directory
    #[arg(long)]
    dist: Option<PathBuf>,

    /// Bind to 0.0.0.0 instead of 127.0.0.1 (localhost)
    #[arg(long)]
    bind_all: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

// ---------------------------------------------------------------------------
// Shutdown and listener setup
// ---------------------------------------------------------------------------

/// Resolves when the operator asks the process to stop. The serve loop
/// drains in-flight requests after this returns; the queue lets the
/// running task finish.
async fn wait_for_stop() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("SIGTERM handler");
        let mut int = signal(SignalKind::interrupt()).expect("SIGINT handler");
        tokio::select! {
            _ = term.recv() => info!("SIGTERM received, stopping"),
            _ = int.recv() => info!("SIGINT received, stopping"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Ctrl+C received, stopping");
    }
}

/// Ports probed when PORT is unset. A small fixed range keeps the URL
/// predictable while letting a second installation on the same host (e.g.
/// one per Lake share) start without configuration.
const PORT_RANGE: std::ops::Range<u16> = 8470..8480;

/// Bind the listen socket. An explicit PORT is authoritative and a failure
/// to bind it is fatal; otherwise the first free port in [`PORT_RANGE`]
/// wins.
async fn bind_listener(bind_addr: &str) -> tokio::net::TcpListener {
    if let Ok(raw) = std::env::var("PORT") {
        let port: u16 = raw.parse().unwrap_or_else(|_| {
            error!(value = raw.as_str(), "PORT is not a valid port number");
            std::process::exit(EXIT_INVALID_CONFIG);
        });
        return tokio::net::TcpListener::bind((bind_addr, port)).await.unwrap_or_else(|e| {
            error!(port, error = %e, "Could not bind the requested PORT");
            std::process::exit(1);
        });
    }
    for port in PORT_RANGE {
        if let Ok(listener) = tokio::net::TcpListener::bind((bind_addr, port)).await {
            return listener;
        }
    }
    error!(
        range_start = PORT_RANGE.start,
        range_end = PORT_RANGE.end - 1,
        "Every port in the probe range is taken; set PORT explicitly"
    );
    std::process::exit(1);
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("modeldepot=info".parse().unwrap()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    if let Some(Commands::Completions { shell }) = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "modeldepot", &mut std::io::stdout());
        return;
    }

    // ---------------------------------------------------------------------------
    // Configuration (exit 2 on invalid input)
    // ---------------------------------------------------------------------------

    let config = config::load(EnvOverrides {
        local_root: cli.local_root.clone(),
        lake_root: cli.lake_root.clone(),
        app_data_dir: cli.data_dir.clone(),
    })
    .unwrap_or_else(|e| {
        error!(error = %e, "Invalid configuration");
        std::process::exit(EXIT_INVALID_CONFIG);
    });

    if let Err(e) = std::fs::create_dir_all(&config.app_data_dir) {
        error!(dir = %config.app_data_dir.display(), error = %e, "App data directory inaccessible");
        std::process::exit(EXIT_DATA_DIR);
    }

    info!(
        local = %config.local.root.display(),
        lake = %config.lake.root.display(),
        data = %config.app_data_dir.display(),
        "Starting ModelDepot"
    );

    // ---------------------------------------------------------------------------
    // Engine (exit 4 on fatal filesystem/database errors)
    // ---------------------------------------------------------------------------

    let engine = Engine::open(config).unwrap_or_else(|e| {
        error!(error = %e, "Failed to open engine stores");
        std::process::exit(EXIT_FATAL_FS);
    });
    let _workers = engine.start();
    for side in modeldepot::types::Side::ALL {
        let _ = engine.refresh_index(side);
    }

    let ctx = AppContext { engine: Arc::clone(&engine), start_time: Instant::now() };

    // ---------------------------------------------------------------------------
    // Router
    // ---------------------------------------------------------------------------

    // Resolve dist dir: --dist flag, then cwd/dist if present
    let dist_dir = cli.dist.unwrap_or_else(|| {
        std::env::current_dir().map(|d| d.join("dist")).unwrap_or_else(|_| PathBuf::from("dist"))
    });
    let index_html = dist_dir.join("index.html");

    let app = Router::new()
        .route("/health", get(api_health))
        .route("/api/index/refresh", post(api_index_refresh))
        .route("/api/index/diff", get(api_index_diff))
        .route("/api/index/stats", get(api_index_stats))
        .route("/api/index/config", get(api_index_config))
        .route("/api/index/sources", get(api_sources_list))
        .route(
            "/api/index/sources/by-relpath/{*relpath}",
            put(api_sources_put_relpath).delete(api_sources_delete_relpath),
        )
        .route(
            "/api/index/sources/{hash}",
            put(api_sources_put_hash).delete(api_sources_delete_hash),
        )
        .route("/api/index/hash-file", post(api_hash_file))
        .route("/api/index/verify", post(api_verify))
        .route("/api/queue/copy", post(api_queue_copy))
        .route("/api/queue/delete", post(api_queue_delete))
        .route("/api/queue/tasks", get(api_queue_tasks))
        .route("/api/queue/tasks/{id}", get(api_queue_task))
        .route("/api/queue/pause", post(api_queue_pause))
        .route("/api/queue/resume", post(api_queue_resume))
        .route("/api/queue/cancel/all", post(api_queue_cancel_all))
        .route("/api/queue/cancel/{id}", post(api_queue_cancel))
        .route("/api/mirror/plan", post(api_mirror_plan))
        .route("/api/mirror/execute", post(api_mirror_execute))
        .route("/api/dedupe/scan", post(api_dedupe_scan))
        .route("/api/dedupe/scan/status", get(api_dedupe_scan_status))
        .route("/api/dedupe/scan/latest", get(api_dedupe_scan_latest))
        .route("/api/dedupe/scan/{id}", delete(api_dedupe_scan_delete))
        .route("/api/dedupe/results/{scan_id}", get(api_dedupe_results))
        .route("/api/dedupe/execute", post(api_dedupe_execute))
        .route("/api/bundles", get(api_bundles_list))
        .route(
            "/api/bundles/{name}",
            get(api_bundles_get).put(api_bundles_put).delete(api_bundles_delete),
        )
        .route("/ws", get(ws_handler))
        .fallback_service(ServeDir::new(&dist_dir).not_found_service(ServeFile::new(&index_html)))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .with_state(ctx);

    // ---------------------------------------------------------------------------
    // Bind and serve: 127.0.0.1 by default, PORT env or probe the range
    // ---------------------------------------------------------------------------

    let bind_addr = if cli.bind_all { "0.0.0.0" } else { "127.0.0.1" };
    let listener = bind_listener(bind_addr).await;

    let port = listener.local_addr().unwrap().port();
    info!(port = port, "http://localhost:{port}");
    // Machine-readable line for scripts (not through tracing)
    eprintln!("MODELDEPOT_PORT={port}");

    axum::serve(listener, app).with_graceful_shutdown(wait_for_stop()).await.unwrap();

    // Let the running task finish, then stop the workers.
    engine.stop();
}
