//! `rtstore`: binds a data directory and a listen address, serves the
//! WebSocket realtime document/collection store gateway.
//!
//! Responsibilities:
//! - Parse CLI flags / environment variables.
//! - Wire the `redb` engine binding, the topic registry, and the notifying
//!   adapter together, then serve the WebSocket upgrade route.
//! - Own process shutdown ordering: stop accepting connections, let
//!   in-flight sessions drain, close the registry, close the engine.
//!
//! Does NOT handle: authentication, TLS termination, or any HTTP route
//! beyond the single WebSocket upgrade endpoint.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use rtstore_gateway::NotifyingStore;
use rtstore_registry::Registry;
use rtstore_types::store::Store;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rtstore", about = "Realtime document/collection store over WebSocket")]
struct Cli {
    /// Directory holding the engine's database file.
    #[arg(long, env = "RTSTORE_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    /// HTTP/WebSocket listen address.
    #[arg(long, env = "RTSTORE_LISTEN", default_value = "127.0.0.1:8080")]
    listen: String,

    /// `tracing-subscriber` `EnvFilter` directive string.
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log: String,
}

#[derive(Clone)]
struct AppState {
    store: Arc<dyn Store>,
    registry: Registry,
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| rtstore_gateway::handle_socket(socket, state.store, state.registry))
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(cli.log.clone()))
        .with_target(false)
        .init();

    tokio::fs::create_dir_all(&cli.data_dir).await?;
    let db_path = cli.data_dir.join("rtstore.redb");

    let engine = rtstore_redb::RedbStore::open(db_path).await?;
    let registry = Registry::new();
    let store: Arc<dyn Store> = Arc::new(NotifyingStore::new(Arc::new(engine), registry.clone()));

    let app = Router::new().route("/", get(ws_handler)).with_state(AppState { store: store.clone(), registry });

    let listener = tokio::net::TcpListener::bind(&cli.listen).await?;
    info!(listen = %cli.listen, data_dir = %cli.data_dir.display(), "rtstore listening");

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    // Shutdown ordering: the listener above has already stopped accepting
    // connections and `with_graceful_shutdown` has let in-flight sessions
    // drain before `serve` returned. The engine closes last.
    store.close().await?;
    info!("rtstore shut down cleanly");

    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {}
        Err(err) => tracing::warn!(%err, "failed to install Ctrl+C handler; shutdown signal disabled"),
    }
}
