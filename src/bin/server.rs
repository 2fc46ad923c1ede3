//! docsync-server: collaborative document server.
//!
//! Serves the collaboration WebSocket and the outputs/file-id HTTP API over
//! a directory of documents.

use clap::Parser;
use docsync::contents::{FsContentsStore, InMemoryFileIdIndexer};
use docsync::{AppContext, Config};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "docsync-server")]
struct Args {
    /// Directory the content store serves documents from
    #[arg(long, env = "DOCSYNC_ROOT", default_value = ".")]
    root: PathBuf,

    /// Address to listen on
    #[arg(long, env = "DOCSYNC_LISTEN", default_value = "127.0.0.1:8787")]
    listen: String,

    /// Optional JSON configuration file
    #[arg(long, env = "DOCSYNC_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!("failed to load config {:?}: {}", path, e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    tracing::info!(root = ?args.root, listen = %args.listen, "starting docsync-server");

    let contents = Arc::new(FsContentsStore::new(args.root.clone()));
    let indexer = Arc::new(InMemoryFileIdIndexer::new());
    let context = AppContext::new(config, contents, indexer);

    let listener = match tokio::net::TcpListener::bind(&args.listen).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("failed to bind {}: {}", args.listen, e);
            std::process::exit(1);
        }
    };

    let app = context.router();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("server error: {}", e);
        }
    });

    tokio::select! {
        _ = server => {}
        _ = signal::ctrl_c() => {
            tracing::info!("received Ctrl+C, shutting down");
        }
    }

    context.shutdown().await;
    tracing::info!("shutdown complete");
}
