//! Real-time collaborative editing engine for notebook and text documents.
//!
//! Clients connect over WebSockets and edit a shared CRDT replica per
//! document ("room"). The room reconciles edits, broadcasts updates,
//! persists content through a pluggable content store, and routes kernel
//! execution output into the shared document so it reaches every client once.

pub mod api;
pub mod config;
pub mod contents;
pub mod crdt;
pub mod error;
pub mod events;
pub mod kernel;
pub mod outputs;
pub mod room;
pub mod session;
pub mod ws;

pub use config::Config;
pub use error::{Error, Result};

use crate::contents::{ContentsStore, FileIdIndexer};
use crate::events::EventSink;
use crate::kernel::{KernelConnector, KernelRegistry, LocalKernelConnector};
use crate::outputs::OutputStore;
use crate::room::RoomManager;
use crate::session::{InMemorySessionStore, SessionManager, SessionStore};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// The composition root: owns every singleton the core consumes.
///
/// The core never reaches into globals; concrete stores and the kernel
/// connector are injected here at startup and torn down on shutdown.
pub struct AppContext {
    pub config: Arc<Config>,
    pub contents: Arc<dyn ContentsStore>,
    pub indexer: Arc<dyn FileIdIndexer>,
    pub events: EventSink,
    pub outputs: Arc<OutputStore>,
    pub rooms: Arc<RoomManager>,
    pub kernels: Arc<KernelRegistry>,
    pub sessions: Arc<SessionManager>,
}

impl AppContext {
    pub fn new(
        config: Config,
        contents: Arc<dyn ContentsStore>,
        indexer: Arc<dyn FileIdIndexer>,
    ) -> Arc<Self> {
        Self::with_stores(
            config,
            contents,
            indexer,
            Arc::new(InMemorySessionStore::new()),
            Arc::new(LocalKernelConnector),
        )
    }

    pub fn with_stores(
        config: Config,
        contents: Arc<dyn ContentsStore>,
        indexer: Arc<dyn FileIdIndexer>,
        session_store: Arc<dyn SessionStore>,
        connector: Arc<dyn KernelConnector>,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let events = EventSink::new();
        let outputs = Arc::new(OutputStore::new(config.outputs_path.clone()));
        let rooms = RoomManager::new(
            Arc::clone(&contents),
            Arc::clone(&indexer),
            events.clone(),
            Arc::clone(&config),
        );
        let kernels = Arc::new(KernelRegistry::new(
            Arc::clone(&outputs),
            connector,
            Arc::clone(&config),
        ));
        let sessions = Arc::new(SessionManager::new(
            session_store,
            Arc::clone(&rooms),
            Arc::clone(&kernels),
            Arc::clone(&indexer),
        ));

        Arc::new(Self {
            config,
            contents,
            indexer,
            events,
            outputs,
            rooms,
            kernels,
            sessions,
        })
    }

    /// Build the HTTP router: collaboration WebSocket, output artifacts, and
    /// the file-id index.
    pub fn router(&self) -> Router {
        Router::new()
            .merge(ws::handler::router(Arc::clone(&self.rooms)))
            .merge(api::router(
                Arc::clone(&self.outputs),
                Arc::clone(&self.indexer),
            ))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Graceful teardown: every room is stopped and saved.
    pub async fn shutdown(&self) {
        self.rooms.stop().await;
    }
}
