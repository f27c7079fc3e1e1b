//! Application state shared across request handlers.

use std::sync::Arc;

use crate::db::Database;
use crate::deploy::WsHub;
use crate::engine::Engine;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    engine: Engine,
    hub: Arc<WsHub>,
    db: Option<Database>,
}

impl AppState {
    /// `db` is `None` when the engine runs on the in-memory store.
    pub fn new(engine: Engine, hub: Arc<WsHub>, db: Option<Database>) -> Self {
        Self {
            inner: Arc::new(AppStateInner { engine, hub, db }),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    /// Live node connections; the engine pushes through the same hub.
    pub fn hub(&self) -> &Arc<WsHub> {
        &self.inner.hub
    }

    pub fn db(&self) -> Option<&Database> {
        self.inner.db.as_ref()
    }
}
