//! Application state management

use std::sync::Arc;

use sqlx::SqlitePool;

use crate::sync::SyncCoordinator;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    db: SqlitePool,
    sync: SyncCoordinator,
}

impl AppState {
    pub fn new(db: SqlitePool, sync: SyncCoordinator) -> Self {
        Self {
            inner: Arc::new(AppStateInner { db, sync }),
        }
    }

    /// Get the database pool
    pub fn db(&self) -> &SqlitePool {
        &self.inner.db
    }

    /// Get the sync engine
    pub fn sync(&self) -> &SyncCoordinator {
        &self.inner.sync
    }
}
