use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OnceCell;

use super::schema::Database;
use super::types::DatabaseError;

/// The durable store could not be opened; cached so later callers fail fast.
#[derive(Debug, Clone, Error)]
#[error("Offline storage unavailable: {0}")]
pub struct StorageUnavailable(pub Arc<DatabaseError>);

/// Lazily-opened, memoized handle to the durable store.
///
/// The first call to [`DatabaseHandle::get`] opens the database; concurrent
/// first callers wait on the same initialization. The outcome is cached
/// either way: a failed open is terminal, so repeated calls surface the same
/// error instead of retrying a doomed initialization in a tight loop.
#[derive(Debug)]
pub struct DatabaseHandle {
    path: String,
    cell: OnceCell<Result<Database, StorageUnavailable>>,
    attempts: AtomicUsize,
}

impl DatabaseHandle {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            cell: OnceCell::new(),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Return the shared database, opening it on first use.
    pub async fn get(&self) -> Result<Database, StorageUnavailable> {
        self.cell
            .get_or_init(|| async {
                self.attempts.fetch_add(1, Ordering::Relaxed);
                match Database::open(&self.path).await {
                    Ok(db) => {
                        tracing::debug!(path = %self.path, "Opened offline store");
                        Ok(db)
                    }
                    Err(e) => {
                        tracing::error!(
                            path = %self.path,
                            error = %e,
                            "Failed to open offline store"
                        );
                        Err(StorageUnavailable(Arc::new(e)))
                    }
                }
            })
            .await
            .clone()
    }

    /// Number of times an open was actually attempted (0 or 1).
    pub fn open_attempts(&self) -> usize {
        self.attempts.load(Ordering::Relaxed)
    }
}
