use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds a lock on the database
    #[error("The offline store is locked by another process. Please close it and try again.")]
    Locked,

    /// The database file cannot be opened at all (missing directory, no permission, ...)
    #[error("Offline store unavailable: {0}")]
    Unavailable(String),

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Classify a sqlx error raised while opening the database.
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5): database is locked
        // SQLITE_LOCKED (6): database table is locked
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
        {
            return DatabaseError::Locked;
        }

        // SQLITE_CANTOPEN (14): unable to open database file
        if error_string.contains("unable to open database file") {
            return DatabaseError::Unavailable(err.to_string());
        }

        DatabaseError::Other(err)
    }
}

// ============================================================================
// Helper Types
// ============================================================================

/// Internal row type for `response_cache` queries.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ResponseRow {
    pub url: String,
    pub status: i64,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    pub stored_at: String,
}

impl ResponseRow {
    pub(crate) fn into_binary(self) -> CachedBinary {
        CachedBinary {
            url: self.url,
            bytes: self.body,
            content_type: self.content_type,
            stored_at: self.stored_at,
        }
    }

    pub(crate) fn into_page(self) -> CachedPage {
        CachedPage {
            url: self.url,
            status: u16::try_from(self.status).unwrap_or(200),
            content_type: self.content_type,
            body: self.body,
            stored_at: self.stored_at,
        }
    }
}

// ============================================================================
// Data Structures
// ============================================================================

/// A binary (image) response, keyed by the exact request URL used to fetch it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedBinary {
    pub url: String,
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
    /// SQLite `datetime('now')` at insert time
    pub stored_at: String,
}

/// A page or asset response held in a named page cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedPage {
    pub url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    pub stored_at: String,
}

/// Aggregate size of the offline stores, for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageStats {
    pub cached_recipes: i64,
    pub cached_binaries: i64,
    pub binary_bytes: i64,
    pub cached_pages: i64,
    pub page_bytes: i64,
}
