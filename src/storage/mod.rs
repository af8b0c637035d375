//! Durable offline store shared by the page side and the Request Interceptor.
//!
//! One SQLite file holds three concerns:
//! - [`membership`] - the favourited-id set under a well-known key
//! - [`object_cache`] - full recipe records keyed by id
//! - [`response_cache`] - named response caches (the Binary Cache and the page caches)

mod handle;
mod membership;
mod object_cache;
mod response_cache;
mod schema;
mod types;

pub use handle::{DatabaseHandle, StorageUnavailable};
pub use membership::{MembershipStore, Toggle, MEMBERSHIP_KEY};
pub use response_cache::{shell_cache_name, BINARY_CACHE_NAME};
pub use schema::Database;
pub use types::{CachedBinary, CachedPage, DatabaseError, StorageStats};
