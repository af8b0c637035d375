//! Offline-first caching and sync core of the recipe library client.
//!
//! A user's favourited recipes (and their images) stay readable with no
//! network. The pieces, leaves first:
//!
//! - [`storage`] - Membership Store, Object Cache, Binary Cache and page caches in SQLite
//! - [`connectivity`] - probe-driven online/offline state
//! - [`sync`] - keeps the caches in step with membership
//! - [`worker`] - Request Interceptor with network-first fallbacks and the share-target handoff

pub mod config;
pub mod connectivity;
pub mod endpoints;
pub mod net;
pub mod recipe;
pub mod storage;
pub mod sync;
pub mod util;
pub mod worker;
