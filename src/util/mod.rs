//! Utility functions for common operations.
//!
//! - **URL validation**: base URL policy for the Recipe Service (https unless local)
//! - **Task helpers**: detached background tasks whose panics are logged, not lost

mod task;
mod url_validator;

pub use task::{catch_task_panic, spawn_logged};
pub use url_validator::{validate_base_url, UrlValidationError};
