//! Request Interceptor: a background task that sits between the page and the
//! network.
//!
//! - [`request`] - intercepted request and synthesized response types
//! - [`routes`] - classification of a request into a fetch policy
//! - [`interceptor`] - the policies themselves plus install/activate
//! - [`messages`] - the page/worker message protocol
//! - [`handle`] - the worker task and the page-side handle to it

mod handle;
mod interceptor;
mod messages;
mod request;
mod routes;

pub use handle::{WorkerHandle, WorkerState};
pub use interceptor::{InstallReport, InterceptError, Interceptor};
pub use messages::{WorkerMessage, WorkerReply};
pub use request::{
    FormField, FormValue, InterceptedRequest, RequestBody, RequestMode, ResponseSource,
    SharedFile, WorkerResponse,
};
pub use routes::{Route, OFFLINE_DETAIL_PATH, SHARE_TARGET_PATH, SHELL_ROUTES};
