use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;

/// Wraps a future to catch panics and convert them to errors.
///
/// Detached sync tasks are fire-and-forget: nobody awaits their `JoinHandle`
/// in production. Without this wrapper a panic would silently drop the task;
/// with it, the panic message is surfaced so it can be logged.
///
/// # Returns
///
/// - `Ok(result)` if the future completes normally
/// - `Err(panic_message)` if the future panics
pub async fn catch_task_panic<F, T>(future: F) -> Result<T, String>
where
    F: Future<Output = T>,
{
    AssertUnwindSafe(future)
        .catch_unwind()
        .await
        .map_err(|panic| {
            if let Some(s) = panic.downcast_ref::<&'static str>() {
                s.to_string()
            } else if let Some(s) = panic.downcast_ref::<String>() {
                s.clone()
            } else {
                format!("Unknown panic: {:?}", (*panic).type_id())
            }
        })
}

/// Spawn a detached background task whose panics are logged instead of lost.
pub fn spawn_logged<F>(task: &'static str, future: F) -> tokio::task::JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(panic_msg) = catch_task_panic(future).await {
            tracing::error!(task, error = %panic_msg, "Background task panicked");
        }
    })
}
