use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use url::Url;

use super::interceptor::{InterceptError, Interceptor};
use super::messages::{WorkerMessage, WorkerReply};
use super::request::{InterceptedRequest, SharedFile, WorkerResponse};
use super::routes::Route;
use crate::util::spawn_logged;

const MAILBOX_CAPACITY: usize = 64;

/// Lifecycle of the Request Interceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Installing,
    Activating,
    Running,
    Stopped,
}

enum Envelope {
    Fetch {
        request: InterceptedRequest,
        reply: oneshot::Sender<Result<WorkerResponse, InterceptError>>,
    },
    Message {
        message: WorkerMessage,
        reply: oneshot::Sender<WorkerReply>,
    },
}

/// Page-side handle to the Request Interceptor task.
///
/// The worker shares no memory with the page: everything goes through
/// [`fetch`](Self::fetch) and [`post_message`](Self::post_message). Requests
/// sent before activation completes are queued until the worker is running.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    tx: mpsc::Sender<Envelope>,
    state: watch::Receiver<WorkerState>,
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Envelope::Fetch { request, .. } => f.debug_tuple("Fetch").field(&request.url).finish(),
            Envelope::Message { message, .. } => f.debug_tuple("Message").field(message).finish(),
        }
    }
}

impl WorkerHandle {
    /// Spawn the worker: install, activate, then serve until every handle is dropped.
    pub fn spawn(interceptor: Interceptor) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (state_tx, state) = watch::channel(WorkerState::Installing);
        let task = spawn_logged("request-interceptor", run(Arc::new(interceptor), rx, state_tx));
        (Self { tx, state }, task)
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Wait until install and activate have finished.
    pub async fn wait_until_running(&self) -> Result<(), InterceptError> {
        let mut state = self.state.clone();
        let reached = state
            .wait_for(|s| matches!(s, WorkerState::Running | WorkerState::Stopped))
            .await
            .map_err(|_| InterceptError::Stopped)?;
        match *reached {
            WorkerState::Running => Ok(()),
            _ => Err(InterceptError::Stopped),
        }
    }

    /// Route an outbound request through the worker.
    pub async fn fetch(
        &self,
        request: InterceptedRequest,
    ) -> Result<WorkerResponse, InterceptError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Envelope::Fetch { request, reply })
            .await
            .map_err(|_| InterceptError::Stopped)?;
        rx.await.map_err(|_| InterceptError::Stopped)?
    }

    pub async fn post_message(
        &self,
        message: WorkerMessage,
    ) -> Result<WorkerReply, InterceptError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Envelope::Message { message, reply })
            .await
            .map_err(|_| InterceptError::Stopped)?;
        rx.await.map_err(|_| InterceptError::Stopped)
    }
}

async fn run(
    interceptor: Arc<Interceptor>,
    mut rx: mpsc::Receiver<Envelope>,
    state: watch::Sender<WorkerState>,
) {
    interceptor.install().await;

    state.send_replace(WorkerState::Activating);
    if let Err(e) = interceptor.activate().await {
        tracing::warn!(error = %e, "Failed to delete stale caches");
    }

    state.send_replace(WorkerState::Running);
    tracing::info!(cache = %interceptor.shell_cache(), "Request Interceptor running");

    // Single pending slot; only this task ever touches it.
    let mut pending_share: Option<SharedFile> = None;

    while let Some(envelope) = rx.recv().await {
        match envelope {
            Envelope::Fetch { request, reply } => match interceptor.route(&request) {
                Route::ShareTarget => {
                    let file = request.into_shared_file();
                    let received = file.is_some();
                    match file {
                        Some(file) => {
                            tracing::info!(
                                name = %file.name,
                                bytes = file.bytes.len(),
                                "Shared file received"
                            );
                            if pending_share.replace(file).is_some() {
                                tracing::debug!("Replaced unclaimed shared file");
                            }
                        }
                        None => tracing::warn!("Share target submission carried no file"),
                    }
                    let _ = reply.send(Ok(interceptor.share_redirect(received)));
                }
                route => {
                    let interceptor = Arc::clone(&interceptor);
                    spawn_logged("worker-fetch", async move {
                        let _ = reply.send(interceptor.handle(route, request).await);
                    });
                }
            },
            Envelope::Message { message, reply } => {
                let response = handle_message(&interceptor, message, &mut pending_share).await;
                let _ = reply.send(response);
            }
        }
    }

    state.send_replace(WorkerState::Stopped);
    tracing::debug!("Request Interceptor stopped");
}

async fn handle_message(
    interceptor: &Arc<Interceptor>,
    message: WorkerMessage,
    pending_share: &mut Option<SharedFile>,
) -> WorkerReply {
    match message {
        WorkerMessage::GetSharedImage => match pending_share.take() {
            Some(file) => WorkerReply::SharedImage { file },
            None => WorkerReply::NoSharedImage,
        },
        WorkerMessage::CacheBinary { url } => {
            let url = match Url::parse(&url) {
                Ok(url) => url,
                Err(e) => {
                    return WorkerReply::Rejected {
                        reason: format!("invalid URL: {e}"),
                    }
                }
            };
            // Taken in message order, so a later REMOVE_BINARY always wins
            let ticket = interceptor.removal_generation(url.as_str()).await;
            let interceptor = Arc::clone(interceptor);
            spawn_logged("worker-cache-binary", async move {
                if let Err(e) = interceptor.cache_binary_since(&url, ticket).await {
                    tracing::warn!(url = %url, error = %e, "Failed to cache binary on request");
                }
            });
            WorkerReply::Accepted
        }
        WorkerMessage::RemoveBinary { url } => {
            if let Err(e) = interceptor.remove_binary(&url).await {
                tracing::warn!(url = %url, error = %e, "Failed to remove binary on request");
            }
            WorkerReply::Accepted
        }
    }
}
