use anyhow::Result;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use url::Url;

use super::request::{InterceptedRequest, RequestBody, ResponseSource, WorkerResponse};
use super::routes::{
    Route, APP_SHELL_PATH, OFFLINE_DETAIL_PATH, SHARE_PICKUP_PATH, SHARE_PICKUP_QUERY, SHELL_ROUTES,
};
use crate::endpoints::Endpoints;
use crate::net::{content_type, read_limited_bytes, FetchError};
use crate::storage::{shell_cache_name, Database, BINARY_CACHE_NAME};

const MAX_BODY_SIZE: usize = 20 * 1024 * 1024; // 20MB
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Error)]
pub enum InterceptError {
    /// Multipart bodies are only understood by the share target
    #[error("Form submissions cannot be forwarded")]
    UnsupportedBody,
    #[error(transparent)]
    Fetch(#[from] FetchError),
    /// The worker task is gone
    #[error("Request Interceptor is not running")]
    Stopped,
}

/// Shell routes that made it into the page cache during install.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
    pub cached: Vec<String>,
    pub failed: Vec<String>,
}

/// Fetch policies of the Request Interceptor.
///
/// Stateless apart from the durable caches; the pending shared-file slot
/// lives in the worker task (see [`WorkerHandle`](super::WorkerHandle)).
#[derive(Debug)]
pub struct Interceptor {
    http: reqwest::Client,
    endpoints: Endpoints,
    db: Database,
    shell_cache: String,
    timeout: Duration,
    /// Removal generation per Binary Cache URL. Held across the final write so
    /// a page-requested fetch never lands after a removal of the same URL.
    binary_removals: Mutex<HashMap<String, u64>>,
}

impl Interceptor {
    pub fn new(
        http: reqwest::Client,
        endpoints: Endpoints,
        db: Database,
        cache_version: &str,
    ) -> Self {
        Self {
            http,
            endpoints,
            db,
            shell_cache: shell_cache_name(cache_version),
            timeout: DEFAULT_TIMEOUT,
            binary_removals: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Name of the page cache for this worker generation.
    pub fn shell_cache(&self) -> &str {
        &self.shell_cache
    }

    pub fn route(&self, request: &InterceptedRequest) -> Route {
        Route::classify(&self.endpoints, request)
    }

    /// Pre-warm the shell routes. Each failure is logged and skipped.
    pub async fn install(&self) -> InstallReport {
        let mut report = InstallReport::default();

        for route in SHELL_ROUTES {
            let url = self.endpoints.route_url(route);
            match self.forward(&InterceptedRequest::get(url.clone())).await {
                Ok(response) if response.status == 200 => {
                    match self.store_page(&url, &response).await {
                        Ok(()) => report.cached.push(url.to_string()),
                        Err(e) => {
                            tracing::warn!(url = %url, error = %e, "Failed to store shell route");
                            report.failed.push(url.to_string());
                        }
                    }
                }
                Ok(response) => {
                    tracing::warn!(
                        url = %url,
                        status = response.status,
                        "Shell route not cacheable"
                    );
                    report.failed.push(url.to_string());
                }
                Err(e) => {
                    tracing::warn!(url = %url, error = %e, "Failed to pre-warm shell route");
                    report.failed.push(url.to_string());
                }
            }
        }

        tracing::info!(
            cache = %self.shell_cache,
            cached = report.cached.len(),
            failed = report.failed.len(),
            "Request Interceptor installed"
        );
        report
    }

    /// Drop page caches from other generations. The Binary Cache is kept.
    ///
    /// Returns the names of the deleted caches.
    pub async fn activate(&self) -> Result<Vec<String>> {
        let mut deleted = Vec::new();
        for name in self.db.cache_names().await? {
            if name == self.shell_cache || name == BINARY_CACHE_NAME {
                continue;
            }
            let entries = self.db.delete_cache(&name).await?;
            tracing::info!(cache = %name, entries, "Deleted stale cache");
            deleted.push(name);
        }
        Ok(deleted)
    }

    /// Redirect target after a share-target submission.
    pub(crate) fn share_redirect(&self, received_file: bool) -> WorkerResponse {
        let mut location = self.endpoints.route_url(SHARE_PICKUP_PATH);
        if received_file {
            location.set_query(Some(SHARE_PICKUP_QUERY));
        }
        WorkerResponse::redirect(&location)
    }

    /// Answer a request on any route except [`Route::ShareTarget`].
    pub(crate) async fn handle(
        &self,
        route: Route,
        request: InterceptedRequest,
    ) -> Result<WorkerResponse, InterceptError> {
        match route {
            Route::RecipeImage => Ok(self.handle_image(&request).await),
            Route::Page => Ok(self.handle_page(&request).await),
            Route::DataApi | Route::Passthrough => self.forward(&request).await,
            // Never cached and never forwarded: the body only makes sense to the worker
            Route::ShareTarget => Ok(self.share_redirect(false)),
        }
    }

    /// Network-first; a successful response is copied into the Binary Cache.
    /// Offline, the Binary Cache is tried, then the page cache.
    async fn handle_image(&self, request: &InterceptedRequest) -> WorkerResponse {
        let key = request.url.as_str();

        match self.forward(request).await {
            Ok(response) => {
                if response.is_success() {
                    if let Err(e) = self
                        .db
                        .put_binary(key, &response.body, response.content_type.as_deref())
                        .await
                    {
                        tracing::warn!(url = %key, error = %e, "Failed to store image");
                    }
                }
                return response;
            }
            Err(e) => {
                tracing::debug!(url = %key, error = %e, "Image fetch failed, trying caches");
            }
        }

        match self.db.get_binary(key).await {
            Ok(Some(binary)) => {
                return WorkerResponse {
                    status: 200,
                    content_type: binary.content_type,
                    location: None,
                    body: binary.bytes,
                    source: ResponseSource::BinaryCache,
                };
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(url = %key, error = %e, "Binary cache lookup failed"),
        }

        self.cached_page(key, ResponseSource::PageCache)
            .await
            .unwrap_or_else(WorkerResponse::unavailable)
    }

    /// Network-first with opportunistic caching of full-page GETs.
    ///
    /// Offline fallbacks, in order: the exact cached URL, the offline detail
    /// shell (navigations to that route), the app shell (other navigations),
    /// then a synthetic 503. Prefetch and partial-render requests skip all of
    /// it and get the 503 directly.
    async fn handle_page(&self, request: &InterceptedRequest) -> WorkerResponse {
        let prefetch = request.is_prefetch();

        match self.forward(request).await {
            Ok(response) => {
                if response.status == 200 && !prefetch {
                    if let Err(e) = self.store_page(&request.url, &response).await {
                        tracing::warn!(url = %request.url, error = %e, "Failed to cache page");
                    }
                }
                return response;
            }
            Err(e) => {
                tracing::debug!(url = %request.url, prefetch, error = %e, "Page fetch failed");
            }
        }

        if prefetch {
            return WorkerResponse::unavailable();
        }

        if let Some(response) = self
            .cached_page(request.url.as_str(), ResponseSource::PageCache)
            .await
        {
            return response;
        }

        if request.is_navigation() {
            let targets_offline_view =
                self.endpoints.app_path(&request.url).as_deref() == Some(OFFLINE_DETAIL_PATH);
            let (shell_path, source) = if targets_offline_view {
                (OFFLINE_DETAIL_PATH, ResponseSource::OfflineShell)
            } else {
                (APP_SHELL_PATH, ResponseSource::AppShell)
            };
            let shell_url = self.endpoints.route_url(shell_path);
            if let Some(response) = self.cached_page(shell_url.as_str(), source).await {
                return response;
            }
        }

        WorkerResponse::unavailable()
    }

    /// Fetch `url` into the Binary Cache on behalf of the page.
    ///
    /// Returns `false` when a [`remove_binary`](Self::remove_binary) for the
    /// same URL arrived while the fetch was in flight; nothing is stored then.
    pub async fn cache_binary(&self, url: &Url) -> Result<bool> {
        let ticket = self.removal_generation(url.as_str()).await;
        self.cache_binary_since(url, ticket).await
    }

    /// Like [`cache_binary`](Self::cache_binary), but removals are counted from
    /// `ticket`, taken earlier with [`removal_generation`](Self::removal_generation).
    pub(crate) async fn cache_binary_since(&self, url: &Url, ticket: u64) -> Result<bool> {
        let response = self.forward(&InterceptedRequest::get(url.clone())).await?;
        if !response.is_success() {
            anyhow::bail!("HTTP error: status {}", response.status);
        }

        let removals = self.binary_removals.lock().await;
        if removals.get(url.as_str()).copied().unwrap_or(0) != ticket {
            tracing::debug!(url = %url, "Binary removed while fetching, not caching");
            return Ok(false);
        }
        self.db
            .put_binary(url.as_str(), &response.body, response.content_type.as_deref())
            .await?;
        drop(removals);

        tracing::debug!(url = %url, bytes = response.body.len(), "Binary cached on request");
        Ok(true)
    }

    pub async fn remove_binary(&self, url: &str) -> Result<bool> {
        let mut removals = self.binary_removals.lock().await;
        *removals.entry(url.to_string()).or_insert(0) += 1;
        self.db.delete_binary(url).await
    }

    pub(crate) async fn removal_generation(&self, url: &str) -> u64 {
        self.binary_removals
            .lock()
            .await
            .get(url)
            .copied()
            .unwrap_or(0)
    }

    async fn cached_page(&self, url: &str, source: ResponseSource) -> Option<WorkerResponse> {
        match self.db.match_response(&self.shell_cache, url).await {
            Ok(page) => page.map(|page| WorkerResponse {
                status: page.status,
                content_type: page.content_type,
                location: None,
                body: page.body,
                source,
            }),
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "Page cache lookup failed");
                None
            }
        }
    }

    async fn store_page(&self, url: &Url, response: &WorkerResponse) -> Result<()> {
        self.db
            .put_response(
                &self.shell_cache,
                url.as_str(),
                response.status,
                response.content_type.as_deref(),
                &response.body,
            )
            .await
    }

    async fn forward(
        &self,
        request: &InterceptedRequest,
    ) -> Result<WorkerResponse, InterceptError> {
        let body = match &request.body {
            RequestBody::Empty => None,
            RequestBody::Bytes(bytes) => Some(bytes.clone()),
            RequestBody::Form(_) => return Err(InterceptError::UnsupportedBody),
        };

        let mut builder = self
            .http
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone())
            .timeout(self.timeout);
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let response = tokio::time::timeout(self.timeout, builder.send())
            .await
            .map_err(|_| FetchError::Timeout)?
            .map_err(FetchError::Network)?;

        let status = response.status().as_u16();
        let content_type = content_type(&response);
        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let body = read_limited_bytes(response, MAX_BODY_SIZE).await?;

        Ok(WorkerResponse {
            status,
            content_type,
            location,
            body,
            source: ResponseSource::Network,
        })
    }
}
