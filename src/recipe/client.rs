use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;
use url::Url;

use super::model::Recipe;
use crate::endpoints::Endpoints;
use crate::net::{content_type, read_limited_bytes, FetchError};

const MAX_RECIPE_SIZE: usize = 5 * 1024 * 1024; // 5MB
const MAX_IMAGE_SIZE: usize = 20 * 1024 * 1024; // 20MB
const DEFAULT_RETRIES: u32 = 2;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

/// Bytes of a fetched binary plus the Content-Type the server declared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedBinary {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// Read-only client for the Recipe Service.
///
/// Only the two calls the sync core needs are implemented: the full recipe
/// record and its image. Both retry transient failures with exponential
/// backoff (1s, 2s, 4s...) up to the configured retry count.
#[derive(Debug, Clone)]
pub struct RecipeClient {
    http: reqwest::Client,
    endpoints: Endpoints,
    retries: u32,
    timeout: Duration,
}

impl RecipeClient {
    pub fn new(http: reqwest::Client, endpoints: Endpoints) -> Self {
        Self {
            http,
            endpoints,
            retries: DEFAULT_RETRIES,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    /// `GET /api/recipes/{id}`; a missing recipe surfaces as `HttpStatus(404)`.
    pub async fn fetch_recipe(
        &self,
        id: &str,
        credential: Option<&SecretString>,
    ) -> Result<Recipe, FetchError> {
        let url = self.endpoints.recipe_url(id);
        let (bytes, _) = self.get_with_retry(&url, credential, MAX_RECIPE_SIZE).await?;
        serde_json::from_slice(&bytes).map_err(|e| FetchError::Decode(e.to_string()))
    }

    /// `GET /api/recipes/{id}/image`.
    pub async fn fetch_image(
        &self,
        id: &str,
        credential: Option<&SecretString>,
    ) -> Result<FetchedBinary, FetchError> {
        let url = self.endpoints.image_url(id);
        self.fetch_binary(&url, credential).await
    }

    /// Fetch an arbitrary binary (used for imperative Binary Cache warm-ups).
    pub async fn fetch_binary(
        &self,
        url: &Url,
        credential: Option<&SecretString>,
    ) -> Result<FetchedBinary, FetchError> {
        let (bytes, content_type) = self.get_with_retry(url, credential, MAX_IMAGE_SIZE).await?;
        Ok(FetchedBinary {
            bytes,
            content_type,
        })
    }

    async fn get_with_retry(
        &self,
        url: &Url,
        credential: Option<&SecretString>,
        limit: usize,
    ) -> Result<(Vec<u8>, Option<String>), FetchError> {
        let mut retry_count = 0;

        loop {
            match self.get_once(url, credential, limit).await {
                Ok(body) => return Ok(body),
                Err(e) if e.is_retryable() && retry_count < self.retries => {
                    let delay = 1u64 << retry_count; // 1s, 2s, 4s
                    tracing::debug!(
                        url = %url,
                        error = %e,
                        retry = retry_count + 1,
                        delay_secs = delay,
                        "Retrying recipe service request after transient error"
                    );
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                    retry_count += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn get_once(
        &self,
        url: &Url,
        credential: Option<&SecretString>,
        limit: usize,
    ) -> Result<(Vec<u8>, Option<String>), FetchError> {
        let mut request = self.http.get(url.clone());
        if let Some(token) = credential {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| FetchError::Timeout)?
            .map_err(FetchError::Network)?;

        if !response.status().is_success() {
            return Err(FetchError::HttpStatus(response.status().as_u16()));
        }

        let content_type = content_type(&response);
        let bytes = read_limited_bytes(response, limit).await?;
        Ok((bytes, content_type))
    }
}
