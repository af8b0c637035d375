use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use url::Url;

/// Headers the page framework sets on prefetch and partial-render requests.
const PREFETCH_MARKER_HEADERS: &[&str] = &["next-router-prefetch", "rsc", "next-router-state-tree"];
const PURPOSE_HEADERS: &[&str] = &["purpose", "sec-purpose"];
/// Query parameter carried by partial-render requests.
const PARTIAL_RENDER_PARAM: &str = "_rsc";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestMode {
    /// Top-level document load.
    Navigate,
    #[default]
    Other,
}

/// A file received through the share target, held until the page picks it up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedFile {
    pub name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormValue {
    Text(String),
    File(SharedFile),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormField {
    pub name: String,
    pub value: FormValue,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RequestBody {
    #[default]
    Empty,
    Bytes(Vec<u8>),
    /// Parsed `multipart/form-data`; only ever consumed by the share target.
    Form(Vec<FormField>),
}

/// An outbound request from the page, as seen by the Request Interceptor.
#[derive(Debug, Clone)]
pub struct InterceptedRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub mode: RequestMode,
    pub body: RequestBody,
}

impl InterceptedRequest {
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            headers: HeaderMap::new(),
            mode: RequestMode::Other,
            body: RequestBody::Empty,
        }
    }

    /// A top-level navigation to `url`.
    pub fn navigate(url: Url) -> Self {
        Self {
            mode: RequestMode::Navigate,
            ..Self::get(url)
        }
    }

    pub fn post_form(url: Url, fields: Vec<FormField>) -> Self {
        Self {
            method: Method::POST,
            body: RequestBody::Form(fields),
            ..Self::get(url)
        }
    }

    /// Add a header. Values that are not valid header text are dropped.
    pub fn with_header(mut self, name: &'static str, value: &str) -> Self {
        match HeaderValue::from_str(value) {
            Ok(value) => {
                self.headers.insert(HeaderName::from_static(name), value);
            }
            Err(_) => {
                tracing::debug!(header = name, "Dropping invalid header value");
            }
        }
        self
    }

    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }

    /// True for prefetch and partial-render requests. These must never be
    /// answered with substituted HTML.
    pub fn is_prefetch(&self) -> bool {
        let has_marker = PREFETCH_MARKER_HEADERS
            .iter()
            .any(|name| self.headers.contains_key(*name));
        let purpose_prefetch = PURPOSE_HEADERS.iter().any(|name| {
            self.headers
                .get(*name)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.to_ascii_lowercase().contains("prefetch"))
        });
        let partial_render = self
            .url
            .query_pairs()
            .any(|(key, _)| key == PARTIAL_RENDER_PARAM);

        has_marker || purpose_prefetch || partial_render
    }

    /// The shared file in a share-target submission: the `image` field if it
    /// holds a file, otherwise the first file in the form.
    pub(crate) fn into_shared_file(self) -> Option<SharedFile> {
        let RequestBody::Form(fields) = self.body else {
            return None;
        };

        let mut first_file = None;
        for field in fields {
            if let FormValue::File(file) = field.value {
                if field.name == "image" {
                    return Some(file);
                }
                first_file.get_or_insert(file);
            }
        }
        first_file
    }
}

/// Where a [`WorkerResponse`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResponseSource {
    Network,
    BinaryCache,
    PageCache,
    OfflineShell,
    AppShell,
    /// Generated by the worker itself (redirects, offline placeholders).
    Synthetic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub location: Option<String>,
    pub body: Vec<u8>,
    pub source: ResponseSource,
}

impl WorkerResponse {
    /// Synthetic 503 returned when neither the network nor any cache can answer.
    pub fn unavailable() -> Self {
        Self {
            status: 503,
            content_type: Some("text/plain; charset=utf-8".to_string()),
            location: None,
            body: b"Offline".to_vec(),
            source: ResponseSource::Synthetic,
        }
    }

    /// 303 See Other to `location`.
    pub fn redirect(location: &Url) -> Self {
        Self {
            status: 303,
            content_type: None,
            location: Some(location.to_string()),
            body: Vec::new(),
            source: ResponseSource::Synthetic,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}
