//! URL templates for the Recipe Service.
//!
//! Every URL the crate builds comes from here, including the Binary Cache keys.
//! Because the sync side and the Request Interceptor both use [`Endpoints::image_url`],
//! an intercepted image request is a direct key match against the Binary Cache.

use url::Url;

use crate::util::{validate_base_url, UrlValidationError};

/// Base URL of the Recipe Service plus the route templates derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    origin: Url,
    /// Non-empty path segments of the base URL (deployment under a sub-path).
    base_segments: Vec<String>,
}

impl Endpoints {
    /// Build endpoints from a validated base URL (see [`validate_base_url`]).
    pub fn new(base_url: &str) -> Result<Self, UrlValidationError> {
        let origin = validate_base_url(base_url)?;
        let base_segments = origin
            .path_segments()
            .map(|segments| {
                segments
                    .filter(|s| !s.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        Ok(Self {
            origin,
            base_segments,
        })
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    /// `GET {base}/api/recipes/{id}`: full recipe JSON.
    pub fn recipe_url(&self, id: &str) -> Url {
        self.with_segments(&["api", "recipes", id])
    }

    /// `GET {base}/api/recipes/{id}/image`, also the Binary Cache key for that recipe.
    pub fn image_url(&self, id: &str) -> Url {
        self.with_segments(&["api", "recipes", id, "image"])
    }

    /// `GET {base}/health?cacheBust=...` liveness probe.
    pub fn health_url(&self, cache_bust: u64) -> Url {
        let mut url = self.with_segments(&["health"]);
        url.query_pairs_mut()
            .append_pair("cacheBust", &cache_bust.to_string());
        url
    }

    /// Absolute URL of an app route such as `/upload`.
    pub fn route_url(&self, route: &str) -> Url {
        let segments: Vec<&str> = route.split('/').filter(|s| !s.is_empty()).collect();
        let mut url = self.with_segments(&segments);
        if route.ends_with('/') && !segments.is_empty() {
            if let Ok(mut path) = url.path_segments_mut() {
                path.push("");
            }
        }
        url
    }

    pub fn is_same_origin(&self, url: &Url) -> bool {
        url.origin() == self.origin.origin()
    }

    /// App-relative path of `url` (`/upload`, `/`), or `None` for foreign URLs.
    pub fn app_path(&self, url: &Url) -> Option<String> {
        let rest = self.relative_segments(url)?;
        Some(format!("/{}", rest.join("/")))
    }

    /// Recipe id of a URL matching the image template, as it appears in the path.
    ///
    /// The id is returned percent-encoded, exactly as the path carries it.
    pub fn image_recipe_id(&self, url: &Url) -> Option<String> {
        match self.relative_segments(url)?.as_slice() {
            [api, recipes, id, image]
                if api == "api" && recipes == "recipes" && image == "image" && !id.is_empty() =>
            {
                Some(id.clone())
            }
            _ => None,
        }
    }

    /// True for same-origin requests under `{base}/api/`.
    pub fn is_data_api(&self, url: &Url) -> bool {
        self.relative_segments(url)
            .is_some_and(|segments| segments.first().is_some_and(|s| s == "api"))
    }

    fn with_segments(&self, segments: &[&str]) -> Url {
        let mut url = self.origin.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.clear();
            path.extend(self.base_segments.iter().map(String::as_str));
            path.extend(segments);
        }
        url
    }

    /// Path segments of `url` after the base path, if `url` lives under this service.
    fn relative_segments(&self, url: &Url) -> Option<Vec<String>> {
        if !self.is_same_origin(url) {
            return None;
        }
        let segments: Vec<String> = url
            .path_segments()?
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect();
        if !segments.starts_with(&self.base_segments) {
            return None;
        }
        Some(segments[self.base_segments.len()..].to_vec())
    }
}
