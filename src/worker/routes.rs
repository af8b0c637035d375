use reqwest::Method;

use super::request::InterceptedRequest;
use crate::endpoints::Endpoints;

/// App path the platform posts shared files to.
pub const SHARE_TARGET_PATH: &str = "/share-target";
/// Where the page picks up a shared file after the redirect.
pub const SHARE_PICKUP_PATH: &str = "/upload";
pub const SHARE_PICKUP_QUERY: &str = "shared=1";

pub const APP_SHELL_PATH: &str = "/";
/// Client-rendered detail view that reads recipes from the Object Cache.
pub const OFFLINE_DETAIL_PATH: &str = "/recipes/offline";

/// Shell routes pre-warmed into the page cache at install.
pub const SHELL_ROUTES: &[&str] = &[APP_SHELL_PATH, SHARE_PICKUP_PATH, OFFLINE_DETAIL_PATH];

/// Fetch policy chosen for an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Same-origin POST of a shared file: stash it and redirect.
    ShareTarget,
    /// Recipe image: network-first, stored into the Binary Cache.
    RecipeImage,
    /// Data API: forwarded untouched, failures go back to the page.
    DataApi,
    /// Any other same-origin GET: network-first with the page-cache fallbacks.
    Page,
    /// Cross-origin or non-GET traffic: forwarded untouched.
    Passthrough,
}

impl Route {
    pub fn classify(endpoints: &Endpoints, request: &InterceptedRequest) -> Self {
        if !endpoints.is_same_origin(&request.url) {
            return Route::Passthrough;
        }

        if request.method == Method::POST
            && endpoints.app_path(&request.url).as_deref() == Some(SHARE_TARGET_PATH)
        {
            return Route::ShareTarget;
        }

        if request.method != Method::GET {
            return Route::Passthrough;
        }

        if endpoints.image_recipe_id(&request.url).is_some() {
            Route::RecipeImage
        } else if endpoints.is_data_api(&request.url) {
            Route::DataApi
        } else {
            Route::Page
        }
    }
}
