use std::net::IpAddr;
use thiserror::Error;
use url::Url;

/// Errors that can occur while validating the Recipe Service base URL.
#[derive(Error, Debug)]
pub enum UrlValidationError {
    /// The URL string could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The URL uses a scheme other than http or https.
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    /// The URL has no host component.
    #[error("URL has no host")]
    MissingHost,
    /// Plain http pointed at a public host, which would leak the bearer credential.
    #[error("Insecure base URL: HTTPS required for public host {0}")]
    InsecurePublicHost(String),
    /// The base URL carries a query or fragment, which the URL templates cannot extend.
    #[error("Base URL must not contain a query or fragment")]
    HasQueryOrFragment,
}

/// Validates the base URL of the Recipe Service.
///
/// The bearer credential travels with every entity and image request, so plain
/// `http` is only accepted for hosts that never leave the machine or the local
/// network (loopback, `localhost`, RFC 1918, link-local, unique local IPv6).
/// Public hosts must use `https`.
///
/// # Examples
///
/// ```
/// use larder::util::validate_base_url;
///
/// assert!(validate_base_url("https://recipes.example.com").is_ok());
/// assert!(validate_base_url("http://localhost:8000").is_ok());
/// assert!(validate_base_url("http://recipes.example.com").is_err());
/// assert!(validate_base_url("file:///etc/passwd").is_err());
/// ```
pub fn validate_base_url(url_str: &str) -> Result<Url, UrlValidationError> {
    let url = Url::parse(url_str)?;

    let scheme = url.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(UrlValidationError::UnsupportedScheme(scheme.to_owned()));
    }

    let host = url.host_str().ok_or(UrlValidationError::MissingHost)?;

    if url.query().is_some() || url.fragment().is_some() {
        return Err(UrlValidationError::HasQueryOrFragment);
    }

    if scheme == "http" && !is_local_host(host) {
        tracing::error!(base_url = %url, "Rejecting non-HTTPS base URL for public host");
        return Err(UrlValidationError::InsecurePublicHost(host.to_owned()));
    }

    Ok(url)
}

fn is_local_host(host: &str) -> bool {
    if host == "localhost" {
        return true;
    }

    // Strip brackets from IPv6 addresses for parsing
    let host_for_parse = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    match host_for_parse.parse::<IpAddr>() {
        Ok(ip) => ip.is_loopback() || is_private_ip(&ip),
        Err(_) => false,
    }
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => ipv4.is_private() || ipv4.is_loopback() || ipv4.is_link_local(),
        IpAddr::V6(ipv6) => {
            if ipv6.is_loopback() {
                return true;
            }
            let segments = ipv6.segments();
            // Unique Local (fc00::/7)
            let is_unique_local = (segments[0] & 0xfe00) == 0xfc00;
            // Link-Local (fe80::/10)
            let is_link_local = (segments[0] & 0xffc0) == 0xfe80;
            is_unique_local || is_link_local
        }
    }
}
