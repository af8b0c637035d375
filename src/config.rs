//! Configuration file parser for ~/.config/larder/config.toml.
//!
//! The config file is optional: a missing file yields `Config::default()`.
//! Unknown keys are accepted by serde but logged as likely typos.
use secrecy::SecretString;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::connectivity::ProbeSettings;
use crate::endpoints::Endpoints;
use crate::util::UrlValidationError;

/// Environment variable that overrides `auth_token`.
pub const TOKEN_ENV_VAR: &str = "LARDER_TOKEN";

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Invalid api_base_url: {0}")]
    BaseUrl(#[from] UrlValidationError),

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
///
/// The `Debug` impl masks `auth_token`.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the Recipe Service.
    pub api_base_url: String,

    /// SQLite file for the offline store. Defaults to `larder.db` in the config directory.
    pub database_path: Option<PathBuf>,

    /// Bearer credential for the Recipe Service. `LARDER_TOKEN` takes precedence.
    pub auth_token: Option<String>,

    pub probe_initial_delay_secs: u64,
    pub probe_interval_secs: u64,
    pub probe_timeout_secs: u64,

    /// Parallel fetches during reconcile.
    pub sync_concurrency: usize,

    /// Retries for transient Recipe Service failures (exponential backoff).
    pub fetch_retries: u32,

    pub network_timeout_secs: u64,

    /// Page-cache generation. Bumping it drops the old page cache on activate.
    pub cache_version: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8000".to_string(),
            database_path: None,
            auth_token: None,
            probe_initial_delay_secs: 3,
            probe_interval_secs: 12,
            probe_timeout_secs: 3,
            sync_concurrency: 4,
            fetch_retries: 2,
            network_timeout_secs: 20,
            cache_version: "v1".to_string(),
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("api_base_url", &self.api_base_url)
            .field("database_path", &self.database_path)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "[REDACTED]"))
            .field("probe_initial_delay_secs", &self.probe_initial_delay_secs)
            .field("probe_interval_secs", &self.probe_interval_secs)
            .field("probe_timeout_secs", &self.probe_timeout_secs)
            .field("sync_concurrency", &self.sync_concurrency)
            .field("fetch_retries", &self.fetch_retries)
            .field("network_timeout_secs", &self.network_timeout_secs)
            .field("cache_version", &self.cache_version)
            .finish()
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 10] = [
        "api_base_url",
        "database_path",
        "auth_token",
        "probe_initial_delay_secs",
        "probe_interval_secs",
        "probe_timeout_secs",
        "sync_concurrency",
        "fetch_retries",
        "network_timeout_secs",
        "cache_version",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing or empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    /// - Out-of-range values → `Err(ConfigError::Invalid)`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        tracing::info!(
            path = %path.display(),
            api_base_url = %config.api_base_url,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Reject values that would stall or disable the sync core.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("probe_interval_secs", self.probe_interval_secs),
            ("probe_timeout_secs", self.probe_timeout_secs),
            ("network_timeout_secs", self.network_timeout_secs),
            ("sync_concurrency", self.sync_concurrency as u64),
        ];
        for (key, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    key,
                    reason: "must be greater than 0".to_string(),
                });
            }
        }

        if self.cache_version.is_empty()
            || !self
                .cache_version
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(ConfigError::Invalid {
                key: "cache_version",
                reason: format!("{:?} must be non-empty [A-Za-z0-9._-]", self.cache_version),
            });
        }

        Ok(())
    }

    pub fn endpoints(&self) -> Result<Endpoints, ConfigError> {
        Ok(Endpoints::new(&self.api_base_url)?)
    }

    pub fn probe_settings(&self) -> ProbeSettings {
        ProbeSettings {
            initial_delay: Duration::from_secs(self.probe_initial_delay_secs),
            interval: Duration::from_secs(self.probe_interval_secs),
            timeout: Duration::from_secs(self.probe_timeout_secs),
        }
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network_timeout_secs)
    }

    /// Bearer credential: `LARDER_TOKEN` if set and non-empty, else `auth_token`.
    pub fn credential(&self) -> Option<SecretString> {
        self.credential_from(std::env::var(TOKEN_ENV_VAR).ok())
    }

    fn credential_from(&self, env_token: Option<String>) -> Option<SecretString> {
        env_token
            .filter(|t| !t.is_empty())
            .or_else(|| self.auth_token.clone().filter(|t| !t.is_empty()))
            .map(SecretString::from)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    fn write_config(name: &str, content: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("larder_config_test_{name}"));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, content).unwrap();
        path
    }

    fn cleanup(path: &Path) {
        if let Some(dir) = path.parent() {
            std::fs::remove_dir_all(dir).ok();
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.api_base_url, "http://localhost:8000");
        assert_eq!(config.probe_interval_secs, 12);
        assert_eq!(config.probe_timeout_secs, 3);
        assert_eq!(config.sync_concurrency, 4);
        assert_eq!(config.cache_version, "v1");
        assert!(config.auth_token.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_missing_file_returns_default() {
        let path = Path::new("/tmp/larder_test_nonexistent_config.toml");
        let config = Config::load(path).unwrap();
        assert_eq!(config.api_base_url, "http://localhost:8000");
    }

    #[test]
    fn test_whitespace_only_file_returns_default() {
        let path = write_config("whitespace", "   \n  \n  ");
        let config = Config::load(&path).unwrap();
        assert_eq!(config.cache_version, "v1");
        cleanup(&path);
    }

    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let path = write_config("partial", "api_base_url = \"https://recipes.example.com\"\n");
        let config = Config::load(&path).unwrap();
        assert_eq!(config.api_base_url, "https://recipes.example.com");
        assert_eq!(config.probe_interval_secs, 12);
        cleanup(&path);
    }

    #[test]
    fn test_full_config() {
        let content = r#"
api_base_url = "https://recipes.example.com/app"
database_path = "/var/lib/larder/offline.db"
auth_token = "token-123"
probe_initial_delay_secs = 1
probe_interval_secs = 15
probe_timeout_secs = 2
sync_concurrency = 8
fetch_retries = 0
network_timeout_secs = 5
cache_version = "v7"
"#;
        let path = write_config("full", content);
        let config = Config::load(&path).unwrap();

        assert_eq!(
            config.database_path,
            Some(PathBuf::from("/var/lib/larder/offline.db"))
        );
        assert_eq!(config.sync_concurrency, 8);
        assert_eq!(config.fetch_retries, 0);
        assert_eq!(config.cache_version, "v7");
        assert_eq!(
            config.probe_settings(),
            ProbeSettings {
                initial_delay: Duration::from_secs(1),
                interval: Duration::from_secs(15),
                timeout: Duration::from_secs(2),
            }
        );
        let endpoints = config.endpoints().unwrap();
        assert_eq!(
            endpoints.image_url("r1").as_str(),
            "https://recipes.example.com/app/api/recipes/r1/image"
        );
        cleanup(&path);
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let path = write_config("invalid", "this is not [valid toml");
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().contains("Invalid TOML"));
        cleanup(&path);
    }

    #[test]
    fn test_unknown_keys_accepted() {
        let path = write_config("unknown", "cache_version = \"v2\"\ntheme = \"dark\"\n");
        let config = Config::load(&path).unwrap();
        assert_eq!(config.cache_version, "v2");
        cleanup(&path);
    }

    #[test]
    fn test_zero_interval_rejected() {
        let path = write_config("zero", "probe_interval_secs = 0\n");
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "probe_interval_secs",
                ..
            }
        ));
        cleanup(&path);
    }

    #[test]
    fn test_bad_cache_version_rejected() {
        let config = Config {
            cache_version: "v1/../x".to_string(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_insecure_public_base_url_rejected() {
        let config = Config {
            api_base_url: "http://recipes.example.com".to_string(),
            ..Config::default()
        };
        assert!(matches!(config.endpoints(), Err(ConfigError::BaseUrl(_))));
    }

    #[test]
    fn test_too_large_file_rejected() {
        let path = write_config("too_large", &"a".repeat(1_048_577));
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::TooLarge(_)));
        cleanup(&path);
    }

    #[test]
    fn test_env_token_takes_precedence() {
        let config = Config {
            auth_token: Some("from-file".to_string()),
            ..Config::default()
        };
        let from_env = config.credential_from(Some("from-env".to_string())).unwrap();
        assert_eq!(from_env.expose_secret(), "from-env");

        let from_file = config.credential_from(Some(String::new())).unwrap();
        assert_eq!(from_file.expose_secret(), "from-file");

        assert!(Config::default().credential_from(None).is_none());
    }

    #[test]
    fn test_debug_masks_token() {
        let config = Config {
            auth_token: Some("super-secret-token".to_string()),
            ..Config::default()
        };
        let debug_output = format!("{:?}", config);
        assert!(!debug_output.contains("super-secret-token"));
        assert!(debug_output.contains("[REDACTED]"));
    }
}
