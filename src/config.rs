//! Configuration for the fixture mock server.
//!
//! Defines where fixtures live, the optional backend to forward to, and the
//! simulation defaults applied before query directives.

use crate::options::{ErrorMode, RequestOption, INJECTABLE_STATUS};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Fixture directory settings
    #[serde(default)]
    pub fixtures: FixtureSettings,

    /// Backend to try before fixtures (none = fixtures only)
    #[serde(default)]
    pub backend: Option<BackendConfig>,

    /// Simulation defaults, overridden per request by query directives
    #[serde(default)]
    pub defaults: OptionDefaults,

    /// Global settings
    #[serde(default)]
    pub settings: GlobalSettings,
}

impl ServerConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.fixtures.validate()?;
        if let Some(backend) = &self.backend {
            backend.validate()?;
        }
        self.defaults.validate()?;
        if self.settings.max_body_bytes == 0 {
            anyhow::bail!("settings.max_body_bytes must be greater than zero");
        }
        Ok(())
    }
}

/// Where fixtures are read from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FixtureSettings {
    /// Directory holding fixture files
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Request header naming a subdirectory of `root` to search first
    #[serde(default = "default_override_header")]
    pub override_header: String,
}

impl Default for FixtureSettings {
    fn default() -> Self {
        Self {
            root: default_root(),
            override_header: default_override_header(),
        }
    }
}

impl FixtureSettings {
    pub fn validate(&self) -> anyhow::Result<()> {
        axum::http::HeaderName::try_from(self.override_header.as_str()).map_err(|e| {
            anyhow::anyhow!("Invalid override header {:?}: {}", self.override_header, e)
        })?;
        Ok(())
    }
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_override_header() -> String {
    "dist".to_string()
}

/// Live backend tried before fixtures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    /// Base URL, e.g. `http://localhost:3002`
    pub url: String,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl BackendConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout_ms: default_timeout_ms(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let url = reqwest::Url::parse(&self.url)
            .map_err(|e| anyhow::anyhow!("Invalid backend url {:?}: {}", self.url, e))?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("Backend url must be http or https: {}", self.url);
        }
        if self.timeout_ms == 0 {
            anyhow::bail!("backend.timeout_ms must be greater than zero");
        }
        Ok(())
    }
}

fn default_timeout_ms() -> u64 {
    30_000
}

/// Simulation defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct OptionDefaults {
    /// Delay applied to every request (ms)
    #[serde(default)]
    pub delay_ms: u64,

    /// Answer every request with this error status
    #[serde(default)]
    pub error: Option<u16>,

    /// Never contact the backend
    #[serde(default)]
    pub force_mock: bool,
}

impl OptionDefaults {
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(status) = self.error {
            if !INJECTABLE_STATUS.contains(&status) {
                anyhow::bail!("Invalid default error status: {}", status);
            }
        }
        Ok(())
    }

    pub fn to_request_option(&self) -> RequestOption {
        RequestOption {
            delay_ms: self.delay_ms,
            error: self.error.map(ErrorMode::Status),
            force_mock: self.force_mock,
        }
    }
}

/// Global settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalSettings {
    /// Log every fixture served
    #[serde(default = "default_true")]
    pub log_matches: bool,

    /// Log requests no fixture answered
    #[serde(default = "default_true")]
    pub log_unmatched: bool,

    /// Add permissive CORS headers and answer preflight requests
    #[serde(default = "default_true")]
    pub cors: bool,

    /// Largest request body buffered for forwarding
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            log_matches: true,
            log_unmatched: true,
            cors: true,
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = ServerConfig::from_yaml("{}").unwrap();
        assert_eq!(config.fixtures.root, PathBuf::from("."));
        assert_eq!(config.fixtures.override_header, "dist");
        assert!(config.backend.is_none());
        assert_eq!(config.defaults.to_request_option(), RequestOption::default());
        assert!(config.settings.cors);
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
fixtures:
  root: ./mocks
  override_header: x-fixture-set
backend:
  url: http://localhost:3002
  timeout_ms: 2000
defaults:
  delay_ms: 250
  error: 503
  force_mock: true
settings:
  log_matches: false
  cors: false
  max_body_bytes: 1024
"#;
        let config = ServerConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.fixtures.root, PathBuf::from("./mocks"));
        assert_eq!(config.fixtures.override_header, "x-fixture-set");

        let backend = config.backend.as_ref().unwrap();
        assert_eq!(backend.url, "http://localhost:3002");
        assert_eq!(backend.timeout_ms, 2000);

        let defaults = config.defaults.to_request_option();
        assert_eq!(defaults.delay_ms, 250);
        assert_eq!(defaults.error, Some(ErrorMode::Status(503)));
        assert!(defaults.force_mock);

        assert!(!config.settings.log_matches);
        assert!(config.settings.log_unmatched);
        assert_eq!(config.settings.max_body_bytes, 1024);
    }

    #[test]
    fn test_backend_timeout_default() {
        let config = ServerConfig::from_yaml("backend:\n  url: https://api.example.com\n").unwrap();
        assert_eq!(config.backend.unwrap().timeout_ms, 30_000);
    }

    #[test]
    fn test_rejects_unknown_fields() {
        assert!(ServerConfig::from_yaml("routes: []").is_err());
        assert!(ServerConfig::from_yaml("settings:\n  passthrough: true\n").is_err());
    }

    #[test]
    fn test_validation_errors() {
        assert!(ServerConfig::from_yaml("backend:\n  url: not a url\n").is_err());
        assert!(ServerConfig::from_yaml("backend:\n  url: ftp://host\n").is_err());
        assert!(ServerConfig::from_yaml("defaults:\n  error: 42\n").is_err());
        assert!(ServerConfig::from_yaml("defaults:\n  error: 101\n").is_err());
        assert!(ServerConfig::from_yaml("settings:\n  max_body_bytes: 0\n").is_err());
        assert!(ServerConfig::from_yaml("fixtures:\n  override_header: \"bad header\"\n").is_err());
    }
}
