use crate::assembler::{GroupingScheme, PendingUploadPolicy};
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the intake session
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Upload lifecycle configuration
    #[serde(default)]
    pub upload: UploadConfig,
    /// Order assembly configuration
    #[serde(default)]
    pub assembly: AssemblyConfig,
    /// Backend (upload/delete/submit endpoints) configuration
    #[serde(default)]
    pub backend: BackendConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Upload lifecycle configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Upper bound for a single upload before it is marked timed out
    #[serde(default = "default_upload_timeout_secs")]
    pub timeout_secs: u64,
    /// Append a per-upload revision to server URLs so every resolved upload
    /// gets a distinct fetch key
    #[serde(default = "default_true")]
    pub cache_bust: bool,
}

/// Order assembly configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AssemblyConfig {
    /// What to do with photos whose upload has not completed at submit time
    #[serde(default)]
    pub pending_policy: PendingUploadPolicy,
    /// How size keys are mapped to submission group keys
    #[serde(default)]
    pub grouping: GroupingScheme,
}

/// Which backend implementation serves the session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendMode {
    /// In-process backend with artificial latency
    #[default]
    Simulated,
    /// Remote HTTP endpoints under `base_url`
    Http,
}

/// Backend configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub mode: BackendMode,
    /// Base URL of the HTTP endpoints
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// HTTP request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Origin used for URLs handed out by the simulated backend
    #[serde(default = "default_simulated_origin")]
    pub simulated_origin: String,
    /// Simulated upload latency in milliseconds
    #[serde(default = "default_upload_latency_ms")]
    pub upload_latency_ms: u64,
    /// Simulated delete latency in milliseconds
    #[serde(default = "default_delete_latency_ms")]
    pub delete_latency_ms: u64,
    /// Simulated submit latency in milliseconds
    #[serde(default = "default_submit_latency_ms")]
    pub submit_latency_ms: u64,
}

// Default value functions
fn default_service_name() -> String {
    "photo-intake".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_upload_timeout_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_simulated_origin() -> String {
    "https://uploads.intake.local".to_string()
}

fn default_upload_latency_ms() -> u64 {
    800
}

fn default_delete_latency_ms() -> u64 {
    300
}

fn default_submit_latency_ms() -> u64 {
    1200
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .set_default("service.name", "photo-intake")?
            .set_default("service.log_level", "info")?
            .add_source(config::File::with_name("config/intake").required(false))
            .add_source(config::File::with_name("/etc/photo-intake/intake").required(false))
            // INTAKE__BACKEND__BASE_URL -> backend.base_url
            .add_source(
                config::Environment::with_prefix("INTAKE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Get the upload timeout as Duration
    pub fn upload_timeout(&self) -> Duration {
        self.upload.timeout()
    }

    /// Get the HTTP request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.backend.request_timeout_secs)
    }
}

impl UploadConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl BackendConfig {
    pub fn upload_latency(&self) -> Duration {
        Duration::from_millis(self.upload_latency_ms)
    }

    pub fn delete_latency(&self) -> Duration {
        Duration::from_millis(self.delete_latency_ms)
    }

    pub fn submit_latency(&self) -> Duration {
        Duration::from_millis(self.submit_latency_ms)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_upload_timeout_secs(),
            cache_bust: default_true(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            mode: BackendMode::default(),
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
            simulated_origin: default_simulated_origin(),
            upload_latency_ms: default_upload_latency_ms(),
            delete_latency_ms: default_delete_latency_ms(),
            submit_latency_ms: default_submit_latency_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_toml(source: &str) -> Config {
        config::Config::builder()
            .add_source(config::File::from_str(source, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.upload.timeout_secs, 30);
        assert!(config.upload.cache_bust);
        assert_eq!(config.backend.mode, BackendMode::Simulated);
        assert_eq!(config.backend.upload_latency(), Duration::from_millis(800));
        assert_eq!(
            config.assembly.pending_policy,
            PendingUploadPolicy::RequireUploaded
        );
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = from_toml(
            r#"
            [backend]
            mode = "http"
            base_url = "https://orders.example.com"

            [assembly]
            pending_policy = "fallback_to_preview"
            grouping = "dimension_variant"
            "#,
        );

        assert_eq!(config.backend.mode, BackendMode::Http);
        assert_eq!(config.backend.base_url, "https://orders.example.com");
        assert_eq!(config.backend.request_timeout_secs, 30);
        assert_eq!(
            config.assembly.pending_policy,
            PendingUploadPolicy::FallbackToPreview
        );
        assert_eq!(config.assembly.grouping, GroupingScheme::DimensionVariant);
        assert_eq!(config.service.name, "photo-intake");
    }

    #[test]
    fn test_empty_source_deserializes() {
        let config = from_toml("");
        assert_eq!(config.upload_timeout(), Duration::from_secs(30));
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
    }
}
