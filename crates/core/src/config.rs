//! TOML-based configuration system for MergeMend.
//!
//! Secrets (the oracle API key, the git remote token) are stored as `_env`
//! fields that reference environment variable names. The actual secrets are
//! resolved at runtime via [`AppConfig::resolve_env_vars`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::ConfigError;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Working-tree repository settings.
    #[serde(default)]
    pub repository: RepositoryConfig,

    /// Resolution oracle settings.
    #[serde(default)]
    pub oracle: OracleConfig,

    /// Resolution pipeline behaviour.
    #[serde(default)]
    pub resolver: ResolverConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

/// Working-tree repository configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Path to the repository root (default: current directory).
    #[serde(default = "default_repo_path")]
    pub path: PathBuf,

    /// Remote fetched from before merging (default `origin`).
    #[serde(default = "default_remote")]
    pub remote: String,

    /// Environment variable holding an access token for fetching.
    #[serde(default)]
    pub token_env: Option<String>,

    /// Resolved token (populated by `resolve_env_vars`).
    #[serde(skip)]
    pub token: Option<String>,
}

fn default_repo_path() -> PathBuf {
    PathBuf::from(".")
}
fn default_remote() -> String {
    "origin".into()
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            path: default_repo_path(),
            remote: default_remote(),
            token_env: None,
            token: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Oracle
// ---------------------------------------------------------------------------

/// Resolution oracle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    /// API base URL.
    #[serde(default = "default_oracle_url")]
    pub api_url: String,

    /// Model name used in the `models/{model}:generateContent` path.
    #[serde(default = "default_model")]
    pub model: String,

    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Per-request timeout in seconds (default 120).
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Resolved API key (populated by `resolve_env_vars`).
    #[serde(skip)]
    pub api_key: Option<String>,
}

fn default_oracle_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".into()
}
fn default_model() -> String {
    "gemini-1.5-flash".into()
}
fn default_api_key_env() -> String {
    "MERGEMEND_API_KEY".into()
}
fn default_timeout() -> u64 {
    120
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            api_url: default_oracle_url(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_timeout(),
            api_key: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// How resolutions are spliced back into a file.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PatchStrategy {
    /// Rewrite the byte spans captured at scan time, last span first.
    #[default]
    Anchored,
    /// Replace the first literal occurrence of each conflict's text, in order.
    ///
    /// Identical conflict blocks in one file may be matched out of order.
    Literal,
}

/// Whether a resolution must keep the line count of the region it replaces.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LineCountPolicy {
    /// Accept any non-empty resolution.
    #[default]
    Lenient,
    /// Reject a resolution whose line count matches neither side.
    Strict,
}

/// Resolution pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Patch strategy.
    #[serde(default)]
    pub strategy: PatchStrategy,

    /// Line-count enforcement.
    #[serde(default)]
    pub line_count_policy: LineCountPolicy,

    /// Files processed concurrently (oracle calls within a file stay serial).
    #[serde(default = "default_max_concurrent_files")]
    pub max_concurrent_files: usize,
}

fn default_max_concurrent_files() -> usize {
    4
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            strategy: PatchStrategy::default(),
            line_count_policy: LineCountPolicy::default(),
            max_concurrent_files: default_max_concurrent_files(),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Optional directory for a `mergemend.log` file.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "warn".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_dir: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load an [`AppConfig`] from a TOML file at the given path.
    ///
    /// This does **not** resolve environment variables -- call
    /// [`resolve_env_vars`](Self::resolve_env_vars) afterwards.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Resolve all `*_env` fields from environment variables.
    ///
    /// Missing variables log a warning but do not fail; the oracle reports a
    /// missing key when it is first used.
    pub fn resolve_env_vars(&mut self) {
        self.oracle.api_key = resolve_optional_env(&self.oracle.api_key_env, "oracle.api_key_env");

        if let Some(ref env_name) = self.repository.token_env {
            self.repository.token = resolve_optional_env(env_name, "repository.token_env");
        }

        debug!("environment variable resolution complete");
    }

    /// Validate that all values are sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.repository.remote.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "repository.remote".into(),
                detail: "remote name must not be empty".into(),
            });
        }
        if !self.oracle.api_url.starts_with("http://") && !self.oracle.api_url.starts_with("https://")
        {
            return Err(ConfigError::InvalidValue {
                field: "oracle.api_url".into(),
                detail: "API URL must start with http:// or https://".into(),
            });
        }
        if self.oracle.model.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "oracle.model".into(),
                detail: "model must not be empty".into(),
            });
        }
        if self.oracle.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "oracle.timeout_secs".into(),
                detail: "timeout must be > 0".into(),
            });
        }
        if self.resolver.max_concurrent_files == 0 {
            return Err(ConfigError::InvalidValue {
                field: "resolver.max_concurrent_files".into(),
                detail: "at least one file must be processed at a time".into(),
            });
        }
        Ok(())
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_vars();
        config.validate()?;
        Ok(config)
    }
}

/// Try to read an environment variable by name. Returns `Some(value)` on
/// success; logs a warning and returns `None` if the variable is unset.
fn resolve_optional_env(env_name: &str, field: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.is_empty() => {
            debug!(field, env_name, "resolved env var");
            Some(val)
        }
        Ok(_) => {
            warn!(field, env_name, "env var is set but empty");
            None
        }
        Err(_) => {
            warn!(field, env_name, "env var not set");
            None
        }
    }
}
