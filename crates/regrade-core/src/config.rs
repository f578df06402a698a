//! Run configuration
//!
//! Loaded from an optional TOML file, then overridden by CLI flags. Every path
//! the core touches (cache, cookies) comes from here; nothing reads ambient
//! global locations.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Default platform base URL
pub const DEFAULT_BASE_URL: &str = "https://www.gradescope.com";

/// Which per-student count drives the minimum-request cutoff and sorting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// Distinct questions the student opened a thread on
    #[default]
    Unique,
    /// Every comment submitted, including repeats on one question
    Total,
}

impl FromStr for Metric {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unique" => Ok(Metric::Unique),
            "total" => Ok(Metric::Total),
            other => Err(CoreError::InvalidConfig {
                message: format!("unknown metric '{}' (expected unique|total)", other),
            }),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Metric::Unique => write!(f, "unique"),
            Metric::Total => write!(f, "total"),
        }
    }
}

/// Which entailment model scores the threads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassifierBackend {
    /// NLI inference server at `endpoint`
    #[default]
    Http,
    /// Local cue-word model, no server needed
    Keyword,
}

impl FromStr for ClassifierBackend {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(ClassifierBackend::Http),
            "keyword" => Ok(ClassifierBackend::Keyword),
            other => Err(CoreError::InvalidConfig {
                message: format!("unknown classifier backend '{}' (expected http|keyword)", other),
            }),
        }
    }
}

/// Entailment classifier settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// When false the classification stage is skipped entirely
    pub enabled: bool,
    pub backend: ClassifierBackend,
    /// Inference server (preferably the accelerated one)
    pub endpoint: String,
    /// Tried when the primary endpoint does not answer its health probe
    pub fallback_endpoint: Option<String>,
    /// Entailment scores closer than this are reported as undetermined
    pub ambiguity_margin: f32,
    pub timeout_secs: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: ClassifierBackend::Http,
            endpoint: "http://127.0.0.1:8080".to_string(),
            fallback_endpoint: None,
            ambiguity_margin: 0.2,
            timeout_secs: 60,
        }
    }
}

/// Configuration for a pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegradeConfig {
    pub base_url: String,
    /// Directory holding the SQLite record cache
    pub cache_dir: PathBuf,
    /// Persisted session cookies
    pub cookie_file: PathBuf,
    /// Ignore cached records and fetch every thread again
    pub refresh_cache: bool,
    /// Concurrent detail fetches
    pub parallelism: usize,
    /// Attempts per request, including the first
    pub max_attempts: u32,
    /// Base backoff, doubled after each failed attempt
    pub retry_delay_ms: u64,
    pub request_timeout_secs: u64,
    /// Students below this count (per `metric`) are not fetched or reported
    pub min_requests: usize,
    pub metric: Metric,
    pub classifier: ClassifierConfig,
}

impl Default for RegradeConfig {
    fn default() -> Self {
        let app_config = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("regrade");
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            cache_dir: dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("regrade"),
            cookie_file: app_config.join("cookies.json"),
            refresh_cache: false,
            parallelism: 10,
            max_attempts: 3,
            retry_delay_ms: 250,
            request_timeout_secs: 20,
            min_requests: 0,
            metric: Metric::Unique,
            classifier: ClassifierConfig::default(),
        }
    }
}

impl RegradeConfig {
    /// Default config file: `<config_dir>/regrade/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("regrade").join("config.toml"))
    }

    /// Load from a TOML file; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(CoreError::FileRead {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };

        let config: Self = toml::from_str(&content).map_err(|e| CoreError::InvalidConfig {
            message: format!("{}: {}", path.display(), e),
        })?;
        config.validate()?;

        debug!(path = %path.display(), "Config loaded");
        Ok(config)
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<(), CoreError> {
        let invalid = |message: String| Err(CoreError::InvalidConfig { message });

        if self.parallelism == 0 {
            return invalid("parallelism must be at least 1".to_string());
        }
        if self.max_attempts == 0 {
            return invalid("max_attempts must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.classifier.ambiguity_margin) {
            return invalid(format!(
                "classifier.ambiguity_margin must be within [0, 1], got {}",
                self.classifier.ambiguity_margin
            ));
        }
        if url::Url::parse(&self.base_url).is_err() {
            return invalid(format!("base_url is not a URL: {}", self.base_url));
        }
        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
