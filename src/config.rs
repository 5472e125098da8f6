//! Engine configuration.
//!
//! Read from `windlass.toml`, then overridden by environment variables and
//! finally by CLI flags (file → environment → CLI).
//!
//! ```toml
//! [engine]
//! default_model = "claude-sonnet"
//! max_parallel = 4
//! default_max_turns = 10
//!
//! [retry]
//! max_retries = 3
//! initial_delay_ms = 1000
//! max_delay_ms = 30000
//! backoff_multiplier = 2.0
//!
//! [timeouts]
//! model_call_secs = 120
//! tool_call_secs = 60
//!
//! [context]
//! warn_threshold = 0.8
//! chars_per_token = 4
//! model_window_tokens = 200000
//!
//! [paths]
//! data_dir = "~/.windlass"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::context::DEFAULT_WARN_THRESHOLD;
use crate::provider::RetryConfig;

/// Default config file looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "windlass.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub timeouts: TimeoutsSection,
    #[serde(default)]
    pub context: ContextSection,
    #[serde(default)]
    pub paths: PathsSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineSection {
    /// Model used when neither the phase nor the cascade names one
    #[serde(default = "default_model")]
    pub default_model: String,
    /// Candidate attempts allowed to run at once
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Turn budget for phases without `max_turns`
    #[serde(default = "default_max_turns")]
    pub default_max_turns: u32,
    /// Responses kept by the opt-in cache before the oldest are evicted
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

fn default_model() -> String {
    "default".to_string()
}

fn default_max_parallel() -> usize {
    4
}

fn default_max_turns() -> u32 {
    10
}

fn default_cache_capacity() -> usize {
    1024
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            default_model: default_model(),
            max_parallel: default_max_parallel(),
            default_max_turns: default_max_turns(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeoutsSection {
    #[serde(default = "default_model_call_secs")]
    pub model_call_secs: u64,
    #[serde(default = "default_tool_call_secs")]
    pub tool_call_secs: u64,
}

fn default_model_call_secs() -> u64 {
    120
}

fn default_tool_call_secs() -> u64 {
    60
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            model_call_secs: default_model_call_secs(),
            tool_call_secs: default_tool_call_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextSection {
    /// Fraction of a token budget at which a warning is raised
    #[serde(default = "default_warn_threshold")]
    pub warn_threshold: f32,
    /// Characters per token for estimation
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: usize,
    /// Window used to resolve percentage budgets such as "80%"
    #[serde(default = "default_model_window_tokens")]
    pub model_window_tokens: usize,
}

fn default_warn_threshold() -> f32 {
    DEFAULT_WARN_THRESHOLD
}

fn default_chars_per_token() -> usize {
    4
}

fn default_model_window_tokens() -> usize {
    200_000
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            warn_threshold: default_warn_threshold(),
            chars_per_token: default_chars_per_token(),
            model_window_tokens: default_model_window_tokens(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PathsSection {
    /// Root for everything the engine writes (default: ~/.windlass)
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub artifacts_dir: Option<PathBuf>,
    #[serde(default)]
    pub winners_dir: Option<PathBuf>,
    /// JSONL trace destination
    #[serde(default)]
    pub trace_file: Option<PathBuf>,
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse windlass.toml")
    }

    /// Load `path` if given, else `./windlass.toml` if present, else defaults;
    /// then apply environment overrides.
    pub fn load_layered(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => {
                let local = Path::new(CONFIG_FILE_NAME);
                if local.exists() {
                    Self::load(local)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply `WINDLASS_*` overrides from `lookup`.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(model) = lookup("WINDLASS_MODEL").filter(|m| !m.trim().is_empty()) {
            self.engine.default_model = model;
        }
        if let Some(raw) = lookup("WINDLASS_MAX_PARALLEL") {
            match raw.trim().parse() {
                Ok(n) => self.engine.max_parallel = n,
                Err(_) => tracing::warn!(value = %raw, "Ignoring invalid WINDLASS_MAX_PARALLEL"),
            }
        }
        if let Some(dir) = lookup("WINDLASS_DATA_DIR").filter(|d| !d.trim().is_empty()) {
            self.paths.data_dir = Some(PathBuf::from(dir));
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        self.paths.data_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .map(|home| home.join(".windlass"))
                .unwrap_or_else(|| PathBuf::from(".windlass"))
        })
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.paths
            .artifacts_dir
            .clone()
            .unwrap_or_else(|| self.data_dir().join("artifacts"))
    }

    pub fn winners_dir(&self) -> PathBuf {
        self.paths
            .winners_dir
            .clone()
            .unwrap_or_else(|| self.data_dir().join("winners"))
    }

    pub fn trace_file(&self) -> PathBuf {
        self.paths
            .trace_file
            .clone()
            .unwrap_or_else(|| self.data_dir().join("traces").join("trace.jsonl"))
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(
            self.retry.max_retries,
            Duration::from_millis(self.retry.initial_delay_ms),
            Duration::from_millis(self.retry.max_delay_ms),
            self.retry.backoff_multiplier,
        )
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.model_call_secs)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.tool_call_secs)
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.engine.max_parallel == 0 {
            warnings.push("engine.max_parallel is 0; candidates would never run".to_string());
        }
        if self.engine.default_max_turns == 0 {
            warnings.push("engine.default_max_turns is 0; phases without max_turns cannot run".to_string());
        }
        if self.engine.cache_capacity == 0 {
            warnings.push("engine.cache_capacity is 0; cached responses will not be kept".to_string());
        }
        if !(0.0..=1.0).contains(&self.context.warn_threshold) {
            warnings.push(format!(
                "context.warn_threshold {} should be between 0.0 and 1.0",
                self.context.warn_threshold
            ));
        }
        if self.context.chars_per_token == 0 {
            warnings.push("context.chars_per_token is 0; 1 will be used".to_string());
        }
        if self.retry.backoff_multiplier < 1.0 {
            warnings.push(format!(
                "retry.backoff_multiplier {} is below 1.0; delays will shrink",
                self.retry.backoff_multiplier
            ));
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            warnings.push(format!(
                "retry.initial_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.initial_delay_ms, self.retry.max_delay_ms
            ));
        }
        if self.timeouts.model_call_secs == 0 || self.timeouts.tool_call_secs == 0 {
            warnings.push("timeouts of 0 seconds fail every call".to_string());
        }

        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.engine.max_parallel, 4);
        assert_eq!(config.engine.default_max_turns, 10);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.context.chars_per_token, 4);
        assert!((config.context.warn_threshold - 0.8).abs() < f32::EPSILON);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_parse_partial_file() {
        let config = EngineConfig::parse(
            r#"
[engine]
default_model = "fast"

[timeouts]
tool_call_secs = 5

[paths]
data_dir = "/tmp/wl"
"#,
        )
        .unwrap();
        assert_eq!(config.engine.default_model, "fast");
        assert_eq!(config.engine.max_parallel, 4);
        assert_eq!(config.tool_timeout(), Duration::from_secs(5));
        assert_eq!(config.model_timeout(), Duration::from_secs(120));
        assert_eq!(config.winners_dir(), PathBuf::from("/tmp/wl/winners"));
        assert_eq!(
            config.trace_file(),
            PathBuf::from("/tmp/wl/traces/trace.jsonl")
        );
    }

    #[test]
    fn test_load_reports_path_on_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("windlass.toml");
        std::fs::write(&path, "[engine\n").unwrap();
        let err = EngineConfig::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse windlass.toml"));

        let missing = EngineConfig::load(&dir.path().join("missing.toml")).unwrap_err();
        assert!(missing.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = EngineConfig::parse("[engine]\nmax_parallel = 2\n").unwrap();
        let env: HashMap<&str, &str> = [
            ("WINDLASS_MODEL", "env-model"),
            ("WINDLASS_MAX_PARALLEL", "8"),
            ("WINDLASS_DATA_DIR", "/data"),
        ]
        .into_iter()
        .collect();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.engine.default_model, "env-model");
        assert_eq!(config.engine.max_parallel, 8);
        assert_eq!(config.artifacts_dir(), PathBuf::from("/data/artifacts"));
    }

    #[test]
    fn test_invalid_env_value_ignored() {
        let mut config = EngineConfig::default();
        config.apply_env(|k| (k == "WINDLASS_MAX_PARALLEL").then(|| "many".to_string()));
        assert_eq!(config.engine.max_parallel, 4);
    }

    #[test]
    fn test_validate_warnings() {
        let mut config = EngineConfig::default();
        config.engine.max_parallel = 0;
        config.context.warn_threshold = 1.5;
        config.retry.initial_delay_ms = 60_000;
        let warnings = config.validate();
        assert_eq!(warnings.len(), 3);
        assert!(warnings[0].contains("max_parallel"));
        assert!(warnings[1].contains("warn_threshold"));
        assert!(warnings[2].contains("initial_delay_ms"));
    }

    #[test]
    fn test_retry_config_from_section() {
        let config = EngineConfig::default();
        let retry = config.retry_config();
        assert_eq!(retry.max_retries, 3);
        assert_eq!(retry.delay_for_attempt(0), Duration::from_secs(1));
    }
}
