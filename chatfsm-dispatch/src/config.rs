//! Runtime configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via CHATFSM_CONFIG or --config)
//! 3. Environment variables

use crate::dispatcher::Backpressure;
use crate::supervisor::FailurePolicy;
use chatfsm_core::{EngineConfig, KeyBy, DEFAULT_MAX_HOPS};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runtime configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Queue and key partitioning.
    pub dispatch: DispatchConfig,
    /// Worker pool behavior.
    pub workers: WorkerConfig,
    /// Transition engine limits.
    pub engine: EngineLimits,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("CHATFSM_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Applies overrides from `lookup`, which maps a variable name to its
    /// value. Unparseable values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        self.dispatch.apply_overrides(&lookup);
        self.workers.apply_overrides(&lookup);
        self.engine.apply_overrides(&lookup);
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatch.capacity == 0 {
            return Err(ConfigError::ValidationError(
                "dispatch.capacity must be at least 1".to_string(),
            ));
        }
        if self.engine.max_hops == 0 {
            return Err(ConfigError::ValidationError(
                "engine.max_hops must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the engine configuration these settings describe.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            key_by: self.dispatch.key_by,
            max_hops: self.engine.max_hops,
        }
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Dispatcher configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Bound on concurrent keys, also the worker pool size.
    pub capacity: usize,
    /// How messages map to conversations.
    pub key_by: KeyBy,
    /// When `feed` blocks.
    pub backpressure: Backpressure,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            capacity: 8,
            key_by: KeyBy::Sender,
            backpressure: Backpressure::Bounded,
        }
    }
}

impl DispatchConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(n) = lookup("CHATFSM_CAPACITY").and_then(|v| v.parse().ok()) {
            self.capacity = n;
        }

        if let Some(key_by) = lookup("CHATFSM_KEY_BY") {
            match key_by.to_lowercase().as_str() {
                "sender" => self.key_by = KeyBy::Sender,
                "chat" => self.key_by = KeyBy::Chat,
                _ => {}
            }
        }

        if let Some(policy) = lookup("CHATFSM_BACKPRESSURE") {
            match policy.to_lowercase().as_str() {
                "bounded" => self.backpressure = Backpressure::Bounded,
                "drain" => self.backpressure = Backpressure::Drain,
                _ => {}
            }
        }
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Delay before a failed message is retried (and before a failed
    /// worker restarts), in milliseconds.
    pub retry_delay_ms: u64,
    /// What the supervisor does when a worker dies.
    pub failure_policy: FailurePolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: 500,
            failure_policy: FailurePolicy::Halt,
        }
    }
}

impl WorkerConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(ms) = lookup("CHATFSM_RETRY_DELAY_MS").and_then(|v| v.parse().ok()) {
            self.retry_delay_ms = ms;
        }

        if let Some(policy) = lookup("CHATFSM_FAILURE_POLICY") {
            match policy.to_lowercase().as_str() {
                "halt" => self.failure_policy = FailurePolicy::Halt,
                "restart" => self.failure_policy = FailurePolicy::Restart,
                _ => {}
            }
        }
    }

    /// Returns the retry delay as Duration.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Engine limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineLimits {
    /// Maximum transitions a single message may trigger.
    pub max_hops: usize,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            max_hops: DEFAULT_MAX_HOPS,
        }
    }
}

impl EngineLimits {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(n) = lookup("CHATFSM_MAX_HOPS").and_then(|v| v.parse().ok()) {
            self.max_hops = n;
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.dispatch.capacity, 8);
        assert_eq!(config.dispatch.key_by, KeyBy::Sender);
        assert_eq!(config.dispatch.backpressure, Backpressure::Bounded);
        assert_eq!(config.workers.retry_delay(), Duration::from_millis(500));
        assert_eq!(config.workers.failure_policy, FailurePolicy::Halt);
        assert_eq!(config.engine.max_hops, 64);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chatfsm.yaml");
        std::fs::write(
            &path,
            "dispatch:\n  capacity: 2\n  key_by: chat\nworkers:\n  failure_policy: restart\n",
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.dispatch.capacity, 2);
        assert_eq!(config.dispatch.key_by, KeyBy::Chat);
        assert_eq!(config.dispatch.backpressure, Backpressure::Bounded);
        assert_eq!(config.workers.failure_policy, FailurePolicy::Restart);
        assert_eq!(config.workers.retry_delay_ms, 500);
        assert_eq!(config.engine_config().key_by, KeyBy::Chat);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.yaml");

        let mut config = Config::default();
        config.dispatch.backpressure = Backpressure::Drain;
        config.engine.max_hops = 10;
        config.save(&path).unwrap();

        assert_eq!(Config::from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_missing_and_invalid_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = Config::from_file(dir.path().join("nope.yaml")).unwrap_err();
        assert!(matches!(missing, ConfigError::IoError(..)));

        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "dispatch:\n  capacity: lots\n").unwrap();
        let bad = Config::from_file(&path).unwrap_err();
        assert!(matches!(bad, ConfigError::ParseError(..)));
        assert!(bad.to_string().contains("bad.yaml"));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("CHATFSM_CAPACITY", "3"),
            ("CHATFSM_KEY_BY", "CHAT"),
            ("CHATFSM_BACKPRESSURE", "drain"),
            ("CHATFSM_RETRY_DELAY_MS", "not-a-number"),
            ("CHATFSM_FAILURE_POLICY", "restart"),
            ("CHATFSM_MAX_HOPS", "16"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.dispatch.capacity, 3);
        assert_eq!(config.dispatch.key_by, KeyBy::Chat);
        assert_eq!(config.dispatch.backpressure, Backpressure::Drain);
        assert_eq!(config.workers.retry_delay_ms, 500);
        assert_eq!(config.workers.failure_policy, FailurePolicy::Restart);
        assert_eq!(config.engine.max_hops, 16);
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.dispatch.capacity = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        let mut config = Config::default();
        config.engine.max_hops = 0;
        assert!(config.validate().is_err());
    }
}
