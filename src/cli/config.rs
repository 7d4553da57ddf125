// ABOUTME: Configuration management for the agentflow application
// ABOUTME: Handles loading configuration from YAML files and AGENTFLOW_* environment variables

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::time::Duration;

use crate::engine::RuntimeConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_max_concurrent_steps")]
    pub max_concurrent_steps: usize,

    /// Default deadline for steps without their own timeout
    #[serde(default, with = "humantime_serde")]
    pub step_timeout: Option<Duration>,

    #[serde(default)]
    pub allow_orphans: bool,

    /// Directory where run snapshots are persisted; in-memory only when unset
    #[serde(default)]
    pub state_dir: Option<PathBuf>,

    /// Variables layered under each workflow's own variables
    #[serde(default)]
    pub variables: Map<String, Value>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

fn default_max_concurrent_steps() -> usize {
    8
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_steps: default_max_concurrent_steps(),
            step_timeout: None,
            allow_orphans: false,
            state_dir: None,
            variables: Map::new(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file path or default locations
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p,
            None => Self::find_config_file(),
        };

        let mut config = if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config {}", config_path.display()))?;
            serde_yaml::from_str(&contents)
                .with_context(|| format!("Invalid config {}", config_path.display()))?
        } else {
            Config::default()
        };

        config.merge_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Find configuration file in standard locations
    fn find_config_file() -> PathBuf {
        let possible_paths = [
            PathBuf::from("agentflow.yaml"),
            PathBuf::from("agentflow.yml"),
            PathBuf::from(".agentflow.yaml"),
            PathBuf::from(".agentflow.yml"),
        ];

        for path in possible_paths {
            if path.exists() {
                return path;
            }
        }

        if let Some(home_dir) = dirs::home_dir() {
            let home_config = home_dir.join(".agentflow").join("config.yaml");
            if home_config.exists() {
                return home_config;
            }
        }

        // Default path (may not exist)
        PathBuf::from("agentflow.yaml")
    }

    /// Apply environment overrides; `lookup` is `std::env::var` outside tests
    pub fn merge_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup("AGENTFLOW_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("AGENTFLOW_LOG_FORMAT") {
            self.logging.format = format;
        }
        if let Some(max) = lookup("AGENTFLOW_MAX_CONCURRENT") {
            self.max_concurrent_steps = max
                .parse()
                .with_context(|| format!("AGENTFLOW_MAX_CONCURRENT is not a number: {}", max))?;
        }
        if let Some(timeout) = lookup("AGENTFLOW_STEP_TIMEOUT") {
            self.step_timeout = Some(
                humantime_serde::re::humantime::parse_duration(&timeout)
                    .with_context(|| format!("AGENTFLOW_STEP_TIMEOUT is not a duration: {}", timeout))?,
            );
        }
        if let Some(allow) = lookup("AGENTFLOW_ALLOW_ORPHANS") {
            self.allow_orphans = matches!(allow.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(dir) = lookup("AGENTFLOW_STATE_DIR") {
            self.state_dir = Some(PathBuf::from(dir));
        }

        Ok(())
    }

    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            max_concurrent_steps: self.max_concurrent_steps,
            step_timeout: self.step_timeout,
            allow_orphans: self.allow_orphans,
        }
    }
}
