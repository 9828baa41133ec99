//! Run configuration.
//!
//! Parses the `key=value` format from `.cadence/config`.
//! Precedence: CLI flags > config file > defaults. The resolved config is
//! serialized to JSON and snapshotted on the run row so a resumed run uses
//! the configuration it started with.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
}

/// Configuration for a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Hard ceiling on iterations per run.
    pub max_iterations: u32,

    // Model selection per agent role; `model` is the fallback.
    pub model: String,
    pub planner_model: Option<String>,
    pub executor_model: Option<String>,
    pub verifier_model: Option<String>,

    /// Specialist agents to run after the verifier (e.g. `code-reviewer`).
    pub specialists: Vec<String>,

    /// Base branch for the milestone branch. Defaults to current HEAD.
    pub base_branch: Option<String>,

    // Retry policy for agent invocations.
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            model: "sonnet".to_string(),
            planner_model: None,
            executor_model: None,
            verifier_model: None,
            specialists: Vec::new(),
            base_branch: None,
            retry_max_attempts: 3,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 30_000,
        }
    }
}

impl RunConfig {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Parse config content (key=value format).
    fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());
            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "max_iterations" => self.max_iterations = Self::parse_int(key, value)?,
            "model" => self.model = value.to_string(),
            "planner_model" => self.planner_model = Self::non_empty(value),
            "executor_model" => self.executor_model = Self::non_empty(value),
            "verifier_model" => self.verifier_model = Self::non_empty(value),
            "specialists" => {
                self.specialists = value.split_whitespace().map(String::from).collect();
            }
            "base_branch" => self.base_branch = Self::non_empty(value),
            "retry_max_attempts" => self.retry_max_attempts = Self::parse_int(key, value)?,
            "retry_base_delay_ms" => self.retry_base_delay_ms = Self::parse_int(key, value)?,
            "retry_max_delay_ms" => self.retry_max_delay_ms = Self::parse_int(key, value)?,
            _ => {
                // Warn but don't fail for unknown keys.
                eprintln!("Warning: unknown config key: {key}");
            }
        }
        Ok(())
    }

    fn non_empty(value: &str) -> Option<String> {
        if value.is_empty() {
            None
        } else {
            Some(value.to_string())
        }
    }

    fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Model to use for a given agent role.
    pub fn model_for(&self, role: &str) -> &str {
        let override_model = match role {
            "planner" => self.planner_model.as_deref(),
            "executor" => self.executor_model.as_deref(),
            "verifier" => self.verifier_model.as_deref(),
            _ => None,
        };
        override_model.unwrap_or(&self.model)
    }
}
