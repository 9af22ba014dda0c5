//! Campaign settings, read from the `[fuzz]` table of a TOML file.
//!
//! ```toml
//! [fuzz]
//! execution_timeout_secs = 5
//! mutants_per_seed = 500
//! blacklist_file = "blacklist.txt"
//! ```
//!
//! Every key is optional.

use serde::Deserialize;
use slog::Level;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::session::SessionSettings;
use crate::supervisor::SupervisorSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("unknown log level `{0}`")]
    LogLevel(String),
    #[error("{0} must be positive")]
    NotPositive(&'static str),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FuzzConfig {
    /// Execution time granted to a single call, before retry scaling.
    pub execution_timeout_secs: u64,
    pub mutants_per_seed: usize,
    /// Failed executions tolerated per seed before it is abandoned.
    pub max_attempts: u32,
    /// Assistant rounds per seed. Zero disables the adaptive loop.
    pub llm_fuzz_per_seed: usize,
    pub max_proposal_retries: usize,
    pub learning_rate: f64,
    pub temperature: f64,
    pub poll_interval_ms: u64,
    pub grace_period_ms: u64,
    pub cpu_ceiling_percent: Option<f64>,
    pub memory_ceiling_bytes: Option<u64>,
    pub capture_output: bool,
    /// Fixed initial generator state. Seeded from the clock when absent.
    pub master_seed: Option<u64>,
    pub blacklist: Vec<String>,
    /// File with one blacklisted target per line.
    pub blacklist_file: Option<PathBuf>,
    pub artifacts_dir: PathBuf,
    pub log_level: String,
}

impl Default for FuzzConfig {
    fn default() -> Self {
        Self {
            execution_timeout_secs: 10,
            mutants_per_seed: 1000,
            max_attempts: 3,
            llm_fuzz_per_seed: 0,
            max_proposal_retries: 3,
            learning_rate: 0.1,
            temperature: 1.0,
            poll_interval_ms: 10,
            grace_period_ms: 200,
            cpu_ceiling_percent: Some(150.0),
            memory_ceiling_bytes: None,
            capture_output: false,
            master_seed: None,
            blacklist: Vec::new(),
            blacklist_file: None,
            artifacts_dir: PathBuf::from("artifacts"),
            log_level: "info".to_string(),
        }
    }
}

#[derive(Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    fuzz: FuzzConfig,
}

impl FromStr for FuzzConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(s)?;
        file.fuzz.validate()?;
        Ok(file.fuzz)
    }
}

impl FuzzConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        text.parse()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.execution_timeout_secs == 0 {
            return Err(ConfigError::NotPositive("execution_timeout_secs"));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::NotPositive("max_attempts"));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::NotPositive("poll_interval_ms"));
        }
        if self.temperature <= 0.0 {
            return Err(ConfigError::NotPositive("temperature"));
        }
        self.log_level()?;
        Ok(())
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    pub fn log_level(&self) -> Result<Level, ConfigError> {
        // slog has no `Off` level; its parser would panic on the name.
        if self.log_level.eq_ignore_ascii_case("off") {
            return Err(ConfigError::LogLevel(self.log_level.clone()));
        }
        Level::from_str(&self.log_level).map_err(|_| ConfigError::LogLevel(self.log_level.clone()))
    }

    /// Inline blacklist entries merged with the blacklist file, if any.
    pub fn blacklist(&self) -> Result<HashSet<String>, ConfigError> {
        let mut names: HashSet<String> = self.blacklist.iter().cloned().collect();
        if let Some(path) = &self.blacklist_file {
            let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
            names.extend(
                text.lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(String::from),
            );
        }
        Ok(names)
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            mutants_per_seed: self.mutants_per_seed,
            max_attempts: self.max_attempts,
            execution_timeout: self.execution_timeout(),
        }
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            grace_period: Duration::from_millis(self.grace_period_ms),
            cpu_ceiling_percent: self.cpu_ceiling_percent,
            memory_ceiling_bytes: self.memory_ceiling_bytes,
        }
    }
}
