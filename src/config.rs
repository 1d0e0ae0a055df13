//! Run configuration loaded from a TOML file.
//!
//! Every field has a default so an empty file (or no file) is a valid
//! rules-only run with the schema gate enabled.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposerMode {
    #[default]
    Rules,
    Model,
}

impl ProposerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposerMode::Rules => "rules",
            ProposerMode::Model => "model",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProposerConfig {
    pub mode: ProposerMode,
    pub endpoint: Option<String>,
    pub model: String,
    /// Name of the environment variable holding the bearer token.
    pub api_key_env: String,
    pub timeout_seconds: u64,
    pub retries: u32,
    pub backoff_base_ms: u64,
}

impl Default for ProposerConfig {
    fn default() -> Self {
        Self {
            mode: ProposerMode::Rules,
            endpoint: None,
            model: "proposer-model".to_string(),
            api_key_env: "KUBEFIX_API_KEY".to_string(),
            timeout_seconds: 60,
            retries: 2,
            backoff_base_ms: 500,
        }
    }
}

impl ProposerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    pub schema_gate: bool,
    pub kubectl_cmd: String,
    pub dry_run_timeout_seconds: u64,
    pub enable_rescan: bool,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            schema_gate: true,
            kubectl_cmd: "kubectl".to_string(),
            dry_run_timeout_seconds: 30,
            enable_rescan: false,
        }
    }
}

impl VerifierConfig {
    pub fn dry_run_timeout(&self) -> Duration {
        Duration::from_secs(self.dry_run_timeout_seconds)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuidanceConfig {
    pub index_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub max_attempts: u32,
    pub jobs: usize,
    pub proposer: ProposerConfig,
    pub verifier: VerifierConfig,
    pub guidance: GuidanceConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            jobs: 4,
            proposer: ProposerConfig::default(),
            verifier: VerifierConfig::default(),
            guidance: GuidanceConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("max_attempts must be at least 1")]
    ZeroAttempts,
    #[error("jobs must be at least 1")]
    ZeroJobs,
    #[error("proposer mode 'model' requires proposer.endpoint")]
    MissingEndpoint,
    #[error("environment variable {0} is not set")]
    MissingApiKey(String),
}

impl RunConfig {
    /// Parse and validate a TOML run file. Relative guidance paths resolve
    /// against the file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let mut config: RunConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        if let (Some(index), Some(dir)) = (config.guidance.index_path.as_mut(), path.parent()) {
            if index.is_relative() {
                *index = dir.join(&*index);
            }
        }
        config
            .validate()
            .with_context(|| format!("Invalid config {}", path.display()))?;
        Ok(config)
    }

    /// Load `path` when given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        if self.jobs == 0 {
            return Err(ConfigError::ZeroJobs);
        }
        let has_endpoint = self
            .proposer
            .endpoint
            .as_deref()
            .is_some_and(|e| !e.trim().is_empty());
        if self.proposer.mode == ProposerMode::Model && !has_endpoint {
            return Err(ConfigError::MissingEndpoint);
        }
        Ok(())
    }

    /// The bearer token for model mode, read from the configured variable.
    pub fn resolve_api_key(&self) -> Result<Option<String>, ConfigError> {
        if self.proposer.mode != ProposerMode::Model {
            return Ok(None);
        }
        match std::env::var(&self.proposer.api_key_env) {
            Ok(key) if !key.trim().is_empty() => Ok(Some(key)),
            _ => Err(ConfigError::MissingApiKey(self.proposer.api_key_env.clone())),
        }
    }
}
