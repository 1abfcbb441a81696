//! Application configuration.
//!
//! Layers, later wins: compiled defaults, an optional TOML file, then
//! environment variables. CLI flags are applied by `main` on top.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use consensus::{ActivityBusConfig, PipelineConfig};
use serde::{Deserialize, Serialize};

pub const DEFAULT_BIND: &str = "127.0.0.1:3000";
pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
/// Upload cap for the analyze route (512 MiB).
pub const DEFAULT_BODY_LIMIT: usize = 512 * 1024 * 1024;

/// Deployment environment. Production hides internal error detail and
/// disables the dev emit route.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl Environment {
    pub fn is_production(self) -> bool {
        self == Self::Production
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Development => f.write_str("development"),
            Self::Production => f.write_str("production"),
        }
    }
}

impl FromStr for Environment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            other => anyhow::bail!("unknown environment '{other}'"),
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub environment: Environment,
    /// Interval between SSE keep-alive comments.
    pub keep_alive_secs: u64,
    pub body_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            environment: Environment::Development,
            keep_alive_secs: 25,
            body_limit: DEFAULT_BODY_LIMIT,
        }
    }
}

impl ServerConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs.max(1))
    }
}

/// Gemini endpoint and credentials.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeminiConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    /// Polls while waiting for an uploaded file to become active.
    pub max_state_polls: u32,
    pub poll_interval_ms: u64,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_GEMINI_BASE_URL.to_string(),
            max_state_polls: 60,
            poll_interval_ms: 1000,
        }
    }
}

impl fmt::Debug for GeminiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeminiConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("max_state_polls", &self.max_state_polls)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .finish()
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub gemini: GeminiConfig,
    pub pipeline: PipelineConfig,
    pub bus: ActivityBusConfig,
}

impl AppConfig {
    /// Defaults, then `path` if given, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Apply environment overrides through `lookup` (injectable for tests).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = non_empty("GEMINI_API_KEY") {
            self.gemini.api_key = Some(key);
        }
        if let Some(url) = non_empty("GEMINI_BASE_URL") {
            self.gemini.base_url = url;
        }
        if let Some(bind) = non_empty("VIDPROMPT_BIND") {
            self.server.bind = bind;
        }
        if let Some(env) = non_empty("VIDPROMPT_ENV") {
            self.server.environment = env.parse().context("Invalid VIDPROMPT_ENV")?;
        }
        if let Some(model) = non_empty("VIDPROMPT_GENERATOR_MODEL") {
            self.pipeline.generator_model = model;
        }
        if let Some(model) = non_empty("VIDPROMPT_EVALUATOR_MODEL") {
            self.pipeline.evaluator_model = model;
        }
        Ok(())
    }

    /// Fail fast on settings the service cannot start with.
    pub fn validate(&self) -> Result<()> {
        self.pipeline
            .validate()
            .context("Invalid [pipeline] section")?;
        anyhow::ensure!(self.bus.max_events_per_run > 0, "bus.max_events_per_run must be positive");
        anyhow::ensure!(self.server.body_limit > 0, "server.body_limit must be positive");
        Ok(())
    }
}
