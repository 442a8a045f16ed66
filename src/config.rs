use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Deserialize)]
#[serde(from = "RawConfig")]
pub struct Config {
    pub sandbox: SandboxConfig,
    pub backends: Vec<BackendConfig>,
}

/// Backends are kept as plain tables at first so that one bad entry
/// cannot fail the whole file.
#[derive(Deserialize)]
struct RawConfig {
    sandbox: SandboxConfig,
    #[serde(default)]
    backends: Vec<toml::Table>,
}

impl From<RawConfig> for Config {
    fn from(raw: RawConfig) -> Self {
        Config {
            sandbox: raw.sandbox,
            backends: raw
                .backends
                .into_iter()
                .enumerate()
                .map(|(i, table)| BackendConfig::from_table(i, table))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SandboxConfig {
    /// Runner argv. `%TEST%`, `%SOURCE%` and `%DIR%` are substituted per run.
    pub runner: Vec<String>,
    pub timeout_secs: u64,
}

impl SandboxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAI,
    Anthropic,
    Gemini,
    Ollama,
    Command,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAI => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Gemini => "gemini",
            Provider::Ollama => "ollama",
            Provider::Command => "command",
        }
    }
}

/// One `[[backends]]` entry.
///
/// Everything except `name` is optional at parse time. Which fields are
/// required depends on the provider and is checked when the backend is
/// built, so a half-configured backend fails on its own instead of
/// taking the whole run down.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    pub provider: Option<Provider>,
    pub model: Option<String>,
    /// Name of the environment variable holding the API key.
    pub api_key_env: Option<String>,
    pub base_url: Option<String>,
    pub timeout_secs: Option<u64>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// argv for the `command` provider.
    pub command: Option<Vec<String>>,
    /// Why the entry could not be read, if it could not.
    #[serde(skip)]
    pub invalid: Option<String>,
}

impl BackendConfig {
    /// Typed view of one `[[backends]]` table. A table that does not fit
    /// (unknown provider, wrong value type) is kept with `invalid` set and
    /// as much of a name as can be recovered.
    fn from_table(index: usize, table: toml::Table) -> Self {
        let name = table
            .get("name")
            .and_then(toml::Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| format!("backend-{}", index + 1));

        match toml::Value::Table(table).try_into::<BackendConfig>() {
            Ok(cfg) => cfg,
            Err(e) => BackendConfig {
                name,
                invalid: Some(e.to_string().trim().to_string()),
                ..Default::default()
            },
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let cfg: Config = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sandbox.runner.is_empty() || self.sandbox.runner[0].trim().is_empty() {
            return Err(ConfigError::EmptyRunner);
        }
        if self.sandbox.timeout_secs == 0 {
            return Err(ConfigError::ZeroSandboxTimeout);
        }
        if self.backends.is_empty() {
            return Err(ConfigError::NoBackends);
        }

        let mut seen = HashSet::new();
        for b in &self.backends {
            if !seen.insert(b.name.as_str()) {
                return Err(ConfigError::DuplicateBackend(b.name.clone()));
            }
        }

        Ok(())
    }
}

pub fn default_config_path() -> PathBuf {
    let mut dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    dir.push("synthbench");
    dir.push("config.toml");
    dir
}
