use std::sync::Arc;
use std::time::Duration;

use crate::config::{BackendConfig, Provider};
use crate::error::BackendError;
use crate::llm::client::{HttpProvider, LlmClient};
use crate::llm::command::CommandGenerator;
use crate::llm::prompt::build_prompt;
use crate::testgen::source::SourceUnit;

/// Something that turns a source file into raw test code.
///
/// The orchestrator only sees this trait. It enforces `timeout` itself,
/// so implementations may block for as long as they like.
pub trait TestGenerator: Send + Sync {
    fn name(&self) -> &str;
    fn timeout(&self) -> Duration;
    fn generate(&self, unit: &SourceUnit) -> Result<String, BackendError>;
}

#[derive(Debug, Clone)]
pub enum LlmBackend {
    Remote {
        name: String,
        timeout: Duration,
        client: LlmClient,
    },
    Command {
        name: String,
        timeout: Duration,
        runner: CommandGenerator,
    },
}

impl LlmBackend {
    /// Builds a backend from its config entry. Anything missing is a
    /// `BackendError::Config`; nothing falls back to a built-in default.
    pub fn from_config(cfg: &BackendConfig) -> Result<Self, BackendError> {
        if let Some(reason) = &cfg.invalid {
            return Err(BackendError::Config(format!(
                "invalid backend entry: {reason}"
            )));
        }

        let provider = cfg
            .provider
            .ok_or_else(|| BackendError::Config("`provider` is not set".into()))?;

        let timeout = match cfg.timeout_secs {
            Some(0) => {
                return Err(BackendError::Config(
                    "`timeout_secs` must be greater than zero".into(),
                ))
            }
            Some(secs) => Duration::from_secs(secs),
            None => return Err(missing("timeout_secs", provider)),
        };

        let http = match provider {
            Provider::OpenAI => HttpProvider::OpenAI,
            Provider::Anthropic => HttpProvider::Anthropic,
            Provider::Gemini => HttpProvider::Gemini,
            Provider::Ollama => HttpProvider::Ollama,
            Provider::Command => {
                let argv = cfg
                    .command
                    .clone()
                    .filter(|argv| argv.first().is_some_and(|p| !p.trim().is_empty()))
                    .ok_or_else(|| missing("command", provider))?;

                return Ok(LlmBackend::Command {
                    name: cfg.name.clone(),
                    timeout,
                    runner: CommandGenerator::new(
                        argv,
                        cfg.model.clone(),
                        cfg.max_tokens,
                        cfg.temperature,
                    ),
                });
            }
        };

        let model = cfg
            .model
            .clone()
            .filter(|m| !m.trim().is_empty())
            .ok_or_else(|| missing("model", provider))?;
        let max_tokens = cfg
            .max_tokens
            .filter(|n| *n > 0)
            .ok_or_else(|| missing("max_tokens", provider))?;
        let temperature = cfg
            .temperature
            .ok_or_else(|| missing("temperature", provider))?;

        let api_key = match http {
            HttpProvider::Ollama => None,
            _ => {
                let var = cfg
                    .api_key_env
                    .as_deref()
                    .ok_or_else(|| missing("api_key_env", provider))?;
                Some(check_key(var, std::env::var(var).ok())?)
            }
        };

        Ok(LlmBackend::Remote {
            name: cfg.name.clone(),
            timeout,
            client: LlmClient::new(
                http,
                model,
                api_key,
                cfg.base_url.clone(),
                max_tokens,
                temperature,
            ),
        })
    }
}

impl TestGenerator for LlmBackend {
    fn name(&self) -> &str {
        match self {
            LlmBackend::Remote { name, .. } | LlmBackend::Command { name, .. } => name,
        }
    }

    fn timeout(&self) -> Duration {
        match self {
            LlmBackend::Remote { timeout, .. } | LlmBackend::Command { timeout, .. } => *timeout,
        }
    }

    fn generate(&self, unit: &SourceUnit) -> Result<String, BackendError> {
        let prompt = build_prompt(unit);
        match self {
            LlmBackend::Remote {
                client, timeout, ..
            } => client.run(&prompt, *timeout),
            LlmBackend::Command {
                runner, timeout, ..
            } => runner.run(&prompt, *timeout),
        }
    }
}

fn missing(field: &str, provider: Provider) -> BackendError {
    BackendError::Config(format!(
        "`{field}` is required for provider `{}`",
        provider.as_str()
    ))
}

/// Rejects unset, blank and template placeholder keys
/// (`your_openai_api_key_here` and friends).
fn check_key(var: &str, value: Option<String>) -> Result<String, BackendError> {
    let value = value
        .ok_or_else(|| BackendError::Config(format!("environment variable {var} is not set")))?;
    let trimmed = value.trim();
    let lower = trimmed.to_ascii_lowercase();

    if trimmed.is_empty() {
        return Err(BackendError::Config(format!("{var} is empty")));
    }
    if lower.starts_with("your_") && lower.ends_with("_here") {
        return Err(BackendError::Config(format!("{var} still holds a placeholder")));
    }

    Ok(trimmed.to_string())
}

/// A configured backend as the orchestrator sees it.
#[derive(Clone)]
pub enum Slot {
    Ready(Arc<dyn TestGenerator>),
    /// Could not be built; reported as a failed attempt without running.
    Misconfigured { name: String, error: BackendError },
}

impl Slot {
    pub fn name(&self) -> &str {
        match self {
            Slot::Ready(gen) => gen.name(),
            Slot::Misconfigured { name, .. } => name,
        }
    }
}

pub fn build_roster(configs: &[BackendConfig]) -> Vec<Slot> {
    configs
        .iter()
        .map(|cfg| match LlmBackend::from_config(cfg) {
            Ok(backend) => Slot::Ready(Arc::new(backend)),
            Err(error) => {
                log::warn!("backend `{}` is misconfigured: {error}", cfg.name);
                Slot::Misconfigured {
                    name: cfg.name.clone(),
                    error,
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn openai() -> BackendConfig {
        BackendConfig {
            name: "gpt".into(),
            provider: Some(Provider::OpenAI),
            model: Some("gpt-4o-mini".into()),
            api_key_env: Some("SYNTHBENCH_TEST_UNSET_KEY_8f2c".into()),
            timeout_secs: Some(30),
            max_tokens: Some(2000),
            temperature: Some(0.3),
            ..Default::default()
        }
    }

    fn config_message(res: Result<LlmBackend, BackendError>) -> String {
        match res {
            Err(BackendError::Config(msg)) => msg,
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn missing_provider_and_timeout_are_config_errors() {
        let mut cfg = openai();
        cfg.provider = None;
        assert!(config_message(LlmBackend::from_config(&cfg)).contains("provider"));

        let mut cfg = openai();
        cfg.timeout_secs = None;
        assert!(config_message(LlmBackend::from_config(&cfg)).contains("timeout_secs"));

        cfg.timeout_secs = Some(0);
        assert!(config_message(LlmBackend::from_config(&cfg)).contains("greater than zero"));
    }

    #[test]
    fn http_providers_need_every_knob() {
        for strip in ["model", "max_tokens", "temperature", "api_key_env"] {
            let mut cfg = openai();
            match strip {
                "model" => cfg.model = None,
                "max_tokens" => cfg.max_tokens = None,
                "temperature" => cfg.temperature = None,
                _ => cfg.api_key_env = None,
            }
            let msg = config_message(LlmBackend::from_config(&cfg));
            assert!(msg.contains(strip), "{strip}: {msg}");
        }
    }

    #[test]
    fn unset_key_variable_is_reported_by_name() {
        let msg = config_message(LlmBackend::from_config(&openai()));
        assert_eq!(msg, "environment variable SYNTHBENCH_TEST_UNSET_KEY_8f2c is not set");
    }

    #[test]
    fn placeholder_and_blank_keys_are_rejected() {
        assert!(check_key("K", Some("your_openai_api_key_here".into())).is_err());
        assert!(check_key("K", Some("YOUR_GEMINI_KEY_HERE".into())).is_err());
        assert!(check_key("K", Some("   ".into())).is_err());
        assert_eq!(check_key("K", Some(" sk-abc \n".into())).unwrap(), "sk-abc");
    }

    #[test]
    fn ollama_needs_no_key() {
        let cfg = BackendConfig {
            name: "local".into(),
            provider: Some(Provider::Ollama),
            model: Some("llama3".into()),
            timeout_secs: Some(300),
            max_tokens: Some(4000),
            temperature: Some(0.3),
            ..Default::default()
        };
        let backend = LlmBackend::from_config(&cfg).unwrap();
        assert_eq!(backend.name(), "local");
        assert_eq!(backend.timeout(), Duration::from_secs(300));
        assert!(matches!(backend, LlmBackend::Remote { .. }));
    }

    #[test]
    fn command_provider_needs_a_program() {
        let mut cfg = BackendConfig {
            name: "script".into(),
            provider: Some(Provider::Command),
            timeout_secs: Some(5),
            command: Some(vec![]),
            ..Default::default()
        };
        assert!(config_message(LlmBackend::from_config(&cfg)).contains("command"));

        cfg.command = Some(vec!["./gen.sh".into()]);
        assert!(matches!(
            LlmBackend::from_config(&cfg),
            Ok(LlmBackend::Command { .. })
        ));
    }

    #[test]
    fn roster_keeps_order_and_marks_broken_entries() {
        let good = BackendConfig {
            name: "script".into(),
            provider: Some(Provider::Command),
            timeout_secs: Some(5),
            command: Some(vec!["cat".into()]),
            ..Default::default()
        };
        let roster = build_roster(&[openai(), good]);

        let names: Vec<_> = roster.iter().map(Slot::name).collect();
        assert_eq!(names, vec!["gpt", "script"]);
        assert!(matches!(&roster[0], Slot::Misconfigured { error: BackendError::Config(_), .. }));
        assert!(matches!(&roster[1], Slot::Ready(_)));
    }

    #[test]
    fn unreadable_entry_is_a_misconfigured_slot() {
        let raw = r#"
[sandbox]
runner = ["pytest", "%TEST%"]
timeout_secs = 10

[[backends]]
name = "typo"
provider = "bogus"
timeout_secs = 5

[[backends]]
name = "script"
provider = "command"
timeout_secs = 5
command = ["cat"]
"#;
        let cfg: crate::config::Config = toml::from_str(raw).unwrap();
        let roster = build_roster(&cfg.backends);

        assert_eq!(roster.len(), 2);
        match &roster[0] {
            Slot::Misconfigured {
                name,
                error: BackendError::Config(msg),
            } => {
                assert_eq!(name, "typo");
                assert!(msg.starts_with("invalid backend entry:"), "{msg}");
            }
            _ => panic!("expected a misconfigured slot"),
        }
        assert!(matches!(&roster[1], Slot::Ready(_)));
    }

    #[cfg(unix)]
    #[test]
    fn command_backend_generates_from_prompt() {
        let cfg = BackendConfig {
            name: "echo".into(),
            provider: Some(Provider::Command),
            timeout_secs: Some(5),
            command: Some(vec![
                "sh".into(),
                "-c".into(),
                "grep -q \"__import__('calc')\" && echo 'def test_ok(): pass'".into(),
            ]),
            ..Default::default()
        };
        let backend = LlmBackend::from_config(&cfg).unwrap();
        let unit = SourceUnit::new("calc.py", "def add(a, b):\n    return a + b\n");

        assert_eq!(backend.generate(&unit).unwrap(), "def test_ok(): pass");
    }
}
