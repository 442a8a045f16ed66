use std::process::Command;
use std::time::Duration;

use crate::error::BackendError;
use crate::llm::prompt::LlmPrompt;
use crate::process::{run_captured, ProcessError};

/// Local generator: any program that reads a prompt on stdin and writes
/// test code on stdout (an `ollama run` wrapper, a script, a fixture).
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    argv: Vec<String>,
    model: Option<String>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
}

impl CommandGenerator {
    pub fn new(
        argv: Vec<String>,
        model: Option<String>,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
    ) -> Self {
        Self {
            argv,
            model,
            max_tokens,
            temperature,
        }
    }

    /// Runs the command, killing it if it outlives `timeout`.
    pub fn run(&self, prompt: &LlmPrompt, timeout: Duration) -> Result<String, BackendError> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| BackendError::Config("command is empty".into()))?;

        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(model) = &self.model {
            cmd.env("SYNTHBENCH_MODEL", model);
        }
        if let Some(max) = self.max_tokens {
            cmd.env("SYNTHBENCH_MAX_TOKENS", max.to_string());
        }
        if let Some(t) = self.temperature {
            cmd.env("SYNTHBENCH_TEMPERATURE", t.to_string());
        }

        let out = run_captured(cmd, Some(prompt.flattened()), timeout, Duration::from_millis(500))
            .map_err(|e| match e {
                ProcessError::Spawn(e) => {
                    BackendError::Config(format!("cannot start `{program}`: {e}"))
                }
                ProcessError::Wait(e) => BackendError::Network(e.to_string()),
            })?;

        if out.timed_out {
            return Err(BackendError::Network(format!(
                "`{program}` did not finish within {}s",
                timeout.as_secs_f32()
            )));
        }

        if out.exit_code != 0 {
            let stderr = out.stderr.trim();
            return Err(BackendError::Rejected(format!(
                "`{program}` exited with {}: {}",
                out.exit_code,
                if stderr.is_empty() { "<no stderr>" } else { stderr }
            )));
        }

        let text = out.stdout.trim();
        if text.is_empty() {
            return Err(BackendError::Malformed("command produced no output".into()));
        }

        Ok(text.to_string())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn prompt() -> LlmPrompt {
        LlmPrompt {
            system: "SYS".into(),
            user: "USER".into(),
        }
    }

    fn sh(script: &str) -> CommandGenerator {
        CommandGenerator::new(
            vec!["sh".into(), "-c".into(), script.into()],
            Some("tiny".into()),
            Some(128),
            Some(0.2),
        )
    }

    #[test]
    fn prompt_goes_in_on_stdin() {
        let text = sh("cat").run(&prompt(), Duration::from_secs(5)).unwrap();
        assert_eq!(text, "SYS\n\nUSER");
    }

    #[test]
    fn knobs_are_exported_as_env() {
        let text = sh("echo $SYNTHBENCH_MODEL $SYNTHBENCH_MAX_TOKENS $SYNTHBENCH_TEMPERATURE")
            .run(&prompt(), Duration::from_secs(5))
            .unwrap();
        assert_eq!(text, "tiny 128 0.2");
    }

    #[test]
    fn non_zero_exit_is_a_rejection() {
        let err = sh("echo nope >&2; exit 4")
            .run(&prompt(), Duration::from_secs(5))
            .unwrap_err();
        assert_eq!(
            err,
            BackendError::Rejected("`sh` exited with 4: nope".into())
        );
    }

    #[test]
    fn empty_output_is_malformed() {
        let err = sh("true").run(&prompt(), Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, BackendError::Malformed(_)));
    }

    #[test]
    fn missing_program_is_a_config_error() {
        let gen = CommandGenerator::new(vec!["synthbench-missing-xyz".into()], None, None, None);
        let err = gen.run(&prompt(), Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, BackendError::Config(_)));
    }

    #[test]
    fn slow_command_is_killed() {
        let err = sh("exec sleep 5")
            .run(&prompt(), Duration::from_millis(200))
            .unwrap_err();
        assert!(matches!(err, BackendError::Network(_)));
    }
}
