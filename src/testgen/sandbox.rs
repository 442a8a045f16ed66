// Runs one candidate test module in a throwaway directory.
// A failing test run is a normal result; only infrastructure trouble is an error.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use serde::Serialize;

use crate::config::SandboxConfig;
use crate::error::SandboxError;
use crate::process::{run_captured, ProcessError};
use crate::testgen::normalize::NormalizedCandidate;
use crate::testgen::source::SourceUnit;

const DEFAULT_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxResult {
    pub backend: String,
    /// `-1` when the runner was killed or ended by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
    /// Where the run happened. Already removed when the result is returned.
    #[serde(skip)]
    pub workdir: PathBuf,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

#[derive(Debug, Clone)]
pub struct SandboxExecutor {
    runner: Vec<String>,
    timeout: Duration,
    grace: Duration,
}

impl SandboxExecutor {
    pub fn new(runner: Vec<String>, timeout: Duration) -> Self {
        Self {
            runner,
            timeout,
            grace: DEFAULT_GRACE,
        }
    }

    pub fn from_config(cfg: &SandboxConfig) -> Self {
        Self::new(cfg.runner.clone(), cfg.timeout())
    }

    /// How long to keep draining output pipes after the runner is gone.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn execute(
        &self,
        source: &SourceUnit,
        candidate: &NormalizedCandidate,
    ) -> Result<SandboxResult, SandboxError> {
        // Dropping `dir` removes it, whichever way we leave this function.
        let dir = tempfile::Builder::new()
            .prefix(&format!("synthbench-{}-", sanitize(&candidate.backend)))
            .tempdir()
            .map_err(SandboxError::CreateDir)?;
        let workdir = dir.path().to_path_buf();

        let test_name = test_file_name(source.module());
        write_file(&workdir.join(source.file_name()), source.text())?;
        write_file(&workdir.join(&test_name), &candidate.test_source)?;

        let argv = expand_command(&self.runner, &test_name, source.file_name(), &workdir);
        let (program, args) = argv.split_first().ok_or(SandboxError::EmptyCommand)?;

        log::debug!(
            "[{}] running `{}` in {}",
            candidate.backend,
            argv.join(" "),
            workdir.display()
        );

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&workdir)
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .env("PYTHONPATH", &workdir);

        let run = run_captured(cmd, None, self.timeout, self.grace).map_err(|e| match e {
            ProcessError::Spawn(source) => SandboxError::Spawn {
                program: program.clone(),
                workdir: workdir.clone(),
                source,
            },
            ProcessError::Wait(e) => SandboxError::Wait(e),
        })?;

        if run.timed_out {
            log::warn!(
                "[{}] runner killed after {:.1}s",
                candidate.backend,
                self.timeout.as_secs_f32()
            );
        } else {
            log::info!(
                "[{}] runner exited with {} in {:.2}s",
                candidate.backend,
                run.exit_code,
                run.duration.as_secs_f32()
            );
        }

        if let Err(e) = dir.close() {
            log::warn!("failed to remove {}: {e}", workdir.display());
        }

        Ok(SandboxResult {
            backend: candidate.backend.clone(),
            exit_code: run.exit_code,
            stdout: run.stdout,
            stderr: run.stderr,
            timed_out: run.timed_out,
            duration: run.duration,
            workdir,
        })
    }
}

pub fn test_file_name(module: &str) -> String {
    format!("test_{module}.py")
}

fn write_file(path: &Path, content: &str) -> Result<(), SandboxError> {
    fs::write(path, content).map_err(|source| SandboxError::WriteFile {
        path: path.to_path_buf(),
        source,
    })
}

/// Substitutes `%TEST%`, `%SOURCE%` and `%DIR%` in every argument.
fn expand_command(template: &[String], test: &str, source: &str, dir: &Path) -> Vec<String> {
    let dir = dir.to_string_lossy();
    template
        .iter()
        .map(|arg| {
            arg.replace("%TEST%", test)
                .replace("%SOURCE%", source)
                .replace("%DIR%", &dir)
        })
        .collect()
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::thread;
    use std::time::Instant;

    const SOURCE: &str = "def add(a, b):\n    return a + b\n";

    fn unit() -> SourceUnit {
        SourceUnit::new("/somewhere/calc.py", SOURCE)
    }

    fn candidate(backend: &str, body: &str) -> NormalizedCandidate {
        NormalizedCandidate {
            backend: backend.into(),
            test_source: body.into(),
        }
    }

    fn sh(script: &str, timeout: Duration) -> SandboxExecutor {
        SandboxExecutor::new(vec!["sh".into(), "-c".into(), script.into()], timeout)
    }

    #[test]
    fn materializes_source_and_test_side_by_side() {
        let exec = sh("ls; cat %TEST%", Duration::from_secs(10));
        let res = exec.execute(&unit(), &candidate("gpt", "# marker-gpt\n")).unwrap();

        assert_eq!(res.exit_code, 0);
        assert!(!res.timed_out);
        assert!(res.stdout.contains("calc.py"));
        assert!(res.stdout.contains("test_calc.py"));
        assert!(res.stdout.contains("# marker-gpt"));
        assert!(!res.workdir.exists());
    }

    #[test]
    fn source_copy_is_exact() {
        let exec = sh("cat %SOURCE%", Duration::from_secs(10));
        let res = exec.execute(&unit(), &candidate("a", "")).unwrap();
        assert_eq!(res.stdout, SOURCE);
    }

    #[test]
    fn non_zero_exit_is_a_normal_result() {
        let exec = sh("echo out; echo err >&2; exit 3", Duration::from_secs(10));
        let res = exec.execute(&unit(), &candidate("a", "")).unwrap();

        assert_eq!(res.exit_code, 3);
        assert_eq!(res.stdout, "out\n");
        assert_eq!(res.stderr, "err\n");
        assert!(!res.timed_out);
        assert!(!res.workdir.exists());
    }

    #[test]
    fn timeout_kills_runner_and_keeps_partial_output() {
        let exec = sh("echo started; exec sleep 5", Duration::from_millis(300));
        let started = Instant::now();
        let res = exec.execute(&unit(), &candidate("slow", "")).unwrap();

        assert!(res.timed_out);
        assert_eq!(res.exit_code, -1);
        assert_eq!(res.stdout, "started\n");
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(!res.workdir.exists());
    }

    #[test]
    fn spawn_failure_is_an_error_and_still_cleans_up() {
        let exec = SandboxExecutor::new(
            vec!["synthbench-no-such-runner-xyz".into()],
            Duration::from_secs(1),
        );

        match exec.execute(&unit(), &candidate("a", "")) {
            Err(SandboxError::Spawn { workdir, program, .. }) => {
                assert_eq!(program, "synthbench-no-such-runner-xyz");
                assert!(!workdir.exists());
            }
            other => panic!("expected spawn error, got {other:?}"),
        }
    }

    #[test]
    fn empty_runner_is_an_error() {
        let exec = SandboxExecutor::new(Vec::new(), Duration::from_secs(1));
        assert!(matches!(
            exec.execute(&unit(), &candidate("a", "")),
            Err(SandboxError::EmptyCommand)
        ));
    }

    #[test]
    fn concurrent_runs_use_disjoint_directories() {
        let exec = sh("sleep 0.2; cat %TEST%", Duration::from_secs(10));
        let source = unit();

        let (a, b) = thread::scope(|s| {
            let a = s.spawn(|| exec.execute(&source, &candidate("a", "marker-a\n")));
            let b = s.spawn(|| exec.execute(&source, &candidate("b", "marker-b\n")));
            (a.join().unwrap().unwrap(), b.join().unwrap().unwrap())
        });

        assert_ne!(a.workdir, b.workdir);
        assert_eq!(a.stdout, "marker-a\n");
        assert_eq!(b.stdout, "marker-b\n");
    }

    #[test]
    fn placeholders_are_expanded_per_argument() {
        let argv = expand_command(
            &["run".into(), "%TEST%".into(), "--src=%SOURCE%".into(), "%DIR%/x".into()],
            "test_m.py",
            "m.py",
            Path::new("/tmp/box"),
        );
        assert_eq!(argv, vec!["run", "test_m.py", "--src=m.py", "/tmp/box/x"]);
    }

    #[test]
    fn backend_names_are_safe_in_directory_prefix() {
        assert_eq!(sanitize("gpt-4o/mini v2"), "gpt-4o_mini_v2");
    }
}
