#![cfg(unix)]

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tempfile::TempDir;

use synthbench::config::{BackendConfig, Config, Provider, SandboxConfig};
use synthbench::error::BackendError;
use synthbench::llm::{Slot, TestGenerator};
use synthbench::testgen::{SandboxExecutor, SourceUnit};
use synthbench::{run_test_synthesis, run_with_slots, Classification, Winner};

const SOURCE: &str = "def add(a, b):\n    return a + b\n";

// Stands in for pytest: the verdict is keyed off markers in the generated file.
const RUNNER: &str = r#"
grep -q "test_module = __import__('calc')" %TEST% || { echo "bad header"; exit 4; }
test -f calc.py || { echo "source missing"; exit 4; }
pwd
if grep -q RESULT_PASS %TEST%; then echo "3 passed in 0.01s"; exit 0; fi
if grep -q RESULT_PARTIAL %TEST%; then echo "1 failed, 2 passed in 0.02s"; exit 1; fi
if grep -q "def test_module_import" %TEST%; then echo "1 passed in 0.01s"; exit 0; fi
echo "no tests ran"; exit 5
"#;

const PASSING: &str = "\
Here you go:

```python
import pytest
import calc

def test_add():
    assert calc.add(1, 2) == 3  # RESULT_PASS
```
";

const PARTIAL: &str = "\
def test_add():
    assert test_module.add(1, 2) == 3

def test_add_wrong():
    assert test_module.add(1, 1) == 3  # RESULT_PARTIAL
";

struct Fake {
    name: &'static str,
    timeout: Duration,
    delay: Duration,
    reply: Result<&'static str, BackendError>,
}

impl TestGenerator for Fake {
    fn name(&self) -> &str {
        self.name
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn generate(&self, unit: &SourceUnit) -> Result<String, BackendError> {
        assert_eq!(unit.module(), "calc");
        thread::sleep(self.delay);
        self.reply.clone().map(str::to_string)
    }
}

fn fake(name: &'static str, reply: Result<&'static str, BackendError>) -> Slot {
    Slot::Ready(Arc::new(Fake {
        name,
        timeout: Duration::from_secs(5),
        delay: Duration::ZERO,
        reply,
    }))
}

fn source_file() -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("calc.py");
    fs::write(&path, SOURCE).unwrap();
    (dir, path)
}

fn executor() -> SandboxExecutor {
    SandboxExecutor::new(
        vec!["sh".into(), "-c".into(), RUNNER.into()],
        Duration::from_secs(10),
    )
}

fn classes(report: &synthbench::ComparisonReport) -> Vec<Classification> {
    report.entries.iter().map(|e| e.classification).collect()
}

#[test]
fn all_succeed_is_a_tie() {
    let (_dir, path) = source_file();
    let slots = vec![
        fake("a", Ok(PASSING)),
        fake("b", Ok(PASSING)),
        fake("c", Ok(PASSING)),
    ];

    let report = run_with_slots(&path, &slots, &executor()).unwrap();

    assert_eq!(classes(&report), vec![Classification::Success; 3]);
    assert_eq!(
        report.winner,
        Winner::Tie(vec!["a".into(), "b".into(), "c".into()])
    );
}

#[test]
fn total_failure_still_returns_a_report() {
    let (_dir, path) = source_file();
    let slots = vec![
        fake("a", Err(BackendError::Auth("HTTP 401".into()))),
        fake("b", Err(BackendError::Network("connection reset".into()))),
        fake("c", Err(BackendError::Malformed("no choices".into()))),
    ];

    let report = run_with_slots(&path, &slots, &executor()).unwrap();

    assert_eq!(classes(&report), vec![Classification::Error; 3]);
    assert_eq!(report.winner, Winner::None);
    assert_eq!(report.candidates_produced, 0);

    let text = report.to_string();
    assert!(text.contains("All backends failed to generate"));
    assert!(text.contains("Winner: none"));
}

#[test]
fn mixed_outcome_picks_the_passing_backend() {
    let (_dir, path) = source_file();
    let slots = vec![
        fake("a", Ok(PASSING)),
        fake("b", Ok(PARTIAL)),
        Slot::Ready(Arc::new(Fake {
            name: "c",
            timeout: Duration::from_millis(200),
            delay: Duration::from_secs(3),
            reply: Ok(PASSING),
        })),
    ];

    let report = run_with_slots(&path, &slots, &executor()).unwrap();

    assert_eq!(
        classes(&report),
        vec![
            Classification::Success,
            Classification::Partial,
            Classification::Error
        ]
    );
    assert_eq!(report.winner, Winner::Single("a".into()));
    assert!(report.entry("c").unwrap().detail.contains("timed out"));
}

#[test]
fn prose_only_backend_runs_the_fallback_test() {
    let (_dir, path) = source_file();
    let slots = vec![fake(
        "chatty",
        Ok("I would test the add function with positive and negative numbers."),
    )];

    let report = run_with_slots(&path, &slots, &executor()).unwrap();

    assert_eq!(classes(&report), vec![Classification::Success]);
    assert_eq!(report.winner, Winner::Single("chatty".into()));
}

#[test]
fn sandboxes_are_disjoint_and_removed() {
    let (_dir, path) = source_file();
    let slots = vec![
        fake("a", Ok(PASSING)),
        fake("b", Ok(PARTIAL)),
        fake("c", Ok("nothing useful")),
    ];

    let report = run_with_slots(&path, &slots, &executor()).unwrap();

    let workdirs: Vec<&str> = report
        .entries
        .iter()
        .map(|e| e.stdout_excerpt.lines().next().unwrap())
        .collect();

    assert_eq!(workdirs.iter().collect::<HashSet<_>>().len(), 3);
    for dir in workdirs {
        assert!(dir.contains("synthbench-"), "{dir}");
        assert!(!Path::new(dir).exists(), "{dir} was left behind");
    }
}

#[test]
fn broken_runner_is_an_error_entry_not_a_crash() {
    let (_dir, path) = source_file();
    let executor = SandboxExecutor::new(
        vec!["synthbench-no-such-pytest".into()],
        Duration::from_secs(5),
    );

    let report = run_with_slots(&path, &[fake("a", Ok(PASSING))], &executor).unwrap();

    assert_eq!(classes(&report), vec![Classification::Error]);
    assert!(report.entries[0].detail.starts_with("sandbox failure:"));
    assert_eq!(report.winner, Winner::None);
}

#[test]
fn end_to_end_from_config_with_command_backends() {
    let (_dir, path) = source_file();

    let command = |name: &str, script: &str| BackendConfig {
        name: name.into(),
        provider: Some(Provider::Command),
        timeout_secs: Some(10),
        command: Some(vec!["sh".into(), "-c".into(), script.into()]),
        ..Default::default()
    };

    let config = Config {
        sandbox: SandboxConfig {
            runner: vec!["sh".into(), "-c".into(), RUNNER.into()],
            timeout_secs: 10,
        },
        backends: vec![
            command(
                "script",
                "cat >/dev/null; printf 'def test_add():\\n    assert test_module.add(2, 2) == 4  # RESULT_PASS\\n'",
            ),
            command("broken", "cat >/dev/null; echo 'quota exceeded' >&2; exit 1"),
            BackendConfig {
                name: "gpt".into(),
                provider: Some(Provider::OpenAI),
                ..Default::default()
            },
        ],
    };

    let report = run_test_synthesis(&path, &config).unwrap();

    assert_eq!(
        classes(&report),
        vec![
            Classification::Success,
            Classification::Error,
            Classification::Error
        ]
    );
    assert!(report.entry("broken").unwrap().detail.contains("quota exceeded"));
    assert!(report
        .entry("gpt")
        .unwrap()
        .detail
        .contains("missing configuration"));
    assert_eq!(report.winner, Winner::Single("script".into()));

    let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
    assert_eq!(json["entries"].as_array().unwrap().len(), 3);
}
