// Comparison of per-backend sandbox outcomes.
// Everything here is a pure function of its inputs: same outcomes, same bytes.

use std::cmp::Ordering;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::error::AttemptFailure;
use crate::testgen::sandbox::SandboxResult;

const OUTPUT_LIMIT: usize = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Success,
    Partial,
    Error,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Success => "success",
            Classification::Partial => "partial",
            Classification::Error => "error",
        }
    }
}

/// Test outcome counts recovered from runner output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TestCounts {
    pub passed: usize,
    pub failed: usize,
    pub errors: usize,
}

impl TestCounts {
    /// Errors are failing evidence too.
    pub fn failing(&self) -> usize {
        self.failed + self.errors
    }

    pub fn total(&self) -> usize {
        self.passed + self.failing()
    }

    /// Reads counts from pytest output. The final summary line wins; without
    /// one, verbose `path::test PASSED` style markers are counted instead.
    pub fn parse(output: &str) -> Option<Self> {
        let clean = strip_ansi(output);

        if let Some(line) = clean.lines().filter(|l| summary_re().is_match(l)).last() {
            let mut c = TestCounts::default();
            for cap in count_re().captures_iter(line) {
                let n = cap[1].parse::<usize>().unwrap_or(0);
                match &cap[2] {
                    "passed" => c.passed += n,
                    "failed" => c.failed += n,
                    _ => c.errors += n,
                }
            }
            return Some(c);
        }

        let mut c = TestCounts::default();
        for cap in marker_re().captures_iter(&clean) {
            match &cap[1] {
                "PASSED" => c.passed += 1,
                "FAILED" => c.failed += 1,
                _ => c.errors += 1,
            }
        }

        (c.total() > 0).then_some(c)
    }
}

impl fmt::Display for TestCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} passed, {} failed, {} errors",
            self.passed, self.failed, self.errors
        )
    }
}

fn strip_ansi(s: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").expect("valid regex"))
        .replace_all(s, "")
        .into_owned()
}

fn summary_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b\d+ (?:passed|failed|errors?)\b.*\bin \d+(?:\.\d+)?s\b").expect("valid regex")
    })
}

fn count_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(\d+) (passed|failed|errors?)\b").expect("valid regex"))
}

fn marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"::\S+\s+(PASSED|FAILED|ERROR)\b").expect("valid regex"))
}

/// What happened to one backend, in whichever stage it stopped.
#[derive(Debug, Clone)]
pub enum Outcome {
    NotGenerated {
        backend: String,
        reason: AttemptFailure,
    },
    /// The sandbox itself broke (directory, spawn). Not a test failure.
    SandboxFailed { backend: String, reason: String },
    Executed(SandboxResult),
}

impl Outcome {
    pub fn backend(&self) -> &str {
        match self {
            Outcome::NotGenerated { backend, .. } | Outcome::SandboxFailed { backend, .. } => backend,
            Outcome::Executed(res) => &res.backend,
        }
    }
}

/// `exit 0` is success regardless of what the output says. A non-zero exit
/// needs at least one pass and one failure to count as partial.
pub fn classify(res: &SandboxResult) -> (Classification, Option<TestCounts>) {
    let counts = TestCounts::parse(&format!("{}\n{}", res.stdout, res.stderr));

    let class = if res.timed_out {
        Classification::Error
    } else if res.exit_code == 0 {
        Classification::Success
    } else {
        match counts {
            Some(c) if c.passed >= 1 && c.failing() >= 1 => Classification::Partial,
            _ => Classification::Error,
        }
    };

    (class, counts)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendEntry {
    pub backend: String,
    pub classification: Classification,
    pub detail: String,
    pub counts: Option<TestCounts>,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub stdout_excerpt: String,
    pub stderr_excerpt: String,
}

impl BackendEntry {
    fn from_outcome(outcome: &Outcome) -> Self {
        let blank = |classification, detail| BackendEntry {
            backend: outcome.backend().to_string(),
            classification,
            detail,
            counts: None,
            exit_code: None,
            timed_out: false,
            stdout_excerpt: String::new(),
            stderr_excerpt: String::new(),
        };

        match outcome {
            Outcome::NotGenerated { reason, .. } => {
                blank(Classification::Error, format!("generation failed: {reason}"))
            }
            Outcome::SandboxFailed { reason, .. } => {
                blank(Classification::Error, format!("sandbox failure: {reason}"))
            }
            Outcome::Executed(res) => {
                let (classification, counts) = classify(res);
                let detail = if res.timed_out {
                    "test run timed out and was killed".to_string()
                } else {
                    match counts {
                        Some(c) => format!("exit {}: {c}", res.exit_code),
                        None if res.exit_code == 0 => "exit 0".to_string(),
                        None => format!("exit {}: no test outcome found in output", res.exit_code),
                    }
                };

                BackendEntry {
                    backend: res.backend.clone(),
                    classification,
                    detail,
                    counts,
                    exit_code: Some(res.exit_code),
                    timed_out: res.timed_out,
                    stdout_excerpt: tail_excerpt(&res.stdout),
                    stderr_excerpt: tail_excerpt(&res.stderr),
                }
            }
        }
    }

    fn pass_ratio_cmp(&self, other: &Self) -> Ordering {
        let a = self.counts.unwrap_or_default();
        let b = other.counts.unwrap_or_default();
        // a.passed / a.total vs b.passed / b.total without floats
        (a.passed * b.total())
            .cmp(&(b.passed * a.total()))
            .then(a.passed.cmp(&b.passed))
    }
}

fn tail_excerpt(s: &str) -> String {
    if s.chars().count() <= OUTPUT_LIMIT {
        return s.to_string();
    }

    let skip = s.chars().count() - OUTPUT_LIMIT;
    format!("...truncated...\n{}", s.chars().skip(skip).collect::<String>())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Winner {
    Single(String),
    Tie(Vec<String>),
    /// Nobody passed everything; this is the best partial run.
    Qualified(String),
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComparisonReport {
    pub entries: Vec<BackendEntry>,
    pub winner: Winner,
    /// Backends that got as far as producing a candidate.
    pub candidates_produced: usize,
}

impl ComparisonReport {
    /// Entries keep the order of `outcomes`.
    pub fn build(outcomes: &[Outcome]) -> Self {
        let entries: Vec<BackendEntry> = outcomes.iter().map(BackendEntry::from_outcome).collect();
        let candidates_produced = outcomes
            .iter()
            .filter(|o| !matches!(o, Outcome::NotGenerated { .. }))
            .count();

        let winner = pick_winner(&entries);

        Self {
            entries,
            winner,
            candidates_produced,
        }
    }

    pub fn entry(&self, backend: &str) -> Option<&BackendEntry> {
        self.entries.iter().find(|e| e.backend == backend)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

fn pick_winner(entries: &[BackendEntry]) -> Winner {
    let successes: Vec<String> = entries
        .iter()
        .filter(|e| e.classification == Classification::Success)
        .map(|e| e.backend.clone())
        .collect();

    match successes.len() {
        1 => return Winner::Single(successes[0].clone()),
        n if n > 1 => return Winner::Tie(successes),
        _ => {}
    }

    // max_by keeps the last of equals; earlier entries must win ties
    entries
        .iter()
        .filter(|e| e.classification == Classification::Partial)
        .rev()
        .max_by(|a, b| a.pass_ratio_cmp(b))
        .map(|e| Winner::Qualified(e.backend.clone()))
        .unwrap_or(Winner::None)
}

impl fmt::Display for ComparisonReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for e in &self.entries {
            writeln!(f, "=== {} [{}] ===", e.backend, e.classification.as_str())?;
            writeln!(f, "{}", e.detail)?;

            for (label, text) in [("stdout", &e.stdout_excerpt), ("stderr", &e.stderr_excerpt)] {
                if text.trim().is_empty() {
                    continue;
                }
                writeln!(f, "--- {label} ---")?;
                writeln!(f, "{}", text.trim_end())?;
            }
            writeln!(f)?;
        }

        writeln!(f, "=== SUMMARY ===")?;
        for class in [
            Classification::Success,
            Classification::Partial,
            Classification::Error,
        ] {
            let names: Vec<&str> = self
                .entries
                .iter()
                .filter(|e| e.classification == class)
                .map(|e| e.backend.as_str())
                .collect();
            if !names.is_empty() {
                writeln!(f, "{:<8} {}", format!("{}:", class.as_str()), names.join(", "))?;
            }
        }

        if self.candidates_produced == 0 {
            writeln!(f, "All backends failed to generate; no candidates were produced.")?;
        }

        match &self.winner {
            Winner::Single(name) => writeln!(f, "Winner: {name}"),
            Winner::Tie(names) => writeln!(f, "Winner: tie between {}", names.join(", ")),
            Winner::Qualified(name) => {
                let ratio = self
                    .entry(name)
                    .and_then(|e| e.counts)
                    .map(|c| format!(" ({}/{} passed)", c.passed, c.total()))
                    .unwrap_or_default();
                writeln!(
                    f,
                    "Winner: none passed every test; best partial result is {name}{ratio}"
                )
            }
            Winner::None => writeln!(f, "Winner: none"),
        }
    }
}
