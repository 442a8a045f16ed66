use std::path::Path;
use std::sync::Arc;
use std::thread::{self, ScopedJoinHandle};
use std::time::Instant;

use anyhow::{Context, Result};
use uuid::Uuid;

use crate::config::Config;
use crate::error::SandboxError;
use crate::llm::{build_roster, run_generation, Slot};
use crate::report::{ComparisonReport, Outcome};
use crate::testgen::{normalize, NormalizedCandidate, SandboxExecutor, SandboxResult, SourceUnit};

/// Generate, normalize, execute and compare, for every configured backend.
///
/// Only an unreadable input file is an error. Misconfigured backends,
/// failed generations and broken sandboxes all end up in the report.
pub fn run_test_synthesis(path: &Path, config: &Config) -> Result<ComparisonReport> {
    let slots = build_roster(&config.backends);
    let executor = SandboxExecutor::from_config(&config.sandbox);
    run_with_slots(path, &slots, &executor)
}

/// Same as [`run_test_synthesis`] with an explicit roster and executor.
pub fn run_with_slots(
    path: &Path,
    slots: &[Slot],
    executor: &SandboxExecutor,
) -> Result<ComparisonReport> {
    let run_id = Uuid::new_v4();
    let started = Instant::now();

    let unit = SourceUnit::read(path)
        .with_context(|| format!("cannot read source file {}", path.display()))?;
    let unit = Arc::new(unit);

    log::info!(
        "[{run_id}] synthesizing tests for {} (module `{}`)",
        unit.path().display(),
        unit.module()
    );

    let attempts = run_generation(Arc::clone(&unit), slots);

    let mut staged = Vec::with_capacity(attempts.len());
    for attempt in attempts {
        match attempt.outcome {
            Ok(raw) => {
                let normalized = normalize(&attempt.backend, unit.module(), &raw);
                log::debug!(
                    "[{run_id}] [{}] kept {} test block(s){}",
                    attempt.backend,
                    normalized.kept_blocks,
                    if normalized.used_fallback { ", using fallback" } else { "" }
                );
                staged.push(Staged::Candidate(normalized.candidate));
            }
            Err(reason) => staged.push(Staged::Finished(Outcome::NotGenerated {
                backend: attempt.backend,
                reason,
            })),
        }
    }

    if !staged.iter().any(|s| matches!(s, Staged::Candidate(_))) {
        log::warn!("[{run_id}] all backends failed to generate");
    }

    let outcomes = execute_all(run_id, &unit, staged, executor);
    let report = ComparisonReport::build(&outcomes);

    log::info!(
        "[{run_id}] finished in {:.2}s, winner: {:?}",
        started.elapsed().as_secs_f32(),
        report.winner
    );

    Ok(report)
}

enum Staged {
    Candidate(NormalizedCandidate),
    Finished(Outcome),
}

enum Job<'scope> {
    Running {
        backend: String,
        handle: ScopedJoinHandle<'scope, Result<SandboxResult, SandboxError>>,
    },
    Finished(Outcome),
}

/// Runs every candidate in its own sandbox concurrently and waits for all
/// of them. Outcomes keep the order of `staged`.
fn execute_all(
    run_id: Uuid,
    unit: &SourceUnit,
    staged: Vec<Staged>,
    executor: &SandboxExecutor,
) -> Vec<Outcome> {
    thread::scope(|s| {
        let jobs: Vec<Job<'_>> = staged
            .into_iter()
            .map(|stage| match stage {
                Staged::Finished(outcome) => Job::Finished(outcome),
                Staged::Candidate(candidate) => {
                    let backend = candidate.backend.clone();
                    let spawned = thread::Builder::new()
                        .name(format!("sandbox-{backend}"))
                        .spawn_scoped(s, move || executor.execute(unit, &candidate));

                    match spawned {
                        Ok(handle) => Job::Running { backend, handle },
                        Err(e) => Job::Finished(Outcome::SandboxFailed {
                            backend,
                            reason: format!("cannot start sandbox thread: {e}"),
                        }),
                    }
                }
            })
            .collect();

        jobs.into_iter()
            .map(|job| match job {
                Job::Finished(outcome) => outcome,
                Job::Running { backend, handle } => match handle.join() {
                    Ok(Ok(result)) => Outcome::Executed(result),
                    Ok(Err(e)) => {
                        log::warn!("[{run_id}] [{backend}] sandbox failure: {e}");
                        Outcome::SandboxFailed {
                            backend,
                            reason: e.to_string(),
                        }
                    }
                    Err(_) => {
                        log::warn!("[{run_id}] [{backend}] sandbox thread panicked");
                        Outcome::SandboxFailed {
                            backend,
                            reason: "sandbox thread panicked".into(),
                        }
                    }
                },
            })
            .collect()
    })
}
