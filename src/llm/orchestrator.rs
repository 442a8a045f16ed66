use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};

use crate::error::{AttemptFailure, BackendError};
use crate::llm::backend::Slot;
use crate::llm::prompt::build_prompt;
use crate::testgen::source::SourceUnit;

/// What one backend produced in this run.
#[derive(Debug, Clone)]
pub struct GenerationAttempt {
    pub backend: String,
    pub outcome: Result<String, AttemptFailure>,
    pub elapsed: Duration,
    pub prompt_hash: String,
}

impl GenerationAttempt {
    pub fn text(&self) -> Option<&str> {
        self.outcome.as_deref().ok()
    }
}

type WorkerResult = (Result<String, BackendError>, Duration);

enum Pending {
    Done(Result<String, AttemptFailure>, Duration),
    Waiting {
        timeout: Duration,
        rx: Receiver<WorkerResult>,
    },
}

/// Runs every ready backend on its own thread and collects one attempt per
/// slot, in slot order.
///
/// Each backend gets until `start + timeout`. A worker still running at its
/// deadline is abandoned: its result is discarded whenever it arrives.
pub fn run_generation(unit: Arc<SourceUnit>, slots: &[Slot]) -> Vec<GenerationAttempt> {
    let prompt_hash = build_prompt(&unit).hash();
    let start = Instant::now();

    log::info!(
        "generating tests for {} with {} backend(s)",
        unit.file_name(),
        slots.len()
    );

    let pending: Vec<Pending> = slots.iter().map(|slot| spawn(slot, &unit)).collect();

    slots
        .iter()
        .zip(pending)
        .map(|(slot, pending)| {
            let (outcome, elapsed) = match pending {
                Pending::Done(outcome, elapsed) => (outcome, elapsed),
                Pending::Waiting { timeout, rx } => collect(&rx, start, timeout),
            };

            match &outcome {
                Ok(text) => log::info!(
                    "[{}] generated {} bytes in {:.2}s",
                    slot.name(),
                    text.len(),
                    elapsed.as_secs_f32()
                ),
                Err(e) => log::warn!("[{}] generation failed: {e}", slot.name()),
            }

            GenerationAttempt {
                backend: slot.name().to_string(),
                outcome,
                elapsed,
                prompt_hash: prompt_hash.clone(),
            }
        })
        .collect()
}

fn spawn(slot: &Slot, unit: &Arc<SourceUnit>) -> Pending {
    let generator = match slot {
        Slot::Misconfigured { error, .. } => {
            return Pending::Done(Err(error.clone().into()), Duration::ZERO)
        }
        Slot::Ready(generator) => Arc::clone(generator),
    };

    let timeout = generator.timeout();
    let (tx, rx) = bounded::<WorkerResult>(1);
    let unit = Arc::clone(unit);

    let spawned = thread::Builder::new()
        .name(format!("gen-{}", generator.name()))
        .spawn(move || {
            let t0 = Instant::now();
            let res = generator.generate(&unit);
            // The collector may have given up on us already.
            let _ = tx.send((res, t0.elapsed()));
        });

    match spawned {
        Ok(_) => Pending::Waiting { timeout, rx },
        Err(e) => Pending::Done(
            Err(AttemptFailure::WorkerLost(format!("cannot start worker: {e}"))),
            Duration::ZERO,
        ),
    }
}

fn collect(
    rx: &Receiver<WorkerResult>,
    start: Instant,
    timeout: Duration,
) -> (Result<String, AttemptFailure>, Duration) {
    let received = match start.checked_add(timeout) {
        Some(deadline) => rx.recv_deadline(deadline),
        None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
    };

    match received {
        Ok((res, elapsed)) => (res.map_err(AttemptFailure::from), elapsed),
        Err(RecvTimeoutError::Timeout) => (Err(AttemptFailure::TimedOut(timeout)), start.elapsed()),
        Err(RecvTimeoutError::Disconnected) => (
            Err(AttemptFailure::WorkerLost(
                "worker exited without a result".into(),
            )),
            start.elapsed(),
        ),
    }
}
