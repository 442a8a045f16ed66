// Subprocess execution with a wall-clock limit and loss-free output capture.

use std::io::{self, ErrorKind, Read, Write};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct CapturedRun {
    /// `-1` when the process was killed or ended by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("cannot spawn process: {0}")]
    Spawn(#[source] io::Error),

    #[error("waiting on process failed: {0}")]
    Wait(#[source] io::Error),
}

/// Spawns `cmd`, feeds `stdin` if given, and waits at most `timeout`
/// before killing it. Output written before the kill is kept. After the
/// process is gone, pipes are drained for at most `grace`.
pub fn run_captured(
    mut cmd: Command,
    stdin: Option<String>,
    timeout: Duration,
    grace: Duration,
) -> Result<CapturedRun, ProcessError> {
    cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    own_process_group(&mut cmd);

    let started = Instant::now();
    let mut child = cmd.spawn().map_err(ProcessError::Spawn)?;

    // Written from a thread so a child that talks before reading can't deadlock us.
    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        thread::spawn(move || {
            let _ = pipe.write_all(input.as_bytes());
        });
    }

    let stdout = Capture::start(child.stdout.take());
    let stderr = Capture::start(child.stderr.take());

    let (exit_code, timed_out) = loop {
        match child.try_wait() {
            Ok(Some(status)) => break (status.code().unwrap_or(-1), false),
            Ok(None) if started.elapsed() >= timeout => {
                kill_group(&mut child);
                let code = child.wait().ok().and_then(|s| s.code()).unwrap_or(-1);
                break (code, true);
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                kill_group(&mut child);
                let _ = child.wait();
                return Err(ProcessError::Wait(e));
            }
        }
    };
    let duration = started.elapsed();

    let drain_until = Instant::now() + grace;

    Ok(CapturedRun {
        exit_code,
        stdout: stdout.finish(drain_until),
        stderr: stderr.finish(drain_until),
        timed_out,
        duration,
    })
}

/// The child leads a new process group so a timeout can take down
/// everything it started, not just the direct child.
#[cfg(unix)]
fn own_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn own_process_group(_cmd: &mut Command) {}

fn kill_group(child: &mut Child) {
    #[cfg(unix)]
    if let Ok(pgid) = i32::try_from(child.id()) {
        // SAFETY: kill(2) only sends a signal; the group id is the child's pid.
        unsafe {
            libc::kill(-pgid, libc::SIGKILL);
        }
    }
    let _ = child.kill();
}

/// Drains one pipe on its own thread.
struct Capture {
    buf: Arc<Mutex<Vec<u8>>>,
    handle: Option<JoinHandle<()>>,
}

impl Capture {
    fn start<R: Read + Send + 'static>(pipe: Option<R>) -> Self {
        let buf = Arc::new(Mutex::new(Vec::new()));

        let handle = pipe.map(|mut pipe| {
            let buf = Arc::clone(&buf);
            thread::spawn(move || {
                let mut chunk = [0u8; 8192];
                loop {
                    match pipe.read(&mut chunk) {
                        Ok(0) => break,
                        Ok(n) => match buf.lock() {
                            Ok(mut b) => b.extend_from_slice(&chunk[..n]),
                            Err(poisoned) => poisoned.into_inner().extend_from_slice(&chunk[..n]),
                        },
                        Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                        Err(_) => break,
                    }
                }
            })
        });

        Self { buf, handle }
    }

    /// Waits for the reader until `deadline`, then takes whatever arrived.
    /// A grandchild holding the pipe open cannot block us past the deadline.
    fn finish(self, deadline: Instant) -> String {
        if let Some(handle) = self.handle {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            if handle.is_finished() {
                let _ = handle.join();
            }
        }

        let bytes = match self.buf.lock() {
            Ok(b) => b.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        String::from_utf8_lossy(&bytes).into_owned()
    }
}
