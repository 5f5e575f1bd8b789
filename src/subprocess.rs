use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use tracing::{debug, warn};

use crate::error::BridgeError;
use crate::provider::Provider;

/// Ceiling on captured stdout/stderr; a runaway child cannot take the
/// daemon down with it. Excess is dropped, not an error.
pub const MAX_CAPTURE_BYTES: usize = 10 * 1024 * 1024;

const SUPERVISOR_TICK: Duration = Duration::from_millis(10);
const TERM_GRACE: Duration = Duration::from_secs(2);

/// One provider invocation.
pub struct CliRequest {
    pub provider: Provider,
    /// Executable to spawn; normally the provider family name, resolvable
    /// from PATH, but overridable for pinned installs.
    pub program: String,
    pub model: Option<String>,
    pub prompt: String,
    pub working_dir: PathBuf,
    pub timeout: Duration,
}

/// Lifetime control for a running child, detached from its completion: the
/// bridge keeps the handle to stop the child on shutdown while the outcome
/// travels separately through the result channel.
#[derive(Debug)]
pub struct ChildHandle {
    pid: i32,
    alive: Arc<AtomicBool>,
}

impl ChildHandle {
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Graceful stop (SIGTERM).
    pub fn terminate(&self) {
        if self.is_alive() {
            unsafe {
                libc::kill(self.pid, libc::SIGTERM);
            }
        }
    }

    /// Hard stop (SIGKILL).
    pub fn kill(&self) {
        if self.is_alive() {
            unsafe {
                libc::kill(self.pid, libc::SIGKILL);
            }
        }
    }

    /// Wait up to `timeout` for the child to be reaped. Returns whether it
    /// closed in time.
    pub fn wait_closed(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.is_alive() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(25));
        }
        true
    }
}

#[derive(Debug)]
pub struct CliExecution {
    pub handle: ChildHandle,
    pub result: Receiver<anyhow::Result<String>>,
}

fn push_capped(buf: &mut String, chunk: &str) {
    let remaining = MAX_CAPTURE_BYTES.saturating_sub(buf.len());
    if remaining == 0 {
        return;
    }
    if chunk.len() <= remaining {
        buf.push_str(chunk);
    } else {
        let mut end = remaining;
        while !chunk.is_char_boundary(end) {
            end -= 1;
        }
        buf.push_str(&chunk[..end]);
    }
}

fn reader_thread(stream: impl std::io::Read + Send + 'static) -> Receiver<String> {
    let (tx, rx) = mpsc::channel::<String>();
    thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        loop {
            let mut line = String::new();
            match reader.read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}

fn drain(rx: &Receiver<String>, buf: &mut String) {
    while let Ok(chunk) = rx.try_recv() {
        push_capped(buf, &chunk);
    }
}

fn drain_to_close(rx: &Receiver<String>, buf: &mut String) {
    // After the child is gone the pipes close and the reader threads hang
    // up; the deadline only guards against a grandchild inheriting them.
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        match rx.recv_timeout(Duration::from_millis(50)) {
            Ok(chunk) => push_capped(buf, &chunk),
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if Instant::now() >= deadline {
                    break;
                }
            }
        }
    }
}

/// Spawn the provider CLI, feed it the prompt on stdin, and supervise it on
/// a background thread. Returns immediately with the handle/result pair.
pub fn spawn_provider(request: CliRequest) -> anyhow::Result<CliExecution> {
    let args = request.provider.args(request.model.as_deref());
    debug!(program = %request.program, ?args, "spawning provider");

    let mut child = Command::new(&request.program)
        .args(&args)
        .current_dir(&request.working_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| -> anyhow::Error {
            if e.kind() == std::io::ErrorKind::NotFound {
                BridgeError::ProviderNotFound {
                    program: request.program.clone(),
                }
                .into()
            } else {
                anyhow::Error::new(e).context(format!("spawning {}", request.program))
            }
        })?;

    let pid = child.id() as i32;
    let alive = Arc::new(AtomicBool::new(true));
    let handle = ChildHandle {
        pid,
        alive: Arc::clone(&alive),
    };

    let mut stdin = child.stdin.take().context("capturing provider stdin")?;
    let stdin_error: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    {
        let stdin_error = Arc::clone(&stdin_error);
        let prompt = request.prompt.clone();
        thread::spawn(move || {
            if let Err(e) = stdin.write_all(prompt.as_bytes()) {
                *stdin_error.lock().unwrap() = Some(e.to_string());
            }
            // Dropping stdin closes the pipe so the child sees EOF.
        });
    }

    let stdout_rx = reader_thread(child.stdout.take().context("capturing provider stdout")?);
    let stderr_rx = reader_thread(child.stderr.take().context("capturing provider stderr")?);

    let (result_tx, result_rx) = mpsc::channel();
    let provider = request.provider;
    let program = request.program.clone();
    let timeout = request.timeout;

    thread::spawn(move || {
        let deadline = Instant::now() + timeout;
        let mut stdout = String::new();
        let mut stderr = String::new();

        let outcome: anyhow::Result<String> = loop {
            drain(&stdout_rx, &mut stdout);
            drain(&stderr_rx, &mut stderr);

            if let Some(error) = stdin_error.lock().unwrap().take() {
                let _ = child.kill();
                let _ = child.wait();
                break Err(anyhow::anyhow!(
                    "writing prompt to {program} stdin: {error}"
                ));
            }

            match child.try_wait() {
                Ok(Some(status)) => {
                    drain_to_close(&stdout_rx, &mut stdout);
                    drain_to_close(&stderr_rx, &mut stderr);
                    break conclude(provider, &program, status, &stdout, &stderr);
                }
                Ok(None) => {}
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    break Err(anyhow::Error::new(e).context(format!("waiting for {program}")));
                }
            }

            if Instant::now() >= deadline {
                unsafe {
                    libc::kill(pid, libc::SIGTERM);
                }
                let grace = Instant::now() + TERM_GRACE;
                while Instant::now() < grace {
                    if matches!(child.try_wait(), Ok(Some(_))) {
                        break;
                    }
                    thread::sleep(SUPERVISOR_TICK);
                }
                let _ = child.kill();
                let _ = child.wait();
                warn!(program = %program, "provider timed out");
                break Err(BridgeError::Timeout {
                    program: program.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                }
                .into());
            }

            thread::sleep(SUPERVISOR_TICK);
        };

        alive.store(false, Ordering::SeqCst);
        let _ = result_tx.send(outcome);
    });

    Ok(CliExecution {
        handle,
        result: result_rx,
    })
}

/// Apply the termination rules: a clean exit or any non-empty stdout is a
/// success (the CLIs sometimes do useful work and still exit non-zero); a
/// non-zero exit with nothing on stdout fails with the stderr.
fn conclude(
    provider: Provider,
    program: &str,
    status: ExitStatus,
    stdout: &str,
    stderr: &str,
) -> anyhow::Result<String> {
    if status.success() || !stdout.trim().is_empty() {
        Ok(provider.parse_response(stdout))
    } else {
        Err(BridgeError::ProviderFailed {
            program: program.to_string(),
            code: status.code().unwrap_or(-1),
            message: stderr.trim().to_string(),
        }
        .into())
    }
}
