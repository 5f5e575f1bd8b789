use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::config::{BridgeConfig, Layout};
use crate::fsio;
use crate::mailbox::{InboxMessage, InboxReader, Outbox, OutboxMessage};
use crate::prompt;
use crate::sanitize;
use crate::signals::{Heartbeat, ShutdownSignal, SignalPlane, WorkerStatus};
use crate::subprocess::{self, ChildHandle, CliExecution, CliRequest};
use crate::tasks::{Task, TaskStatus, TaskStore};

/// How much of the output file becomes the task_complete summary.
const SUMMARY_CHARS: usize = 500;
/// Grace between SIGTERM and SIGKILL during shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
/// Tick used to interleave shutdown checks with the CLI completion wait.
const RESULT_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Sleep one poll interval and go again.
    Continue,
    /// Quarantined: sleep three intervals, keep heartbeating, do nothing.
    Quarantined,
    /// Clean shutdown completed; the loop is done.
    Shutdown,
}

/// The per-worker daemon: one instance, one logical thread of control,
/// driving poll cycles until an external shutdown signal arrives.
pub struct BridgeDaemon {
    config: BridgeConfig,
    layout: Layout,
    store: TaskStore,
    inbox: InboxReader,
    outbox: Outbox,
    signals: SignalPlane,
    consecutive_errors: u32,
    idle_notified: bool,
    quarantine_notified: bool,
}

impl BridgeDaemon {
    pub fn new(config: BridgeConfig, state_root: &Path) -> anyhow::Result<Self> {
        let layout = Layout::resolve(state_root, &config)?;
        let store = TaskStore::new(
            layout.tasks_dir.clone(),
            config.worker_name.clone(),
            config.max_retries,
        );
        let inbox = InboxReader::new(layout.inbox_path.clone(), layout.inbox_cursor_path.clone());
        let outbox = Outbox::new(layout.outbox_path.clone());
        let signals = SignalPlane::new(layout.signal_path.clone(), layout.heartbeat_path.clone());

        Ok(Self {
            config,
            layout,
            store,
            inbox,
            outbox,
            signals,
            consecutive_errors: 0,
            idle_notified: false,
            quarantine_notified: false,
        })
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Run until shutdown. Transient cycle errors are logged and counted,
    /// never propagated; the only exit is a clean shutdown.
    pub fn run(&mut self) -> anyhow::Result<()> {
        info!(
            team = %self.config.team_name,
            worker = %self.config.worker_name,
            provider = %self.config.provider,
            "bridge daemon started"
        );
        let interval = Duration::from_millis(self.config.poll_interval_ms);
        loop {
            match self.run_cycle() {
                Ok(CycleOutcome::Shutdown) => {
                    info!("bridge daemon stopped");
                    return Ok(());
                }
                Ok(CycleOutcome::Continue) => std::thread::sleep(interval),
                Ok(CycleOutcome::Quarantined) => std::thread::sleep(interval * 3),
                Err(e) => {
                    error!(error = %format!("{e:#}"), "cycle failed");
                    self.consecutive_errors += 1;
                    std::thread::sleep(interval);
                }
            }
        }
    }

    /// One poll cycle. Public so scenarios can be driven deterministically.
    pub fn run_cycle(&mut self) -> anyhow::Result<CycleOutcome> {
        if let Some(signal) = self.signals.check_shutdown()? {
            self.shutdown(&signal, None)?;
            return Ok(CycleOutcome::Shutdown);
        }

        if self.consecutive_errors >= self.config.max_consecutive_errors {
            if !self.quarantine_notified {
                self.outbox.append(&OutboxMessage::error(&format!(
                    "Self-quarantined after {} consecutive errors; worker is idle until shutdown",
                    self.config.max_consecutive_errors
                )))?;
                self.quarantine_notified = true;
            }
            self.write_heartbeat(WorkerStatus::Quarantined, None)?;
            return Ok(CycleOutcome::Quarantined);
        }

        self.write_heartbeat(WorkerStatus::Polling, None)?;
        let messages = self.inbox.read_new()?;

        let outcome = match self.store.find_next()? {
            Some(task) => {
                self.idle_notified = false;
                self.execute_task(task, &messages)?
            }
            None => {
                if !self.idle_notified {
                    self.outbox
                        .append(&OutboxMessage::idle("no executable tasks; polling"))?;
                    self.idle_notified = true;
                }
                CycleOutcome::Continue
            }
        };

        if outcome == CycleOutcome::Shutdown {
            return Ok(outcome);
        }
        if let Err(e) = self.outbox.rotate(self.config.outbox_max_lines) {
            warn!(error = %format!("{e:#}"), "outbox rotation failed");
        }
        Ok(outcome)
    }

    fn execute_task(
        &mut self,
        task: Task,
        messages: &[InboxMessage],
    ) -> anyhow::Result<CycleOutcome> {
        let id = task.id.clone();
        info!(task = %id, "executing task");
        self.store
            .update(&id, |t| t.status = TaskStatus::InProgress)?;
        self.write_heartbeat(WorkerStatus::Executing, Some(&id))?;

        // A stop order may have landed while the task was being selected;
        // re-check before paying for a CLI spawn.
        if let Some(signal) = self.signals.check_shutdown()? {
            self.store.update(&id, |t| t.status = TaskStatus::Pending)?;
            self.shutdown(&signal, None)?;
            return Ok(CycleOutcome::Shutdown);
        }

        let prompt_text = prompt::build_prompt(&task, messages, &self.config);
        let stem = format!(
            "team-{}-task-{}-{}",
            self.config.team_name,
            id,
            fsio::now_millis()
        );
        let prompt_path = sanitize::ensure_within(
            &self.layout.prompts_dir.join(format!("{stem}.txt")),
            &self.layout.prompts_dir,
        )?;
        fsio::write_atomic(&prompt_path, &prompt_text)?;
        let output_path = sanitize::ensure_within(
            &self.layout.outputs_dir.join(format!("{stem}.txt")),
            &self.layout.outputs_dir,
        )?;

        let request = CliRequest {
            provider: self.config.provider,
            program: self
                .config
                .provider_bin
                .clone()
                .unwrap_or_else(|| self.config.provider.program().to_string()),
            model: self.config.model.clone(),
            prompt: prompt_text,
            working_dir: self.config.working_directory.clone(),
            timeout: Duration::from_millis(self.config.task_timeout_ms),
        };

        let outcome = match subprocess::spawn_provider(request) {
            Ok(execution) => match self.await_result(execution)? {
                Awaited::Finished(outcome) => outcome,
                Awaited::ShutdownRequested(signal, handle) => {
                    self.store.update(&id, |t| t.status = TaskStatus::Pending)?;
                    self.shutdown(&signal, Some(&handle))?;
                    return Ok(CycleOutcome::Shutdown);
                }
            },
            Err(e) => Err(e),
        };

        match outcome {
            Ok(response) => {
                fsio::write_atomic(&output_path, &response)?;
                self.store
                    .update(&id, |t| t.status = TaskStatus::Completed)?;
                self.consecutive_errors = 0;
                let output = fsio::read_to_string_opt(&output_path)?.unwrap_or_default();
                let summary = prompt::truncate_chars(&output, SUMMARY_CHARS);
                self.outbox
                    .append(&OutboxMessage::task_complete(&id, &summary))?;
                info!(task = %id, "task completed");
            }
            Err(e) => {
                let error_text = format!("{e:#}");
                warn!(task = %id, error = %error_text, "task failed");
                self.consecutive_errors += 1;
                let failure = self.store.write_failure(&id, &error_text)?;
                if failure.retry_count > self.config.max_retries {
                    self.store
                        .mark_permanently_failed(&id, &error_text, failure.retry_count)?;
                    self.outbox.append(&OutboxMessage::error(&format!(
                        "Task {id} permanently failed after {} attempts: {error_text}",
                        failure.retry_count
                    )))?;
                } else {
                    self.store.update(&id, |t| t.status = TaskStatus::Pending)?;
                    self.outbox.append(&OutboxMessage::task_failed(
                        &id,
                        &error_text,
                        failure.retry_count,
                    ))?;
                }
            }
        }

        // Observers watching the heartbeat see the executing state end as
        // soon as the task does, not at the next poll.
        let status = if self.consecutive_errors >= self.config.max_consecutive_errors {
            WorkerStatus::Quarantined
        } else {
            WorkerStatus::Polling
        };
        self.write_heartbeat(status, None)?;
        Ok(CycleOutcome::Continue)
    }

    /// Wait for the CLI outcome while staying responsive to shutdown.
    fn await_result(&self, execution: CliExecution) -> anyhow::Result<Awaited> {
        loop {
            match execution.result.recv_timeout(RESULT_POLL) {
                Ok(outcome) => return Ok(Awaited::Finished(outcome)),
                Err(RecvTimeoutError::Timeout) => {
                    if let Some(signal) = self.signals.check_shutdown()? {
                        return Ok(Awaited::ShutdownRequested(signal, execution.handle));
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Ok(Awaited::Finished(Err(anyhow::anyhow!(
                        "provider supervisor exited without reporting"
                    ))));
                }
            }
        }
    }

    fn write_heartbeat(
        &self,
        status: WorkerStatus,
        current_task_id: Option<&str>,
    ) -> anyhow::Result<()> {
        self.signals.write_heartbeat(&Heartbeat {
            worker_name: self.config.worker_name.clone(),
            team_name: self.config.team_name.clone(),
            provider: self.config.provider,
            pid: std::process::id(),
            last_poll_at: Utc::now().to_rfc3339(),
            current_task_id: current_task_id.map(str::to_string),
            consecutive_errors: self.consecutive_errors,
            status,
        })
    }

    /// The shutdown sequence: stop the child, acknowledge, remove the
    /// signal and heartbeat, and take the multiplexer session down with us.
    fn shutdown(&mut self, signal: &ShutdownSignal, child: Option<&ChildHandle>) -> anyhow::Result<()> {
        info!(
            request = %signal.request_id,
            reason = %signal.reason,
            "shutdown requested"
        );

        if let Some(child) = child
            && child.is_alive()
        {
            child.terminate();
            if !child.wait_closed(SHUTDOWN_GRACE) {
                warn!("child ignored SIGTERM; killing");
                child.kill();
                child.wait_closed(Duration::from_secs(1));
            }
        }

        self.outbox
            .append(&OutboxMessage::shutdown_ack(&signal.request_id))?;
        self.signals.clear_shutdown()?;
        self.signals.clear_heartbeat()?;
        self.kill_mux_session();
        Ok(())
    }

    /// Best-effort: the worker lives inside a tmux session created by the
    /// launcher; killing it tears down this process too. Absence of tmux
    /// (or of the session) is not an error.
    fn kill_mux_session(&self) {
        let session = format!(
            "omc-{}-{}",
            self.config.team_name, self.config.worker_name
        );
        let _ = std::process::Command::new("tmux")
            .args(["kill-session", "-t", &session])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
}

enum Awaited {
    Finished(anyhow::Result<String>),
    ShutdownRequested(ShutdownSignal, ChildHandle),
}

/// Install SIGINT/SIGTERM handlers that convert the signal into a
/// self-addressed shutdown request, so an interactive stop takes the same
/// clean path as a lead-issued one.
pub fn register_interrupt_handler(signal_path: PathBuf) {
    let result = ctrlc::set_handler(move || {
        warn!("interrupt received; requesting clean shutdown");
        let signal = ShutdownSignal::new(&format!("interrupt-{}", fsio::now_millis()), "interrupt");
        if let Err(e) = fsio::write_json_atomic(&signal_path, &signal) {
            error!(error = %format!("{e:#}"), "failed to write shutdown request");
        }
    });
    if let Err(e) = result {
        warn!(error = %e, "could not install interrupt handler");
    }
}
