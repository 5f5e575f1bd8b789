use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::fsio;
use crate::sanitize;

/// How long a claim is left to settle before the confirming re-read. Wide
/// enough that two writers racing the same task overwrite each other
/// deterministically instead of both proceeding.
const CLAIM_SETTLE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
}

/// One task document under `tasks/<team>/<id>`.
///
/// Unknown fields round-trip through `extra` so a lead can attach data this
/// daemon version does not know about without it being destroyed by an
/// update.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub subject: String,
    pub description: String,
    pub owner: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub blocked_by: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_pid: Option<u32>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Failure sidecar (`<id>.failure`), created on the first failed attempt
/// and incremented on each one after; never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    pub last_error: String,
    pub retry_count: u32,
    pub last_failure_at: String,
}

pub struct TaskStore {
    dir: PathBuf,
    worker: String,
    pid: u32,
    max_retries: u32,
}

impl TaskStore {
    pub fn new(dir: PathBuf, worker: String, max_retries: u32) -> Self {
        Self {
            dir,
            worker,
            pid: std::process::id(),
            max_retries,
        }
    }

    fn task_path(&self, id: &str) -> anyhow::Result<PathBuf> {
        sanitize::validate_task_id(id)?;
        sanitize::ensure_within(&self.dir.join(id), &self.dir)
    }

    fn failure_path(&self, id: &str) -> anyhow::Result<PathBuf> {
        sanitize::validate_task_id(id)?;
        sanitize::ensure_within(&self.dir.join(format!("{id}.failure")), &self.dir)
    }

    /// Read one task. Missing or structurally invalid documents read as
    /// `None`; the lead owns creation, so a half-written file is theirs to
    /// finish.
    pub fn read(&self, id: &str) -> anyhow::Result<Option<Task>> {
        let path = self.task_path(id)?;
        let Some(contents) = fsio::read_to_string_opt(&path)? else {
            return Ok(None);
        };
        match serde_json::from_str::<Task>(&contents) {
            Ok(task) => Ok(Some(task)),
            Err(e) => {
                warn!(task = id, error = %e, "skipping undecodable task document");
                Ok(None)
            }
        }
    }

    /// Read-modify-write a task atomically. Unknown fields survive via the
    /// flattened extra map.
    pub fn update(&self, id: &str, mutate: impl FnOnce(&mut Task)) -> anyhow::Result<Task> {
        let path = self.task_path(id)?;
        let mut task = self
            .read(id)?
            .with_context(|| format!("task {id} disappeared during update"))?;
        mutate(&mut task);
        fsio::write_json_atomic(&path, &task)?;
        Ok(task)
    }

    /// All task ids in the team directory, numerically when both sides
    /// parse as numbers and lexicographically otherwise.
    pub fn list_ids(&self) -> anyhow::Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(anyhow::Error::new(e).context(format!("listing {}", self.dir.display())))
            }
        };

        let mut ids: Vec<String> = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".failure") || name.ends_with(".tmp") {
                continue;
            }
            if sanitize::validate_task_id(&name).is_ok() {
                ids.push(name);
            }
        }
        ids.sort_by(|a, b| match (a.parse::<u64>(), b.parse::<u64>()) {
            (Ok(x), Ok(y)) => x.cmp(&y),
            _ => a.cmp(b),
        });
        Ok(ids)
    }

    /// True when every blocker exists and has completed.
    pub fn blockers_resolved(&self, task: &Task) -> anyhow::Result<bool> {
        for blocker in &task.blocked_by {
            match self.read(blocker)? {
                Some(dep) if dep.status == TaskStatus::Completed => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    /// Record one failed attempt against a task.
    pub fn write_failure(&self, id: &str, error: &str) -> anyhow::Result<FailureRecord> {
        let path = self.failure_path(id)?;
        let retry_count = self.read_failure(id)?.map_or(0, |f| f.retry_count) + 1;
        let record = FailureRecord {
            last_error: error.to_string(),
            retry_count,
            last_failure_at: Utc::now().to_rfc3339(),
        };
        fsio::write_json_atomic(&path, &record)?;
        Ok(record)
    }

    pub fn read_failure(&self, id: &str) -> anyhow::Result<Option<FailureRecord>> {
        let path = self.failure_path(id)?;
        let Some(contents) = fsio::read_to_string_opt(&path)? else {
            return Ok(None);
        };
        match serde_json::from_str(&contents) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(task = id, error = %e, "ignoring undecodable failure sidecar");
                Ok(None)
            }
        }
    }

    /// Whether the failure sidecar has passed the retry ceiling.
    /// `max_retries` bounds the failed attempts that still earn another
    /// try, so exhaustion is strictly-greater, not greater-or-equal.
    pub fn retries_exhausted(&self, id: &str) -> anyhow::Result<bool> {
        Ok(self
            .read_failure(id)?
            .is_some_and(|f| f.retry_count > self.max_retries))
    }

    /// Mark a task permanently failed: completed, with the error preserved
    /// in metadata so the lead can see why nothing further will happen.
    pub fn mark_permanently_failed(
        &self,
        id: &str,
        error: &str,
        attempts: u32,
    ) -> anyhow::Result<Task> {
        self.update(id, |task| {
            task.status = TaskStatus::Completed;
            task.metadata
                .insert("error".to_string(), Value::String(error.to_string()));
            task.metadata
                .insert("permanentlyFailed".to_string(), Value::Bool(true));
            task.metadata
                .insert("failedAttempts".to_string(), Value::from(attempts));
        })
    }

    /// Find the next executable task for this worker and claim it.
    ///
    /// Candidates must be pending, owned by this worker, not retry
    /// exhausted, and unblocked. Each candidate is claimed by writing the
    /// claim triple, letting the claim settle, and re-reading; a candidate
    /// whose claim did not stick is skipped, not retried.
    pub fn find_next(&self) -> anyhow::Result<Option<Task>> {
        for id in self.list_ids()? {
            let Some(task) = self.read(&id)? else {
                continue;
            };
            if task.status != TaskStatus::Pending || task.owner != self.worker {
                continue;
            }
            if self.retries_exhausted(&id)? {
                // A restart can land here with the sidecar already at the
                // ceiling but the task still pending; close it out so it is
                // never picked up again.
                if let Some(failure) = self.read_failure(&id)? {
                    self.mark_permanently_failed(&id, &failure.last_error, failure.retry_count)?;
                }
                continue;
            }
            if !self.blockers_resolved(&task)? {
                continue;
            }

            let claimed_at = fsio::now_millis();
            self.update(&id, |task| {
                task.claimed_by = Some(self.worker.clone());
                task.claimed_at = Some(claimed_at);
                task.claim_pid = Some(self.pid);
            })?;
            std::thread::sleep(CLAIM_SETTLE);

            match self.read(&id)? {
                Some(current)
                    if current.status == TaskStatus::Pending
                        && current.claimed_by.as_deref() == Some(self.worker.as_str())
                        && current.claim_pid == Some(self.pid) =>
                {
                    return Ok(Some(current));
                }
                _ => {
                    warn!(task = %id, "lost claim race, moving on");
                    continue;
                }
            }
        }
        Ok(None)
    }
}
