use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::fsio;
use crate::provider::Provider;

/// A lead-issued (or self-issued, on interrupt) stop order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownSignal {
    pub request_id: String,
    pub reason: String,
    pub timestamp: String,
}

impl ShutdownSignal {
    pub fn new(request_id: &str, reason: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            reason: reason.to_string(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Polling,
    Executing,
    Quarantined,
}

/// Liveness document rewritten at least once per cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub worker_name: String,
    pub team_name: String,
    pub provider: Provider,
    pub pid: u32,
    pub last_poll_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<String>,
    pub consecutive_errors: u32,
    pub status: WorkerStatus,
}

/// The worker's side of the signal files: shutdown requests are externally
/// written and worker-deleted; heartbeats are worker-written and
/// worker-deleted.
pub struct SignalPlane {
    signal_path: PathBuf,
    heartbeat_path: PathBuf,
}

impl SignalPlane {
    pub fn new(signal_path: PathBuf, heartbeat_path: PathBuf) -> Self {
        Self {
            signal_path,
            heartbeat_path,
        }
    }

    /// A present-but-undecodable signal file still stops the worker; an
    /// operator's stop order must not depend on well-formed JSON.
    pub fn check_shutdown(&self) -> anyhow::Result<Option<ShutdownSignal>> {
        let Some(contents) = fsio::read_to_string_opt(&self.signal_path)? else {
            return Ok(None);
        };
        match serde_json::from_str(&contents) {
            Ok(signal) => Ok(Some(signal)),
            Err(e) => {
                warn!(error = %e, "shutdown signal file is malformed; honoring it anyway");
                Ok(Some(ShutdownSignal::new("unknown", "malformed signal file")))
            }
        }
    }

    pub fn clear_shutdown(&self) -> anyhow::Result<()> {
        fsio::remove_if_exists(&self.signal_path)
    }

    /// Write a self-addressed shutdown request (used by the interrupt
    /// handler so ^C takes the same path as a lead-issued stop).
    pub fn request_shutdown(&self, signal: &ShutdownSignal) -> anyhow::Result<()> {
        fsio::write_json_atomic(&self.signal_path, signal)
    }

    pub fn write_heartbeat(&self, heartbeat: &Heartbeat) -> anyhow::Result<()> {
        fsio::write_json_atomic(&self.heartbeat_path, heartbeat)
    }

    pub fn clear_heartbeat(&self) -> anyhow::Result<()> {
        fsio::remove_if_exists(&self.heartbeat_path)
    }
}
