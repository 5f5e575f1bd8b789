use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::BridgeError;
use crate::fsio;
use crate::provider::Provider;
use crate::sanitize;

/// Daemon configuration, one JSON document passed via `--config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    pub team_name: String,
    pub worker_name: String,
    pub provider: Provider,
    pub working_directory: PathBuf,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
    #[serde(default = "default_outbox_max_lines")]
    pub outbox_max_lines: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Override for the provider executable. Normally unset; the family
    /// name is resolved from PATH.
    #[serde(default)]
    pub provider_bin: Option<String>,
}

fn default_poll_interval_ms() -> u64 {
    3000
}
fn default_task_timeout_ms() -> u64 {
    600_000
}
fn default_max_consecutive_errors() -> u32 {
    3
}
fn default_outbox_max_lines() -> usize {
    500
}
fn default_max_retries() -> u32 {
    5
}

fn home_dir() -> anyhow::Result<PathBuf> {
    std::env::var("HOME")
        .map(PathBuf::from)
        .map_err(|_| BridgeError::Config("HOME is not set".to_string()).into())
}

/// Per-user state root holding `tasks/` and `teams/`. `OMC_STATE_DIR`
/// overrides the default of `$HOME/.omc`.
pub fn state_root() -> anyhow::Result<PathBuf> {
    if let Ok(dir) = std::env::var("OMC_STATE_DIR") {
        let trimmed = dir.trim();
        if !trimmed.is_empty() {
            return Ok(PathBuf::from(trimmed));
        }
    }
    Ok(home_dir()?.join(".omc"))
}

fn is_inside_worktree(dir: &Path) -> bool {
    dir.ancestors().any(|a| a.join(".git").exists())
}

impl BridgeConfig {
    /// Load and validate a config file. Any failure here is fatal; the
    /// daemon refuses to start on a config it cannot fully trust.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let resolved = path
            .canonicalize()
            .map_err(|e| BridgeError::Config(format!("config {}: {e}", path.display())))?;

        let root = state_root()?;
        let under_state_root = root
            .canonicalize()
            .ok()
            .is_some_and(|root| resolved.starts_with(root));
        let under_omc = resolved
            .components()
            .any(|c| c.as_os_str() == ".omc");
        if !under_state_root && !under_omc {
            return Err(BridgeError::Config(format!(
                "config {} must live under the state root or a .omc directory",
                resolved.display()
            ))
            .into());
        }

        let contents = std::fs::read_to_string(&resolved)
            .with_context(|| format!("reading {}", resolved.display()))?;
        let config = Self::parse(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a config from JSON without touching the filesystem.
    pub fn parse(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| BridgeError::Config(format!("invalid config: {e}")).into())
    }

    fn validate(&self) -> anyhow::Result<()> {
        let team = sanitize::sanitize_name(&self.team_name)?;
        let worker = sanitize::sanitize_name(&self.worker_name)?;
        if team != self.team_name || worker != self.worker_name {
            return Err(BridgeError::Config(format!(
                "team/worker names must already be safe (got {:?}/{:?})",
                self.team_name, self.worker_name
            ))
            .into());
        }

        let wd = &self.working_directory;
        let resolved = wd
            .canonicalize()
            .map_err(|e| BridgeError::Config(format!("workingDirectory {}: {e}", wd.display())))?;
        if !resolved.is_dir() {
            return Err(BridgeError::Config(format!(
                "workingDirectory {} is not a directory",
                resolved.display()
            ))
            .into());
        }
        let home = home_dir()?
            .canonicalize()
            .map_err(|e| BridgeError::Config(format!("resolving home: {e}")))?;
        if !resolved.starts_with(&home) {
            return Err(BridgeError::Config(format!(
                "workingDirectory {} must be under {}",
                resolved.display(),
                home.display()
            ))
            .into());
        }
        if !is_inside_worktree(&resolved) {
            return Err(BridgeError::Config(format!(
                "workingDirectory {} is not inside a source-control worktree",
                resolved.display()
            ))
            .into());
        }
        if self.poll_interval_ms == 0 || self.task_timeout_ms == 0 {
            return Err(
                BridgeError::Config("intervals must be greater than zero".to_string()).into(),
            );
        }
        Ok(())
    }
}

/// All filesystem locations one worker touches, resolved and base-checked
/// up front so no later path math handles untrusted names.
#[derive(Debug, Clone)]
pub struct Layout {
    pub tasks_dir: PathBuf,
    pub inbox_path: PathBuf,
    pub inbox_cursor_path: PathBuf,
    pub outbox_path: PathBuf,
    pub signal_path: PathBuf,
    pub heartbeat_path: PathBuf,
    pub prompts_dir: PathBuf,
    pub outputs_dir: PathBuf,
}

impl Layout {
    pub fn resolve(state_root: &Path, config: &BridgeConfig) -> anyhow::Result<Self> {
        let team = sanitize::sanitize_name(&config.team_name)?;
        let worker = sanitize::sanitize_name(&config.worker_name)?;

        fsio::ensure_dir(state_root)?;
        let state_root = state_root
            .canonicalize()
            .with_context(|| format!("resolving {}", state_root.display()))?;

        let tasks_dir = state_root.join("tasks").join(&team);
        let team_dir = state_root.join("teams").join(&team);
        let inbox_dir = team_dir.join("inbox");
        let outbox_dir = team_dir.join("outbox");
        let signals_dir = team_dir.join("signals");
        let heartbeats_dir = team_dir.join("heartbeats");
        for dir in [
            &tasks_dir,
            &inbox_dir,
            &outbox_dir,
            &signals_dir,
            &heartbeats_dir,
        ] {
            sanitize::ensure_within(dir, &state_root)?;
            fsio::ensure_dir(dir)?;
        }

        // Heartbeats are keyed by (working directory, team, worker) so two
        // daemons for the same worker in different checkouts stay distinct.
        let wd_slug = sanitize::sanitize_name(&config.working_directory.to_string_lossy())?;
        let heartbeat_path =
            sanitize::ensure_within(&heartbeats_dir.join(format!("{wd_slug}--{worker}")), &state_root)?;

        let omc_dir = config.working_directory.join(".omc");
        let prompts_dir = omc_dir.join("prompts");
        let outputs_dir = omc_dir.join("outputs");
        for dir in [&prompts_dir, &outputs_dir] {
            fsio::ensure_dir(dir)?;
            sanitize::ensure_within(dir, &config.working_directory)?;
        }

        Ok(Self {
            inbox_path: sanitize::ensure_within(&inbox_dir.join(&worker), &state_root)?,
            inbox_cursor_path: sanitize::ensure_within(
                &inbox_dir.join(format!("{worker}.offset")),
                &state_root,
            )?,
            outbox_path: sanitize::ensure_within(&outbox_dir.join(&worker), &state_root)?,
            signal_path: sanitize::ensure_within(
                &signals_dir.join(format!("{worker}.shutdown")),
                &state_root,
            )?,
            heartbeat_path,
            tasks_dir,
            prompts_dir,
            outputs_dir,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json(wd: &str) -> String {
        format!(
            r#"{{
                "teamName": "backend",
                "workerName": "worker-1",
                "provider": "gemini",
                "workingDirectory": "{wd}"
            }}"#
        )
    }

    #[test]
    fn parse_applies_defaults() {
        let config = BridgeConfig::parse(&minimal_json("/tmp/x")).unwrap();
        assert_eq!(config.poll_interval_ms, 3000);
        assert_eq!(config.task_timeout_ms, 600_000);
        assert_eq!(config.max_consecutive_errors, 3);
        assert_eq!(config.outbox_max_lines, 500);
        assert_eq!(config.max_retries, 5);
        assert!(config.model.is_none());
        assert!(config.provider_bin.is_none());
    }

    #[test]
    fn parse_rejects_unknown_provider() {
        let json = r#"{
            "teamName": "t", "workerName": "w",
            "provider": "claude", "workingDirectory": "/tmp"
        }"#;
        let err = BridgeConfig::parse(json).unwrap_err();
        assert!(err.to_string().contains("invalid config"));
    }

    #[test]
    fn parse_rejects_missing_fields() {
        assert!(BridgeConfig::parse(r#"{"teamName": "t"}"#).is_err());
        assert!(BridgeConfig::parse("not json").is_err());
    }

    #[test]
    fn parse_reads_overrides() {
        let json = r#"{
            "teamName": "t", "workerName": "w",
            "provider": "codex", "workingDirectory": "/tmp",
            "model": "o4-mini", "pollIntervalMs": 100,
            "taskTimeoutMs": 5000, "maxConsecutiveErrors": 7,
            "outboxMaxLines": 12, "maxRetries": 1
        }"#;
        let config = BridgeConfig::parse(json).unwrap();
        assert_eq!(config.provider, Provider::Codex);
        assert_eq!(config.model.as_deref(), Some("o4-mini"));
        assert_eq!(config.poll_interval_ms, 100);
        assert_eq!(config.max_retries, 1);
    }

    #[test]
    fn layout_builds_team_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let wd = tmp.path().join("repo");
        std::fs::create_dir_all(wd.join(".git")).unwrap();
        let config = BridgeConfig::parse(&minimal_json(&wd.to_string_lossy())).unwrap();

        let root = tmp.path().join("state");
        let layout = Layout::resolve(&root, &config).unwrap();

        assert!(layout.tasks_dir.ends_with("tasks/backend"));
        assert!(layout.inbox_path.ends_with("teams/backend/inbox/worker-1"));
        assert!(layout
            .inbox_cursor_path
            .ends_with("teams/backend/inbox/worker-1.offset"));
        assert!(layout
            .signal_path
            .ends_with("teams/backend/signals/worker-1.shutdown"));
        assert!(layout.prompts_dir.is_dir());
        assert!(layout.outputs_dir.is_dir());
        assert!(layout.inbox_path.parent().unwrap().is_dir());
    }

    #[test]
    fn layout_rejects_traversal_in_names() {
        let tmp = tempfile::tempdir().unwrap();
        let wd = tmp.path().join("repo");
        std::fs::create_dir_all(wd.join(".git")).unwrap();
        let mut config = BridgeConfig::parse(&minimal_json(&wd.to_string_lossy())).unwrap();
        config.team_name = "../escape".to_string();

        // The sanitizer rewrites the name, so the layout stays inside the
        // state root rather than walking out of it.
        let layout = Layout::resolve(&tmp.path().join("state"), &config).unwrap();
        assert!(layout.tasks_dir.ends_with("tasks/..-escape"));
        assert!(layout
            .tasks_dir
            .starts_with(tmp.path().join("state").canonicalize().unwrap()));
    }
}
