use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use crate::error::BridgeError;

/// Characters that survive sanitization unchanged. Everything here is safe
/// both as a filename component and as a tmux session token.
fn is_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'
}

/// Normalize an untrusted identifier (team name, worker name, path slug)
/// into the safe class: unsafe characters become dashes, dash runs
/// collapse, and leading/trailing dashes are trimmed.
///
/// Idempotent: `sanitize_name(sanitize_name(x)) == sanitize_name(x)`.
pub fn sanitize_name(raw: &str) -> Result<String, BridgeError> {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if is_safe(c) {
            out.push(c);
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }

    // Collapse runs that formed around pre-existing dashes, then trim.
    let mut collapsed = String::with_capacity(out.len());
    for c in out.chars() {
        if c == '-' && collapsed.ends_with('-') {
            continue;
        }
        collapsed.push(c);
    }
    let trimmed = collapsed.trim_matches('-');

    if trimmed.is_empty() {
        return Err(BridgeError::UnsafeName(raw.to_string()));
    }
    Ok(trimmed.to_string())
}

fn task_id_pattern() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^[A-Za-z0-9._-]+$").unwrap())
}

/// Task ids become filename stems, so they get the strict full-match check
/// rather than best-effort normalization.
pub fn validate_task_id(id: &str) -> Result<(), BridgeError> {
    if task_id_pattern().is_match(id) {
        Ok(())
    } else {
        Err(BridgeError::InvalidTaskId(id.to_string()))
    }
}

/// Resolve symlinks in `path` even when its tail does not exist yet: the
/// deepest existing ancestor is canonicalized and the remaining components
/// are re-appended. `..` and `.` in the unresolved tail are rejected.
fn resolve_lexical(path: &Path) -> anyhow::Result<PathBuf> {
    if let Ok(real) = path.canonicalize() {
        return Ok(real);
    }
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("cannot resolve {}", path.display()))?;
    let name = path
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("cannot resolve {}: trailing '..'", path.display()))?;
    let mut resolved = resolve_lexical(parent)?;
    resolved.push(name);
    Ok(resolved)
}

/// Check that `candidate` lies strictly within `base` after symlink
/// resolution, and return the resolved path. Both must be absolute.
pub fn ensure_within(candidate: &Path, base: &Path) -> anyhow::Result<PathBuf> {
    let escape = || BridgeError::PathEscape {
        path: candidate.to_path_buf(),
        base: base.to_path_buf(),
    };

    if !candidate.is_absolute() || !base.is_absolute() {
        return Err(escape().into());
    }
    // Reject dot segments before resolution; canonicalize would silently
    // fold an existing `..` away instead of flagging it.
    if candidate
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::CurDir))
    {
        return Err(escape().into());
    }

    let base = base
        .canonicalize()
        .map_err(|e| anyhow::anyhow!("resolving base {}: {e}", base.display()))?;
    let resolved = resolve_lexical(candidate)?;

    let rel = resolved.strip_prefix(&base).map_err(|_| escape())?;
    if rel.as_os_str().is_empty() {
        return Err(escape().into());
    }
    for component in rel.components() {
        match component {
            Component::Normal(_) => {}
            _ => return Err(escape().into()),
        }
    }
    Ok(resolved)
}
