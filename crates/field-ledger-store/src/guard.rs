use std::path::{Component, Path, PathBuf};

use field_ledger_core::LedgerError;

/// Validate that `candidate` stays inside `root` and return its
/// normalized absolute form.
///
/// Two checks: the lexically normalized candidate must sit under the
/// normalized root (catches `..` traversal), and the nearest existing
/// ancestor of the candidate, resolved through symlinks, must sit under
/// the resolved root (catches symlink escapes for targets that do not
/// exist yet).
///
/// # Errors
/// Returns [`LedgerError::BoundaryViolation`] on any escape; this error is
/// security-critical and is never retried.
pub fn assert_within_root(root: &Path, candidate: &Path) -> Result<PathBuf, LedgerError> {
    let root_abs = normalize(&absolutize(root)?);
    let candidate_abs = normalize(&absolutize(candidate)?);

    if !candidate_abs.starts_with(&root_abs) {
        return Err(LedgerError::BoundaryViolation(format!(
            "'{}' escapes workspace root '{}'",
            candidate.display(),
            root.display()
        )));
    }

    let resolved_root = root_abs.canonicalize().unwrap_or_else(|_| root_abs.clone());
    if let Some(ancestor) = nearest_existing_ancestor(&candidate_abs) {
        let resolved = ancestor
            .canonicalize()
            .map_err(|e| LedgerError::Storage(format!("cannot resolve '{}': {e}", ancestor.display())))?;
        // Re-append the not-yet-existing tail so the containment check
        // covers the full target path.
        let tail = candidate_abs
            .strip_prefix(&ancestor)
            .unwrap_or_else(|_| Path::new(""));
        if !resolved.join(tail).starts_with(&resolved_root) {
            return Err(LedgerError::BoundaryViolation(format!(
                "'{}' resolves outside workspace root '{}'",
                candidate.display(),
                root.display()
            )));
        }
    }

    Ok(candidate_abs)
}

fn absolutize(path: &Path) -> Result<PathBuf, LedgerError> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir()
        .map_err(|e| LedgerError::Storage(format!("cannot resolve working directory: {e}")))?;
    Ok(cwd.join(path))
}

/// Lexical normalization: drops `.` and resolves `..` against the path
/// itself without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

fn nearest_existing_ancestor(path: &Path) -> Option<PathBuf> {
    path.ancestors().find(|a| a.exists()).map(Path::to_path_buf)
}
