use std::path::{Component, Path, PathBuf};

use crate::error::{Result, TxError};

/// Resolve a user-supplied path against the project root, rejecting anything
/// that would land outside it: `..` segments, absolute paths escaping the
/// root, and embedded NUL bytes.
pub fn confine(root: &Path, candidate: &str) -> Result<PathBuf> {
    if candidate.bytes().any(|b| b == 0) {
        return Err(TxError::PathOutsideRoot(candidate.replace('\0', "\\0")));
    }

    let candidate_path = Path::new(candidate);
    for component in candidate_path.components() {
        if matches!(component, Component::ParentDir) {
            return Err(TxError::PathOutsideRoot(candidate.to_string()));
        }
    }

    let resolved = if candidate_path.is_absolute() {
        normalize(candidate_path)
    } else {
        normalize(&root.join(candidate_path))
    };

    let root = normalize(root);
    if !resolved.starts_with(&root) {
        return Err(TxError::PathOutsideRoot(candidate.to_string()));
    }
    Ok(resolved)
}

/// Lexical normalization: drops `.` components and resolves `..` against the
/// accumulated prefix without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> PathBuf {
        PathBuf::from("/srv/project")
    }

    #[test]
    fn relative_paths_resolve_under_root() {
        let resolved = confine(&root(), ".tx/tasks.jsonl").unwrap();
        assert_eq!(resolved, PathBuf::from("/srv/project/.tx/tasks.jsonl"));
    }

    #[test]
    fn absolute_path_inside_root_is_allowed() {
        let resolved = confine(&root(), "/srv/project/logs/run.log").unwrap();
        assert_eq!(resolved, PathBuf::from("/srv/project/logs/run.log"));
    }

    #[test]
    fn parent_traversal_is_rejected() {
        let err = confine(&root(), "../outside").unwrap_err();
        assert_eq!(err.code(), "path_outside_root");

        let err = confine(&root(), "inner/../../../etc/passwd").unwrap_err();
        assert_eq!(err.code(), "path_outside_root");
    }

    #[test]
    fn absolute_escape_is_rejected() {
        let err = confine(&root(), "/etc/passwd").unwrap_err();
        assert_eq!(err.code(), "path_outside_root");

        // Sibling directory sharing the root's prefix.
        let err = confine(&root(), "/srv/project-other/file").unwrap_err();
        assert_eq!(err.code(), "path_outside_root");
    }

    #[test]
    fn nul_bytes_are_rejected() {
        let err = confine(&root(), "inno\0cent").unwrap_err();
        assert_eq!(err.code(), "path_outside_root");
    }

    #[test]
    fn dot_segments_are_dropped() {
        let resolved = confine(&root(), "./a/./b").unwrap();
        assert_eq!(resolved, PathBuf::from("/srv/project/a/b"));
    }
}
