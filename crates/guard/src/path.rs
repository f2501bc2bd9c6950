//! Workspace path confinement.
//!
//! Resolution order: lexical normalization, join against the workspace
//! root, symlink resolution (of the deepest existing prefix, so paths that
//! don't exist yet are still checked), then an NFC + case-folded prefix
//! comparison against the workspace root.

use std::path::{Component, Path, PathBuf};

use unicode_normalization::UnicodeNormalization;

use crate::GuardError;

/// Confines file operations to a session workspace.
#[derive(Debug, Clone)]
pub struct PathGuard {
    workspace: Option<PathBuf>,
}

impl PathGuard {
    /// Build a guard for a workspace root. The root itself is canonicalized
    /// once so later prefix checks compare real paths on both sides.
    pub fn new(workspace: Option<PathBuf>) -> Self {
        let workspace = workspace.map(|w| w.canonicalize().unwrap_or(w));
        Self { workspace }
    }

    /// Guard with no workspace: rejects every file operation.
    #[must_use]
    pub fn none() -> Self {
        Self { workspace: None }
    }

    /// The canonicalized workspace root, if one is configured.
    #[must_use]
    pub fn workspace(&self) -> Option<&Path> {
        self.workspace.as_deref()
    }

    /// Resolve `input` to a real path inside the workspace, or reject.
    pub fn resolve(&self, input: &str) -> Result<PathBuf, GuardError> {
        let Some(workspace) = &self.workspace else {
            return Err(GuardError::NoWorkspace);
        };

        if input.is_empty() {
            return Err(GuardError::InvalidPath {
                path: input.to_string(),
                reason: "empty path".to_string(),
            });
        }

        let candidate = Path::new(input);
        let joined = if candidate.is_absolute() {
            normalize_lexically(candidate)
        } else {
            normalize_lexically(&workspace.join(candidate))
        };

        let real = resolve_symlinks(&joined);

        if path_within(&real, workspace) {
            Ok(real)
        } else {
            Err(GuardError::OutsideWorkspace(input.to_string()))
        }
    }

    /// True when any workspace is configured at all.
    #[must_use]
    pub fn has_workspace(&self) -> bool {
        self.workspace.is_some()
    }
}

/// Collapse `.` and `..` components without touching the filesystem.
/// `..` at the root stays at the root rather than underflowing.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {},
            Component::ParentDir => {
                if !out.pop() {
                    out.push(Component::RootDir.as_os_str());
                }
            },
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Canonicalize the deepest existing ancestor, then re-append the
/// remaining (not-yet-created) components. A symlink anywhere in the
/// existing part is therefore resolved before the prefix check.
fn resolve_symlinks(path: &Path) -> PathBuf {
    if let Ok(real) = path.canonicalize() {
        return real;
    }

    let mut existing = path.to_path_buf();
    let mut suffix: Vec<std::ffi::OsString> = Vec::new();
    while !existing.exists() {
        match (existing.file_name(), existing.parent()) {
            (Some(name), Some(parent)) => {
                suffix.push(name.to_os_string());
                existing = parent.to_path_buf();
            },
            _ => return path.to_path_buf(),
        }
    }

    let mut real = existing.canonicalize().unwrap_or(existing);
    for part in suffix.into_iter().rev() {
        real.push(part);
    }
    real
}

/// NFC-normalized, case-folded string form used for comparison only.
fn comparable(path: &Path) -> String {
    path.to_string_lossy().nfc().collect::<String>().to_lowercase()
}

/// `path == root` or `path` starts with `root` + separator, compared in
/// NFC + lowercase so decomposed or differently-cased spellings cannot
/// slip past the prefix check.
fn path_within(path: &Path, root: &Path) -> bool {
    let p = comparable(path);
    let r = comparable(root);
    p == r || p.starts_with(&format!("{r}{}", std::path::MAIN_SEPARATOR))
}
