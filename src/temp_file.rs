//! Delete-on-drop guard for partial files.
//!
//! A guard is armed when created and removes its file on drop unless
//! `defuse` was called after the file was committed (renamed away).

use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            armed: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Disarm the guard after the temp file was renamed to its final path.
    pub fn defuse(mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %self.path.display(), error = %e, "failed to remove temp file");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn drop_removes_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(".frame.part.0.0");
        fs::write(&path, b"partial").unwrap();

        let guard = TempFileGuard::new(&path);
        drop(guard);

        assert!(!path.exists());
    }

    #[test]
    fn defuse_keeps_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(".frame.part.0.1");
        fs::write(&path, b"complete").unwrap();

        let guard = TempFileGuard::new(&path);
        guard.defuse();

        assert!(path.exists());
    }

    #[test]
    fn drop_on_missing_file_is_silent() {
        let guard = TempFileGuard::new("/nonexistent/.x.part.0.2");
        drop(guard);
    }
}
