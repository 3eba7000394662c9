//! Filesystem root used for /proc access

use std::path::{Path, PathBuf};

/// Resolves paths under a configurable root, so a containerized view of the
/// host (`/hostfs`) or a test fixture tree can stand in for `/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostFs {
    root: PathBuf,
}

impl HostFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether a non-default root is configured.
    pub fn is_overridden(&self) -> bool {
        self.root != Path::new("/")
    }

    pub fn join(&self, rel: impl AsRef<Path>) -> PathBuf {
        let rel = rel.as_ref();
        self.root.join(rel.strip_prefix("/").unwrap_or(rel))
    }

    pub fn proc_path(&self, pid: u32, file: &str) -> PathBuf {
        self.join(format!("proc/{}/{}", pid, file))
    }
}

impl Default for HostFs {
    fn default() -> Self {
        Self::new("/")
    }
}
