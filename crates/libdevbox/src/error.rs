use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DevboxError {
    #[error("config error: {0}")]
    Config(String),

    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("backup failed: {0}")]
    Backup(String),

    #[error("activity probe failed: {0}")]
    Probe(String),

    #[error("provisioning failed: {0}")]
    Provision(String),

    #[error("session task failed: {0}")]
    Task(String),
}

impl DevboxError {
    pub fn config(msg: impl Into<String>) -> Self {
        DevboxError::Config(msg.into())
    }

    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        DevboxError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// True for filesystem failures that will not go away by moving on to
    /// the next item: permission denied, out of space, read-only mounts.
    pub fn is_unrecoverable(&self) -> bool {
        match self {
            DevboxError::Io { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::PermissionDenied
                    | io::ErrorKind::StorageFull
                    | io::ErrorKind::ReadOnlyFilesystem
            ),
            _ => false,
        }
    }
}

pub type Result<T, E = DevboxError> = std::result::Result<T, E>;

/// Attach a path to a bare `io::Error`.
pub(crate) trait IoContext<T> {
    fn at(self, path: &Path) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn at(self, path: &Path) -> Result<T> {
        self.map_err(|source| DevboxError::io(path, source))
    }
}
