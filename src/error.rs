use std::{io, path::PathBuf, sync::Arc};

use thiserror::Error;

use crate::index::{BlobId, PackId};

#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum RestoreError {
    /// The index has no pack for a blob referenced by a file. The index is
    /// inconsistent, nothing sensible can be restored from it.
    #[error("unknown blob {0}")]
    UnknownBlob(BlobId),

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: Arc<io::Error>,
    },

    #[error("loading pack {pack}: {source}")]
    PackLoad { pack: PackId, source: Arc<io::Error> },

    #[error("blob {0} does not match its id")]
    CorruptBlob(BlobId),

    #[error("task failed: {0}")]
    Task(String),

    #[error("context canceled")]
    Cancelled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

pub type Result<T> = std::result::Result<T, RestoreError>;

impl RestoreError {
    pub fn io(path: impl Into<PathBuf>, err: io::Error) -> Self {
        RestoreError::Io {
            path: path.into(),
            source: Arc::new(err),
        }
    }

    pub fn pack_load(pack: PackId, err: io::Error) -> Self {
        RestoreError::PackLoad {
            pack,
            source: Arc::new(err),
        }
    }

    /// Cancellation and deadline errors mean the caller no longer wants any
    /// work done. They are never subject to an error policy.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, RestoreError::Cancelled | RestoreError::DeadlineExceeded)
    }
}

impl From<io::Error> for RestoreError {
    fn from(err: io::Error) -> Self {
        RestoreError::io(PathBuf::new(), err)
    }
}

impl From<tokio::task::JoinError> for RestoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            RestoreError::Cancelled
        } else {
            RestoreError::Task(err.to_string())
        }
    }
}

/// Decides what happens to a per-file failure. Returning `Ok(())` records the
/// file as failed and lets the restore continue; returning an error aborts
/// the whole restore with it.
pub type ErrorPolicy =
    Arc<dyn Fn(&std::path::Path, RestoreError) -> Result<()> + Send + Sync>;

pub fn abort_on_all_errors() -> ErrorPolicy {
    Arc::new(|_, err| Err(err))
}
