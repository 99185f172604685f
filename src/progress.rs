use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAction {
    /// The file did not exist before.
    Restored,
    /// The file existed and only differing parts were rewritten.
    Updated,
}

pub trait Progress: Send + Sync {
    fn add_progress(&self, location: &Path, action: FileAction, bytes_written: u64, total: u64);
}

pub struct NoProgress;

impl Progress for NoProgress {
    fn add_progress(&self, _: &Path, _: FileAction, _: u64, _: u64) {}
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProgressCounts {
    pub bytes_written: u64,
    pub files_restored: u64,
    pub files_updated: u64,
}

/// Counts written bytes and touched files. Every file is counted once, on
/// the first progress event reported for it.
#[derive(Debug, Default)]
pub struct RestoreProgress {
    bytes_written: AtomicU64,
    files_restored: AtomicU64,
    files_updated: AtomicU64,
    seen: Mutex<HashSet<PathBuf>>,
}

impl RestoreProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counts(&self) -> ProgressCounts {
        ProgressCounts {
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            files_restored: self.files_restored.load(Ordering::Relaxed),
            files_updated: self.files_updated.load(Ordering::Relaxed),
        }
    }
}

impl Progress for RestoreProgress {
    fn add_progress(&self, location: &Path, action: FileAction, bytes_written: u64, total: u64) {
        trace!(location = %location.display(), ?action, bytes_written, total, "progress");
        self.bytes_written.fetch_add(bytes_written, Ordering::Relaxed);

        let first = {
            let mut seen = match self.seen.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            seen.insert(location.to_path_buf())
        };
        if !first {
            return;
        }

        let counter = match action {
            FileAction::Restored => &self.files_restored,
            FileAction::Updated => &self.files_updated,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
