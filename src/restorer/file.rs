use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio::sync::Mutex;
use tracing::trace;

use crate::{
    error::{RestoreError, Result},
    index::{BlobId, PackId},
    progress::FileAction,
    restorer::Context,
    state::FileState,
    writer::FileHandle,
};

/// Files with more blobs than this keep a per-pack list of their blobs
/// instead of the plain id list, so downloading a pack does not have to look
/// up every blob of the file again.
pub(crate) const LARGE_FILE_BLOB_COUNT: usize = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FileBlobInfo {
    pub(crate) id: BlobId,
    /// Offset of the blob in the file.
    pub(crate) offset: u64,
}

pub(crate) enum FileBlobs {
    Ids(Vec<BlobId>),
    /// Only the blobs still to fetch, grouped by pack.
    Packs(HashMap<PackId, Vec<FileBlobInfo>>),
}

/// Lifecycle of a target file. The handle is only kept while writes to the
/// file are in flight, so files waiting for later packs hold no descriptor.
enum Creation {
    Pending,
    Open { handle: FileHandle, writers: usize },
    Closed,
    Failed,
}

/// A regular file being restored.
pub(crate) struct FileInfo {
    /// Location relative to the restore root.
    pub(crate) location: PathBuf,
    pub(crate) size: u64,
    pub(crate) sparse: bool,
    pub(crate) blobs: FileBlobs,
    pub(crate) state: Option<Arc<dyn FileState>>,
    creation: Mutex<Creation>,
}

impl FileInfo {
    pub(crate) fn new(
        location: PathBuf,
        size: u64,
        sparse: bool,
        blobs: FileBlobs,
        state: Option<Arc<dyn FileState>>,
    ) -> Self {
        Self {
            location,
            size,
            sparse,
            blobs,
            state,
            creation: Mutex::new(Creation::Pending),
        }
    }

    pub(crate) fn has_matching_blob(&self, index: usize) -> bool {
        self.state
            .as_ref()
            .is_some_and(|state| state.has_matching_blob(index))
    }

    fn action(&self) -> FileAction {
        if self.state.is_some() {
            FileAction::Updated
        } else {
            FileAction::Restored
        }
    }
}

impl Context {
    /// Writes one blob into `file`. The first writer creates the file while
    /// holding its lock; everyone else only takes the lock to read the handle.
    pub(crate) async fn write_to_file(
        &self,
        file: &FileInfo,
        data: Arc<[u8]>,
        offset: u64,
    ) -> Result<()> {
        let result = self.write_blob(file, data.clone(), offset).await;
        self.progress
            .add_progress(&file.location, file.action(), data.len() as u64, file.size);
        result
    }

    async fn write_blob(&self, file: &FileInfo, data: Arc<[u8]>, offset: u64) -> Result<()> {
        let target = self.target_path(&file.location);
        let handle = self.acquire(file, &target).await?;

        let result = self
            .writer
            .write_at(&handle, data, offset, file.sparse)
            .await
            .map_err(|e| RestoreError::io(&target, e));
        drop(handle);

        self.release(file).await;
        result
    }

    /// Returns a handle for one more write, creating the file on first use
    /// and reopening it when every earlier writer has finished.
    async fn acquire(&self, file: &FileInfo, target: &Path) -> Result<FileHandle> {
        let mut creation = file.creation.lock().await;

        let opened = match &mut *creation {
            Creation::Open { handle, writers } => {
                *writers += 1;
                return Ok(handle.clone());
            }
            Creation::Failed => {
                return Err(RestoreError::io(
                    target,
                    io::Error::other("file could not be created"),
                ));
            }
            Creation::Pending => match self.writer.create(target, file.size, file.sparse).await {
                Ok(handle) => {
                    trace!(location = %file.location.display(), size = file.size, sparse = file.sparse, "file created");
                    handle
                }
                Err(e) => {
                    *creation = Creation::Failed;
                    return Err(RestoreError::io(target, e));
                }
            },
            Creation::Closed => self
                .writer
                .open(target)
                .await
                .map_err(|e| RestoreError::io(target, e))?,
        };

        *creation = Creation::Open {
            handle: opened.clone(),
            writers: 1,
        };
        Ok(opened)
    }

    /// Ends one write. The last writer out closes the file.
    async fn release(&self, file: &FileInfo) {
        let mut creation = file.creation.lock().await;
        if let Creation::Open { writers, .. } = &mut *creation {
            *writers -= 1;
            if *writers == 0 {
                *creation = Creation::Closed;
            }
        }
    }

    pub(crate) async fn restore_empty_file(&self, location: &Path) -> Result<()> {
        let target = self.target_path(location);
        let handle = self
            .writer
            .create(&target, 0, false)
            .await
            .map_err(|e| RestoreError::io(&target, e))?;
        drop(handle);

        self.progress
            .add_progress(location, FileAction::Restored, 0, 0);
        Ok(())
    }
}
