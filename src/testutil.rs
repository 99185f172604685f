use std::{
    collections::{HashMap, HashSet},
    fs::File,
    io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::{
    config::RestoreConfig,
    error::{ErrorPolicy, RestoreError, Result, abort_on_all_errors},
    index::{Blob, BlobHandle, BlobId, BlobType, MemoryIndex, PackId},
    loader::{BlobLoader, BlobSink},
    progress::{FileAction, Progress},
    restorer::{Context, FileRestorer},
    writer::{FileHandle, FileWriter, LocalFileWriter},
};

pub(crate) const ZERO_CHUNK_SIZE: u32 = 8;

/// Packs built from literal blob contents.
#[derive(Default)]
pub(crate) struct TestRepo {
    index: MemoryIndex,
    packs: HashMap<PackId, HashMap<BlobId, (Blob, Vec<u8>)>>,
}

impl TestRepo {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn ids(blobs: &[&[u8]]) -> Vec<BlobId> {
        blobs.iter().map(|data| BlobId::hash(data)).collect()
    }

    /// Adds a pack named `name` holding `blobs` back to back.
    pub(crate) fn pack(&mut self, name: &str, blobs: &[&[u8]]) -> PackId {
        let pack_id = PackId::hash(name.as_bytes());
        let pack = self.packs.entry(pack_id).or_default();

        let mut offset = 0u64;
        for data in blobs {
            let blob = Blob {
                handle: BlobHandle {
                    id: BlobId::hash(data),
                    kind: BlobType::Data,
                },
                offset,
                length: data.len() as u32,
            };
            offset += data.len() as u64;

            self.index.insert(pack_id, blob);
            pack.insert(blob.id(), (blob, data.to_vec()));
        }

        pack_id
    }
}

type DeliverHook = Arc<dyn Fn(&BlobId) + Send + Sync>;

/// Serves packs from memory, optionally failing some blobs.
#[derive(Default)]
pub(crate) struct MemoryLoader {
    packs: HashMap<PackId, HashMap<BlobId, (Blob, Vec<u8>)>>,
    calls: Mutex<Vec<(PackId, Vec<BlobId>)>>,
    fail: Mutex<HashSet<BlobId>>,
    abort: Mutex<HashSet<BlobId>>,
    hook: Mutex<Option<DeliverHook>>,
}

impl MemoryLoader {
    pub(crate) fn calls(&self) -> Vec<(PackId, Vec<BlobId>)> {
        self.calls.lock().unwrap().clone()
    }

    /// The blob is delivered as corrupt.
    pub(crate) fn fail_blob(&self, id: BlobId) {
        self.fail.lock().unwrap().insert(id);
    }

    /// The load stops with an error when it reaches the blob.
    pub(crate) fn abort_at(&self, id: BlobId) {
        self.abort.lock().unwrap().insert(id);
    }

    /// Runs before every delivery.
    pub(crate) fn on_deliver(&self, hook: impl Fn(&BlobId) + Send + Sync + 'static) {
        *self.hook.lock().unwrap() = Some(Arc::new(hook));
    }
}

#[async_trait]
impl BlobLoader for MemoryLoader {
    async fn load_blobs(
        &self,
        pack_id: PackId,
        mut blobs: Vec<Blob>,
        sink: &mut dyn BlobSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        blobs.sort_by_key(|blob| blob.offset);
        self.calls
            .lock()
            .unwrap()
            .push((pack_id, blobs.iter().map(|b| b.id()).collect()));

        let pack = self.packs.get(&pack_id).ok_or_else(|| {
            RestoreError::pack_load(pack_id, io::ErrorKind::NotFound.into())
        })?;

        for blob in blobs {
            if cancel.is_cancelled() {
                return Err(RestoreError::Cancelled);
            }
            if self.abort.lock().unwrap().contains(&blob.id()) {
                return Err(RestoreError::pack_load(
                    pack_id,
                    io::Error::other("connection reset"),
                ));
            }

            let hook = self.hook.lock().unwrap().clone();
            if let Some(hook) = hook {
                hook(&blob.id());
            }

            let data = if self.fail.lock().unwrap().contains(&blob.id()) {
                Err(RestoreError::CorruptBlob(blob.id()))
            } else {
                pack.get(&blob.id())
                    .map(|(_, data)| data.clone())
                    .ok_or(RestoreError::UnknownBlob(blob.id()))
            };
            sink.deliver(blob.handle, data).await?;
        }

        Ok(())
    }
}

/// Writes to disk like [`LocalFileWriter`] and records every call.
#[derive(Default)]
pub(crate) struct RecordingWriter {
    inner: LocalFileWriter,
    creates: Mutex<Vec<(PathBuf, u64, bool)>>,
    opens: Mutex<Vec<PathBuf>>,
    writes: Mutex<Vec<(PathBuf, u64, usize)>>,
    handles: Mutex<Vec<Weak<File>>>,
    failing: Mutex<HashSet<String>>,
    create_delay: Mutex<Option<Duration>>,
}

impl RecordingWriter {
    pub(crate) fn creates(&self) -> Vec<(PathBuf, u64, bool)> {
        self.creates.lock().unwrap().clone()
    }

    pub(crate) fn opens(&self) -> Vec<PathBuf> {
        self.opens.lock().unwrap().clone()
    }

    /// Handles handed out that still hold their file open.
    pub(crate) fn open_files(&self) -> usize {
        self.handles
            .lock()
            .unwrap()
            .iter()
            .filter(|handle| handle.strong_count() > 0)
            .count()
    }

    fn track(&self, handle: io::Result<FileHandle>) -> io::Result<FileHandle> {
        if let Ok(handle) = &handle {
            let mut handles = self.handles.lock().unwrap();
            handles.retain(|h| h.strong_count() > 0);
            handles.push(handle.downgrade());
        }
        handle
    }

    pub(crate) fn writes(&self) -> Vec<(PathBuf, u64, usize)> {
        self.writes.lock().unwrap().clone()
    }

    /// Writes to files named `name` fail.
    pub(crate) fn fail_writes_to(&self, name: &str) {
        self.failing.lock().unwrap().insert(name.to_string());
    }

    /// Slows down creation to widen races between first writers.
    pub(crate) fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl FileWriter for RecordingWriter {
    async fn create(&self, path: &Path, size: u64, sparse: bool) -> io::Result<FileHandle> {
        self.creates
            .lock()
            .unwrap()
            .push((path.to_path_buf(), size, sparse));

        let delay = *self.create_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let handle = self.inner.create(path, size, sparse).await;
        self.track(handle)
    }

    async fn open(&self, path: &Path) -> io::Result<FileHandle> {
        self.opens.lock().unwrap().push(path.to_path_buf());
        let handle = self.inner.open(path).await;
        self.track(handle)
    }

    async fn write_at(
        &self,
        handle: &FileHandle,
        data: Arc<[u8]>,
        offset: u64,
        sparse: bool,
    ) -> io::Result<()> {
        let path = handle.path().to_path_buf();
        self.writes
            .lock()
            .unwrap()
            .push((path.clone(), offset, data.len()));

        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if self.failing.lock().unwrap().contains(name) {
            return Err(io::Error::other("injected write failure"));
        }

        self.inner.write_at(handle, data, offset, sparse).await
    }
}

#[derive(Default)]
pub(crate) struct CollectProgress {
    events: Mutex<Vec<(PathBuf, FileAction, u64, u64)>>,
}

impl CollectProgress {
    pub(crate) fn events(&self) -> Vec<(PathBuf, FileAction, u64, u64)> {
        self.events.lock().unwrap().clone()
    }
}

impl Progress for CollectProgress {
    fn add_progress(&self, location: &Path, action: FileAction, bytes_written: u64, total: u64) {
        self.events
            .lock()
            .unwrap()
            .push((location.to_path_buf(), action, bytes_written, total));
    }
}

pub(crate) type CollectedErrors = Arc<Mutex<Vec<(PathBuf, RestoreError)>>>;

/// A policy that records every error and lets the restore continue.
pub(crate) fn collect_errors() -> (ErrorPolicy, CollectedErrors) {
    let errors = CollectedErrors::default();
    let sink = errors.clone();
    let policy: ErrorPolicy = Arc::new(move |location: &Path, err: RestoreError| {
        sink.lock().unwrap().push((location.to_path_buf(), err));
        Ok(())
    });
    (policy, errors)
}

/// A destination directory plus in-memory collaborators.
pub(crate) struct TestEnv {
    pub(crate) dir: TempDir,
    pub(crate) index: Arc<MemoryIndex>,
    pub(crate) loader: Arc<MemoryLoader>,
    pub(crate) writer: Arc<RecordingWriter>,
    pub(crate) progress: Arc<CollectProgress>,
}

impl TestEnv {
    pub(crate) fn new() -> Self {
        Self::with_repo(TestRepo::new())
    }

    pub(crate) fn with_repo(repo: TestRepo) -> Self {
        let TestRepo { index, packs } = repo;
        Self {
            dir: tempfile::tempdir().unwrap(),
            index: Arc::new(index),
            loader: Arc::new(MemoryLoader {
                packs,
                ..MemoryLoader::default()
            }),
            writer: Arc::new(RecordingWriter::default()),
            progress: Arc::new(CollectProgress::default()),
        }
    }

    pub(crate) fn context(&self) -> Context {
        Context {
            index: self.index.clone(),
            loader: self.loader.clone(),
            writer: self.writer.clone(),
            progress: self.progress.clone(),
            error_policy: abort_on_all_errors(),
            dst: self.dir.path().to_path_buf(),
            zero_chunk: BlobId::zero_chunk(ZERO_CHUNK_SIZE),
            sparse: false,
        }
    }

    pub(crate) fn restorer(&self, config: &RestoreConfig) -> FileRestorer {
        FileRestorer::new(
            self.dir.path(),
            self.loader.clone(),
            self.index.clone(),
            config,
            BlobId::zero_chunk(ZERO_CHUNK_SIZE),
        )
        .with_writer(self.writer.clone())
        .with_progress(self.progress.clone())
    }
}
