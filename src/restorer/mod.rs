//! Restores regular files from packed, deduplicated blobs.
//!
//! Planning groups files by the packs holding their blobs. Every pack is then
//! fetched exactly once by one of a fixed number of workers, and each blob read
//! from it is written to every place it is used in every file.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio::{
    sync::{mpsc, oneshot},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::{
    config::RestoreConfig,
    error::{ErrorPolicy, RestoreError, Result, abort_on_all_errors},
    index::{Blob, BlobId, BlobLocator, BlobType, PackId},
    loader::BlobLoader,
    progress::{NoProgress, Progress},
    state::FileState,
    writer::{FileWriter, LocalFileWriter},
};

pub(crate) use plan::{PackInfo, Plan};

mod download;
mod file;
mod plan;

/// Everything the planner and the download workers share.
pub(crate) struct Context {
    pub(crate) index: Arc<dyn BlobLocator>,
    pub(crate) loader: Arc<dyn BlobLoader>,
    pub(crate) writer: Arc<dyn FileWriter>,
    pub(crate) progress: Arc<dyn Progress>,
    pub(crate) error_policy: ErrorPolicy,
    pub(crate) dst: PathBuf,
    pub(crate) zero_chunk: BlobId,
    pub(crate) sparse: bool,
}

impl Context {
    pub(crate) fn target_path(&self, location: &Path) -> PathBuf {
        self.dst.join(location)
    }

    /// Routes a per-file failure through the error policy. Cancellation is
    /// passed through untouched.
    pub(crate) fn sanitize_error(&self, location: &Path, err: RestoreError) -> Result<()> {
        if err.is_cancellation() {
            return Err(err);
        }
        (self.error_policy)(location, err)
    }

    /// Resolves every blob of a manifest, calling `f` with the first pack
    /// holding it and its position in the manifest.
    pub(crate) fn for_each_blob(
        &self,
        ids: &[BlobId],
        mut f: impl FnMut(PackId, Blob, usize),
    ) -> Result<()> {
        for (i, id) in ids.iter().enumerate() {
            let packs = self.index.lookup(BlobType::Data, id);
            let Some(first) = packs.first() else {
                return Err(RestoreError::UnknownBlob(*id));
            };
            f(first.pack_id, first.blob, i);
        }

        Ok(())
    }
}

pub(crate) struct CatalogEntry {
    pub(crate) location: PathBuf,
    pub(crate) blobs: Vec<BlobId>,
    pub(crate) size: u64,
    pub(crate) state: Option<Arc<dyn FileState>>,
}

/// Restores a set of files below a destination directory.
pub struct FileRestorer {
    ctx: Context,
    workers: usize,
    files: Vec<CatalogEntry>,
}

impl FileRestorer {
    pub fn new(
        dst: impl Into<PathBuf>,
        loader: Arc<dyn BlobLoader>,
        index: Arc<dyn BlobLocator>,
        config: &RestoreConfig,
        zero_chunk: BlobId,
    ) -> Self {
        Self {
            ctx: Context {
                index,
                loader,
                writer: Arc::new(LocalFileWriter::new(config.allow_recursive_delete)),
                progress: Arc::new(NoProgress),
                error_policy: abort_on_all_errors(),
                dst: dst.into(),
                zero_chunk,
                sparse: config.sparse,
            },
            workers: config.connections.max(1),
            files: Vec::new(),
        }
    }

    pub fn with_writer(mut self, writer: Arc<dyn FileWriter>) -> Self {
        self.ctx.writer = writer;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn Progress>) -> Self {
        self.ctx.progress = progress;
        self
    }

    /// Replaces the default policy, which aborts on the first error.
    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.ctx.error_policy = policy;
        self
    }

    /// Adds a file. `location` is relative to the destination, `state`
    /// describes what an existing target already contains.
    pub fn add_file(
        &mut self,
        location: impl Into<PathBuf>,
        blobs: Vec<BlobId>,
        size: u64,
        state: Option<Arc<dyn FileState>>,
    ) {
        self.files.push(CatalogEntry {
            location: location.into(),
            blobs,
            size,
            state,
        });
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Restores all added files. Returns the first error that was not
    /// suppressed by the error policy.
    #[instrument(skip_all, fields(files = self.files.len(), workers = self.workers), err)]
    pub async fn restore_files(self, cancel: &CancellationToken) -> Result<()> {
        let Self {
            ctx,
            workers,
            files,
        } = self;

        let plan = ctx.build_plan(files, cancel).await?;
        info!(packs = plan.order.len(), "restore planned");

        let ctx = Arc::new(ctx);
        let cancel = cancel.child_token();
        let (requests, pending) = mpsc::channel::<oneshot::Sender<PackInfo>>(workers);

        let mut tasks = JoinSet::new();
        for _ in 0..workers {
            let ctx = ctx.clone();
            let requests = requests.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                loop {
                    let (reply, next) = oneshot::channel();
                    if requests.send(reply).await.is_err() {
                        return Ok(());
                    }
                    // The driver drops the reply once every pack is handed out.
                    let Ok(pack) = next.await else {
                        return Ok(());
                    };
                    if cancel.is_cancelled() {
                        return Err(RestoreError::Cancelled);
                    }
                    ctx.download_pack(pack, &cancel).await?;
                }
            });
        }
        drop(requests);
        tasks.spawn(dispatch(plan, pending, cancel.clone()));

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined.map_err(RestoreError::from).and_then(|r| r) {
                if first_error.is_none() {
                    cancel.cancel();
                    first_error = Some(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Hands packs to idle workers in the order they were first referenced. A
/// pack leaves the plan only once a worker asked for it.
async fn dispatch(
    mut plan: Plan,
    mut requests: mpsc::Receiver<oneshot::Sender<PackInfo>>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut order = std::mem::take(&mut plan.order).into_iter();

    loop {
        let reply = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RestoreError::Cancelled),
            reply = requests.recv() => match reply {
                Some(reply) => reply,
                // Every worker has stopped, their error is reported instead.
                None => return Ok(()),
            },
        };

        // Dispatched packs are dropped from the plan so their files can be
        // freed once the workers are done with them.
        let Some(pack) = order.by_ref().find_map(|id| plan.packs.remove(&id)) else {
            return Ok(());
        };
        let id = pack.id;
        if reply.send(pack).is_err() {
            return Ok(());
        }
        debug!(pack = %id.short(), "scheduled download pack");
    }
}
