use std::{
    collections::HashMap,
    fmt::Debug,
    io,
    path::{Component, Path, PathBuf},
    sync::{Arc, Mutex},
};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
    config::RestoreConfig,
    error::{ErrorPolicy, RestoreError, Result, abort_on_all_errors},
    index::BlobId,
    loader::StorageBlobLoader,
    metadata::{self, FileEntry},
    progress::RestoreProgress,
    restorer::FileRestorer,
    state::{BlobMatches, FileState},
    storage::Storage,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct RestoreOptions {
    pub config: RestoreConfig,
    /// Log failing files and keep going instead of aborting on the first one.
    pub ignore_errors: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub files_restored: u64,
    pub files_updated: u64,
    pub files_unchanged: u64,
    pub bytes_written: u64,
    /// Files that could not be restored, with the reason.
    pub failures: Vec<(PathBuf, String)>,
}

type Failures = Arc<Mutex<Vec<(PathBuf, String)>>>;

fn error_policy(ignore_errors: bool, failures: Failures) -> ErrorPolicy {
    if !ignore_errors {
        return abort_on_all_errors();
    }

    Arc::new(move |location: &Path, err: RestoreError| {
        warn!(location = %location.display(), error = %err, "failed to restore file");
        let mut failures = match failures.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        failures.push((location.to_path_buf(), err.to_string()));
        Ok(())
    })
}

fn check_location(path: &Path) -> io::Result<()> {
    if path.as_os_str().is_empty() || !path.components().all(|c| matches!(c, Component::Normal(_)))
    {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("refusing to restore outside the destination: {}", path.display()),
        ));
    }
    Ok(())
}

/// Compares an existing target with the manifest. `None` when there is no
/// usable file or a blob length is unknown, in which case the planner reports
/// the missing blob.
async fn prior_state(
    target: PathBuf,
    file: &FileEntry,
    lengths: &HashMap<BlobId, u32>,
) -> Result<Option<BlobMatches>> {
    let Some(blobs) = file
        .blobs
        .iter()
        .map(|id| lengths.get(id).map(|length| (*id, u64::from(*length))))
        .collect::<Option<Vec<_>>>()
    else {
        return Ok(None);
    };

    let path = target.clone();
    tokio::task::spawn_blocking(move || BlobMatches::compare(&path, &blobs))
        .await?
        .map_err(|e| RestoreError::io(target, e))
}

/// Sets a file whose blobs all match to `size`. Returns the previous length
/// if it had to be changed.
async fn settle_length(target: &Path, size: u64) -> io::Result<Option<u64>> {
    let len = tokio::fs::metadata(target).await?.len();
    if len == size {
        return Ok(None);
    }

    let file = tokio::fs::OpenOptions::new().write(true).open(target).await?;
    file.set_len(size).await?;
    Ok(Some(len))
}

/// Restores snapshot `snapshot_id` from `storage` below `root`. Files whose
/// content already matches are left alone, others are updated in place when
/// possible.
#[instrument(skip(storage, cancel), err)]
pub async fn restore<P: AsRef<Path> + Debug, S: Storage + 'static>(
    root: P,
    snapshot_id: &str,
    storage: S,
    options: &RestoreOptions,
    cancel: &CancellationToken,
) -> Result<RestoreSummary> {
    let root = root.as_ref();
    let snapshot = metadata::load_snapshot(&storage, snapshot_id).await?;
    info!(files = snapshot.files.len(), blobs = snapshot.index.len(), "snapshot loaded");

    let lengths: HashMap<BlobId, u32> = snapshot.index.iter().map(|e| (e.blob, e.length)).collect();
    let failures = Failures::default();
    let policy = error_policy(options.ignore_errors, failures.clone());
    let progress = Arc::new(RestoreProgress::new());

    tokio::fs::create_dir_all(root)
        .await
        .map_err(|e| RestoreError::io(root, e))?;

    let mut restorer = FileRestorer::new(
        root,
        Arc::new(StorageBlobLoader::new(storage)),
        Arc::new(snapshot.build_index()),
        &options.config,
        BlobId::zero_chunk(snapshot.chunker.max_size),
    )
    .with_progress(progress.clone())
    .with_error_policy(policy.clone());

    let mut summary = RestoreSummary::default();
    for file in &snapshot.files {
        if cancel.is_cancelled() {
            return Err(RestoreError::Cancelled);
        }

        if let Err(e) = check_location(&file.path) {
            policy(file.path.as_path(), RestoreError::io(&file.path, e))?;
            continue;
        }

        let target = root.join(&file.path);
        if let Some(parent) = target.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                policy(file.path.as_path(), RestoreError::io(parent, e))?;
                continue;
            }
        }

        let state = match prior_state(target.clone(), file, &lengths).await {
            Ok(state) => state,
            Err(err) => {
                policy(file.path.as_path(), err)?;
                continue;
            }
        };

        match state {
            Some(state) if state.all_match() => match settle_length(&target, file.size).await {
                Ok(None) => {
                    debug!(path = %file.path.display(), "unchanged");
                    summary.files_unchanged += 1;
                }
                Ok(Some(len)) => {
                    debug!(path = %file.path.display(), from = len, to = file.size, "truncated");
                    summary.files_updated += 1;
                }
                Err(e) => policy(file.path.as_path(), RestoreError::io(&target, e))?,
            },
            state => {
                let state = state.map(|s| Arc::new(s) as Arc<dyn FileState>);
                restorer.add_file(&file.path, file.blobs.clone(), file.size, state);
            }
        }
    }

    debug!(files = restorer.len(), "files to restore");
    restorer.restore_files(cancel).await?;

    let counts = progress.counts();
    summary.files_restored += counts.files_restored;
    summary.files_updated += counts.files_updated;
    summary.bytes_written += counts.bytes_written;
    summary.failures = match failures.lock() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    };

    info!(
        restored = summary.files_restored,
        updated = summary.files_updated,
        unchanged = summary.files_unchanged,
        failed = summary.failures.len(),
        "restore complete"
    );
    Ok(summary)
}
