use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::{
    error::{RestoreError, Result},
    index::{Blob, BlobHandle, BlobId, BlobType},
    loader::BlobSink,
    restorer::{
        Context, PackInfo,
        file::{FileBlobs, FileInfo},
    },
};

/// Where one blob of a pack has to be written.
pub(crate) struct BlobTargets {
    pub(crate) blob: Blob,
    /// File (by catalog position) and the offsets of the blob in it. A blob
    /// can occur several times in one file.
    pub(crate) files: BTreeMap<usize, (Arc<FileInfo>, Vec<u64>)>,
}

pub(crate) type BlobMapping = HashMap<BlobId, BlobTargets>;

fn add_target(mapping: &mut BlobMapping, position: usize, file: &Arc<FileInfo>, blob: Blob, offset: u64) {
    let targets = mapping.entry(blob.id()).or_insert_with(|| BlobTargets {
        blob,
        files: BTreeMap::new(),
    });
    targets
        .files
        .entry(position)
        .or_insert_with(|| (file.clone(), Vec::new()))
        .1
        .push(offset);
}

impl Context {
    /// Collects which blobs `pack` has to deliver and where they go.
    pub(crate) fn blob_mapping(&self, pack: &PackInfo) -> Result<BlobMapping> {
        let mut mapping = BlobMapping::new();

        for (position, file) in &pack.files {
            match &file.blobs {
                FileBlobs::Ids(ids) => {
                    let mut file_offset = 0u64;
                    self.for_each_blob(ids, |pack_id, blob, idx| {
                        if pack_id == pack.id && !file.has_matching_blob(idx) {
                            add_target(&mut mapping, *position, file, blob, file_offset);
                        }
                        file_offset += blob.data_length();
                    })?;
                }
                FileBlobs::Packs(packs) => {
                    for info in packs.get(&pack.id).into_iter().flatten() {
                        let found = self
                            .index
                            .lookup(BlobType::Data, &info.id)
                            .into_iter()
                            .find(|packed| packed.pack_id == pack.id);
                        match found {
                            Some(packed) => {
                                add_target(&mut mapping, *position, file, packed.blob, info.offset)
                            }
                            None => return Err(RestoreError::UnknownBlob(info.id)),
                        }
                    }
                }
            }
        }

        Ok(mapping)
    }

    #[instrument(level = "debug", skip_all, fields(pack = %pack.id.short(), files = pack.files.len()), err)]
    pub(crate) async fn download_pack(
        &self,
        pack: PackInfo,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mapping = self.blob_mapping(&pack)?;
        if mapping.is_empty() {
            return Ok(());
        }

        let blobs: Vec<Blob> = mapping.values().map(|targets| targets.blob).collect();
        let mut sink = PackSink {
            ctx: self,
            mapping: &mapping,
            processed: HashSet::new(),
            fatal: None,
            cancel,
        };
        let result = self
            .loader
            .load_blobs(pack.id, blobs, &mut sink, cancel)
            .await;

        if let Some(err) = sink.fatal {
            // Already sanitized while handling a blob.
            return Err(err);
        }

        match result {
            Ok(()) => {
                debug!("pack done");
                Ok(())
            }
            Err(err) => self.report_error(&mapping, &sink.processed, err),
        }
    }

    /// Attributes a failed load to the files still waiting for a blob. Files
    /// whose blobs all arrived are not affected.
    fn report_error(
        &self,
        mapping: &BlobMapping,
        processed: &HashSet<BlobHandle>,
        err: RestoreError,
    ) -> Result<()> {
        if err.is_cancellation() {
            return Err(err);
        }

        let mut affected: BTreeMap<usize, &Arc<FileInfo>> = BTreeMap::new();
        for targets in mapping.values() {
            if processed.contains(&targets.blob.handle) {
                continue;
            }
            for (position, (file, _)) in &targets.files {
                affected.insert(*position, file);
            }
        }

        warn!(error = %err, files = affected.len(), "pack load failed");
        for file in affected.into_values() {
            self.sanitize_error(&file.location, err.clone())?;
        }

        Ok(())
    }
}

struct PackSink<'a> {
    ctx: &'a Context,
    mapping: &'a BlobMapping,
    processed: HashSet<BlobHandle>,
    fatal: Option<RestoreError>,
    cancel: &'a CancellationToken,
}

impl<'a> PackSink<'a> {
    async fn handle(&mut self, handle: BlobHandle, data: Result<Vec<u8>>) -> Result<()> {
        self.processed.insert(handle);

        let Some(targets) = self.mapping.get(&handle.id) else {
            trace!(blob = %handle.id.short(), "unrequested blob");
            return Ok(());
        };

        let data: Arc<[u8]> = match data {
            Ok(data) => data.into(),
            Err(err) => {
                for (file, _) in targets.files.values() {
                    self.ctx.sanitize_error(&file.location, err.clone())?;
                }
                return Ok(());
            }
        };

        for (file, offsets) in targets.files.values() {
            for offset in offsets {
                // Checked per write, a blob shared by many files would
                // otherwise delay cancellation for long.
                if self.cancel.is_cancelled() {
                    return Err(RestoreError::Cancelled);
                }

                if let Err(err) = self.ctx.write_to_file(file, data.clone(), *offset).await {
                    self.ctx.sanitize_error(&file.location, err)?;
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl<'a> BlobSink for PackSink<'a> {
    async fn deliver(&mut self, handle: BlobHandle, data: Result<Vec<u8>>) -> Result<()> {
        let result = self.handle(handle, data).await;
        if let Err(err) = &result {
            self.fatal.get_or_insert_with(|| err.clone());
        }
        result
    }
}
