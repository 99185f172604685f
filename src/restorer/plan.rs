use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::{
    error::{RestoreError, Result},
    index::PackId,
    restorer::{
        CatalogEntry, Context,
        file::{FileBlobInfo, FileBlobs, FileInfo, LARGE_FILE_BLOB_COUNT},
    },
};

/// A pack and the files needing at least one blob from it.
pub(crate) struct PackInfo {
    pub(crate) id: PackId,
    /// Keyed by catalog position.
    pub(crate) files: BTreeMap<usize, Arc<FileInfo>>,
}

pub(crate) struct Plan {
    pub(crate) packs: HashMap<PackId, PackInfo>,
    /// Packs in the order files first reference them. Fetching in this order
    /// keeps the writes of each file roughly sequential.
    pub(crate) order: Vec<PackId>,
}

impl Context {
    #[instrument(level = "debug", skip_all, fields(files = files.len()), err)]
    pub(crate) async fn build_plan(
        &self,
        files: Vec<CatalogEntry>,
        cancel: &CancellationToken,
    ) -> Result<Plan> {
        let mut plan = Plan {
            packs: HashMap::new(),
            order: Vec::new(),
        };

        for (position, entry) in files.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(RestoreError::Cancelled);
            }

            let CatalogEntry {
                location,
                blobs,
                size,
                state,
            } = entry;

            if blobs.is_empty() {
                if let Err(err) = self.restore_empty_file(&location).await {
                    self.sanitize_error(&location, err)?;
                }
                continue;
            }

            let large_file = blobs.len() > LARGE_FILE_BLOB_COUNT;
            let mut packs_map: HashMap<PackId, Vec<FileBlobInfo>> = HashMap::new();
            let mut file_packs = Vec::new();
            let mut sparse = false;
            let mut file_offset = 0u64;

            self.for_each_blob(&blobs, |pack_id, blob, idx| {
                let offset = file_offset;
                file_offset += blob.data_length();

                if blob.id() == self.zero_chunk {
                    sparse = self.sparse;
                }

                if state.as_ref().is_some_and(|s| s.has_matching_blob(idx)) {
                    return;
                }

                if large_file {
                    packs_map.entry(pack_id).or_default().push(FileBlobInfo {
                        id: blob.id(),
                        offset,
                    });
                }

                if !plan.packs.contains_key(&pack_id) {
                    plan.packs.insert(
                        pack_id,
                        PackInfo {
                            id: pack_id,
                            files: BTreeMap::new(),
                        },
                    );
                    plan.order.push(pack_id);
                }
                if !file_packs.contains(&pack_id) {
                    file_packs.push(pack_id);
                }
            })?;

            if blobs.len() == 1 {
                // Nothing to preallocate for a single blob. A short chunk also
                // never matches the zero chunk, which would keep the file
                // from being sparse. Applies even with sparse restores off, so
                // a lone all-zero chunk ends up as a hole.
                sparse = true;
            }
            if state.is_some() {
                // Holes cannot be punched into an existing file, old data
                // would remain where the new content is sparse.
                sparse = false;
            }

            let representation = if large_file {
                FileBlobs::Packs(packs_map)
            } else {
                FileBlobs::Ids(blobs)
            };
            let file = Arc::new(FileInfo::new(location, size, sparse, representation, state));

            for pack_id in file_packs {
                if let Some(pack) = plan.packs.get_mut(&pack_id) {
                    pack.files.insert(position, file.clone());
                }
            }
        }

        debug!(packs = plan.order.len(), "plan built");
        Ok(plan)
    }
}
