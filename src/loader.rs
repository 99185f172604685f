use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, trace};

use crate::{
    error::{RestoreError, Result},
    index::{Blob, BlobHandle, BlobId, PackId},
    storage::{ObjectKind, Storage},
};

/// Receives the blobs of a pack as they are read.
#[async_trait]
pub trait BlobSink: Send {
    /// Called once per requested blob, in no particular order. An error
    /// returned here stops the load and is returned by it.
    async fn deliver(&mut self, handle: BlobHandle, data: Result<Vec<u8>>) -> Result<()>;
}

#[async_trait]
pub trait BlobLoader: Send + Sync {
    /// Fetches `blobs` from pack `pack_id` and hands each of them to `sink`.
    /// An error means some blobs may not have been delivered.
    async fn load_blobs(
        &self,
        pack_id: PackId,
        blobs: Vec<Blob>,
        sink: &mut dyn BlobSink,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// Streams packs out of a [`Storage`] and checks every blob against its id.
pub struct StorageBlobLoader<S> {
    storage: S,
}

impl<S: Storage> StorageBlobLoader<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl<S: Storage> BlobLoader for StorageBlobLoader<S> {
    #[instrument(level = "debug", skip(self, blobs, sink, cancel), fields(pack = %pack_id.short(), blobs = blobs.len()), err)]
    async fn load_blobs(
        &self,
        pack_id: PackId,
        mut blobs: Vec<Blob>,
        sink: &mut dyn BlobSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        blobs.sort_by_key(|blob| blob.offset);

        let mut reader = self
            .storage
            .get(ObjectKind::Pack, &pack_id.to_string())
            .await
            .map_err(|e| RestoreError::pack_load(pack_id, e))?;
        let mut position = 0u64;

        for blob in blobs {
            if cancel.is_cancelled() {
                return Err(RestoreError::Cancelled);
            }

            if blob.offset < position {
                sink.deliver(
                    blob.handle,
                    Err(RestoreError::pack_load(
                        pack_id,
                        std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            format!("blob {} overlaps its predecessor", blob.id()),
                        ),
                    )),
                )
                .await?;
                continue;
            }

            let gap = blob.offset - position;
            if gap > 0 {
                let skipped = tokio::io::copy(&mut (&mut reader).take(gap), &mut tokio::io::sink())
                    .await
                    .map_err(|e| RestoreError::pack_load(pack_id, e))?;
                if skipped < gap {
                    return Err(RestoreError::pack_load(
                        pack_id,
                        std::io::ErrorKind::UnexpectedEof.into(),
                    ));
                }
            }

            let mut buffer = vec![0u8; blob.length as usize];
            reader
                .read_exact(&mut buffer)
                .await
                .map_err(|e| RestoreError::pack_load(pack_id, e))?;
            position = blob.offset + blob.data_length();

            trace!(blob = %blob.id().short(), length = blob.length, "blob read");
            let data = if BlobId::hash(&buffer) == blob.id() {
                Ok(buffer)
            } else {
                Err(RestoreError::CorruptBlob(blob.id()))
            };
            sink.deliver(blob.handle, data).await?;
        }

        Ok(())
    }
}
