use std::{
    collections::{HashMap, HashSet},
    fmt::Debug,
    fs,
    io::{self, Cursor},
    path::Path,
};

use fastcdc::v2020::StreamCDC;
use tracing::{debug, info, instrument};
use walkdir::WalkDir;

use crate::{
    config::BackupConfig,
    index::{BlobId, PackId},
    metadata::{self, FileEntry, IndexEntry, Snapshot},
    storage::{ObjectKind, Storage},
};

/// Collects new blobs into a pack buffer and uploads it once it is full.
struct Packer {
    pack_size: usize,
    buffer: Vec<u8>,
    pending: Vec<(BlobId, u64, u32)>,
}

impl Packer {
    fn new(pack_size: usize) -> Self {
        Self {
            pack_size,
            buffer: Vec::new(),
            pending: Vec::new(),
        }
    }

    async fn add<S: Storage + ?Sized>(
        &mut self,
        storage: &S,
        id: BlobId,
        data: &[u8],
        index: &mut Vec<IndexEntry>,
    ) -> io::Result<()> {
        let length = u32::try_from(data.len()).map_err(io::Error::other)?;
        self.pending.push((id, self.buffer.len() as u64, length));
        self.buffer.extend_from_slice(data);

        if self.buffer.len() >= self.pack_size {
            self.flush(storage, index).await?;
        }
        Ok(())
    }

    async fn flush<S: Storage + ?Sized>(
        &mut self,
        storage: &S,
        index: &mut Vec<IndexEntry>,
    ) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let buffer = std::mem::take(&mut self.buffer);
        let pack = PackId::hash(&buffer);
        let len = buffer.len() as u64;
        storage
            .put(ObjectKind::Pack, &pack.to_string(), Box::new(Cursor::new(buffer)), len)
            .await?;

        debug!(pack = %pack.short(), blobs = self.pending.len(), len, "pack stored");
        index.extend(
            self.pending
                .drain(..)
                .map(|(blob, offset, length)| IndexEntry {
                    blob,
                    pack,
                    offset,
                    length,
                }),
        );
        Ok(())
    }
}

/// Chunks every regular file below `root` into packs and stores a snapshot
/// listing them. Blobs already indexed by the `parent` snapshot are not
/// uploaded again. Returns the new snapshot id.
#[instrument(skip(storage), ret, err)]
pub async fn backup<P: AsRef<Path> + Debug, S: Storage + ?Sized>(
    root: P,
    parent: Option<String>,
    storage: &S,
    config: BackupConfig,
) -> io::Result<String> {
    let root = root.as_ref();

    let mut known: HashMap<BlobId, IndexEntry> = match parent {
        Some(id) => {
            let parent = metadata::load_snapshot(storage, &id).await?;
            if parent.chunker != config.chunker {
                info!("parent snapshot was chunked differently, few blobs will be reused");
            }
            parent.index.into_iter().map(|e| (e.blob, e)).collect()
        }
        None => HashMap::new(),
    };

    let mut snapshot = Snapshot {
        chunker: config.chunker,
        files: Vec::new(),
        index: Vec::new(),
    };
    let mut used: HashSet<BlobId> = HashSet::new();
    let mut packer = Packer::new(config.pack_size);

    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() {
            if entry.file_type().is_symlink() {
                debug!(path = ?entry.path(), "skipping symlink");
            }
            continue;
        }

        let path = entry.path();
        let relative_path = path
            .strip_prefix(root)
            .map_err(io::Error::other)?
            .to_path_buf();

        let file = fs::File::open(path)?;
        let chunker = StreamCDC::new(
            file,
            config.chunker.min_size,
            config.chunker.avg_size,
            config.chunker.max_size,
        );

        let mut blobs = Vec::new();
        let mut size = 0u64;
        for chunk in chunker {
            let chunk = chunk.map_err(|e| io::Error::other(e.to_string()))?;
            let id = BlobId::hash(&chunk.data);
            size += chunk.data.len() as u64;
            blobs.push(id);

            if !used.insert(id) {
                continue;
            }
            match known.remove(&id) {
                Some(existing) => snapshot.index.push(existing),
                None => {
                    packer
                        .add(storage, id, &chunk.data, &mut snapshot.index)
                        .await?
                }
            }
        }

        debug!(path = ?relative_path, size, blobs = blobs.len(), "file chunked");
        snapshot.files.push(FileEntry {
            path: relative_path,
            size,
            blobs,
        });
    }

    packer.flush(storage, &mut snapshot.index).await?;

    info!(
        files = snapshot.files.len(),
        blobs = snapshot.index.len(),
        "backup complete"
    );
    metadata::store_snapshot(storage, &snapshot).await
}
