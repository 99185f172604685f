use std::{
    io::{self, Cursor, Read, Write},
    path::PathBuf,
};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tracing::instrument;

pub use self::bincode::BincodeStore;

use crate::{
    config::ChunkerConfig,
    index::{Blob, BlobHandle, BlobId, BlobType, MemoryIndex, PackId},
    storage::{ObjectKind, Storage},
};

mod bincode;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub chunker: ChunkerConfig,
    pub files: Vec<FileEntry>,
    pub index: Vec<IndexEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    /// Relative to the backup root.
    pub path: PathBuf,
    pub size: u64,
    pub blobs: Vec<BlobId>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IndexEntry {
    pub blob: BlobId,
    pub pack: PackId,
    pub offset: u64,
    pub length: u32,
}

impl IndexEntry {
    pub fn to_blob(&self) -> Blob {
        Blob {
            handle: BlobHandle {
                id: self.blob,
                kind: BlobType::Data,
            },
            offset: self.offset,
            length: self.length,
        }
    }
}

impl Snapshot {
    pub fn build_index(&self) -> MemoryIndex {
        let mut index = MemoryIndex::new();
        for entry in &self.index {
            index.insert(entry.pack, entry.to_blob());
        }
        index
    }
}

pub trait MetadataStore {
    fn open<R: Read>(&self, reader: R) -> io::Result<Snapshot>;
    fn save<W: Write>(&self, snapshot: &Snapshot, writer: W) -> io::Result<()>;
}

/// Reads snapshot `id` from `storage`.
#[instrument(skip(storage), err)]
pub async fn load_snapshot<S: Storage + ?Sized>(storage: &S, id: &str) -> io::Result<Snapshot> {
    let mut reader = storage.get(ObjectKind::Snapshot, id).await?;
    let mut buffer = Vec::new();
    reader.read_to_end(&mut buffer).await?;

    BincodeStore.open(buffer.as_slice())
}

/// Writes `snapshot` to `storage` and returns its id.
#[instrument(skip_all, fields(files = snapshot.files.len()), ret, err)]
pub async fn store_snapshot<S: Storage + ?Sized>(storage: &S, snapshot: &Snapshot) -> io::Result<String> {
    let mut buffer = Vec::new();
    BincodeStore.save(snapshot, &mut buffer)?;

    let id = blake3::hash(&buffer).to_hex().to_string();
    let len = buffer.len() as u64;
    storage
        .put(ObjectKind::Snapshot, &id, Box::new(Cursor::new(buffer)), len)
        .await?;

    Ok(id)
}
