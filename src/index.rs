use std::{collections::HashMap, fmt};

use serde::{Deserialize, Serialize};

macro_rules! digest_id {
    ($name:ident) => {
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            pub fn hash(data: &[u8]) -> Self {
                Self(*blake3::hash(data).as_bytes())
            }

            /// First four bytes in hex, for log lines.
            pub fn short(&self) -> String {
                self.0[..4].iter().map(|b| format!("{b:02x}")).collect()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                for b in self.0 {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.short())
            }
        }
    };
}

digest_id!(BlobId);
digest_id!(PackId);

impl BlobId {
    /// Id of a chunk made of `max_size` zero bytes. Long runs of zeros are
    /// cut at the chunker's maximum size, so this is the chunk a hole turns
    /// into.
    pub fn zero_chunk(max_size: u32) -> Self {
        Self::hash(&vec![0u8; max_size as usize])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlobType {
    Data,
    Tree,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlobHandle {
    pub id: BlobId,
    pub kind: BlobType,
}

/// Where a blob lives inside its pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Blob {
    pub handle: BlobHandle,
    pub offset: u64,
    pub length: u32,
}

impl Blob {
    pub fn id(&self) -> BlobId {
        self.handle.id
    }

    /// Length of the plaintext written to the target file.
    pub fn data_length(&self) -> u64 {
        self.length as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedBlob {
    pub pack_id: PackId,
    pub blob: Blob,
}

/// Maps a blob to the packs storing it.
pub trait BlobLocator: Send + Sync {
    /// An empty result means the blob is unknown.
    fn lookup(&self, kind: BlobType, id: &BlobId) -> Vec<PackedBlob>;
}

#[derive(Debug, Default)]
pub struct MemoryIndex {
    entries: HashMap<BlobHandle, Vec<PackedBlob>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, pack_id: PackId, blob: Blob) {
        let packs = self.entries.entry(blob.handle).or_default();
        if packs.iter().any(|p| p.pack_id == pack_id) {
            return;
        }
        packs.push(PackedBlob { pack_id, blob });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl BlobLocator for MemoryIndex {
    fn lookup(&self, kind: BlobType, id: &BlobId) -> Vec<PackedBlob> {
        self.entries
            .get(&BlobHandle { id: *id, kind })
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_blob(data: &[u8], offset: u64) -> Blob {
        Blob {
            handle: BlobHandle {
                id: BlobId::hash(data),
                kind: BlobType::Data,
            },
            offset,
            length: data.len() as u32,
        }
    }

    #[test]
    fn lookup_ignores_duplicate_pack_entries() {
        let pack = PackId::hash(b"pack");
        let blob = data_blob(b"hello", 0);

        let mut index = MemoryIndex::new();
        index.insert(pack, blob);
        index.insert(pack, blob);
        index.insert(PackId::hash(b"other"), blob);

        let found = index.lookup(BlobType::Data, &blob.id());
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].pack_id, pack);
    }

    #[test]
    fn lookup_is_keyed_by_type() {
        let blob = data_blob(b"tree?", 0);
        let mut index = MemoryIndex::new();
        index.insert(PackId::hash(b"pack"), blob);

        assert!(index.lookup(BlobType::Tree, &blob.id()).is_empty());
    }

    #[test]
    fn display_is_full_hex() {
        let id = BlobId([0xab; 32]);
        assert_eq!(id.to_string(), "ab".repeat(32));
        assert_eq!(id.short(), "abababab");
    }

    #[test]
    fn zero_chunk_hashes_zeros() {
        assert_eq!(BlobId::zero_chunk(16), BlobId::hash(&[0u8; 16]));
    }
}
