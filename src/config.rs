use serde::{Deserialize, Serialize};

/// Content-defined chunking bounds, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkerConfig {
    pub min_size: u32,
    pub avg_size: u32,
    pub max_size: u32,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            min_size: 8 * 1024,
            avg_size: 16 * 1024,
            max_size: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackupConfig {
    pub chunker: ChunkerConfig,
    /// Packs are flushed once they reach this many bytes.
    pub pack_size: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            chunker: ChunkerConfig::default(),
            pack_size: 4 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RestoreConfig {
    /// Number of packs downloaded concurrently. Packs are streamed, so this
    /// is bounded by backend connections rather than CPU count.
    pub connections: usize,
    pub sparse: bool,
    /// Allow replacing a directory at a file's target path.
    pub allow_recursive_delete: bool,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            connections: 5,
            sparse: false,
            allow_recursive_delete: false,
        }
    }
}
