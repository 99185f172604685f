use std::{
    fs::File,
    io::{self, Read},
    path::Path,
};

use tracing::instrument;

use crate::index::BlobId;

/// What an existing target file already contains.
pub trait FileState: Send + Sync {
    /// Whether the blob at manifest position `index` is already on disk.
    fn has_matching_blob(&self, index: usize) -> bool;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobMatches {
    matches: Vec<bool>,
}

impl BlobMatches {
    pub fn new(matches: Vec<bool>) -> Self {
        Self { matches }
    }

    /// Reads the regular file at `path` and checks every manifest position
    /// against the bytes found at its offset. Returns `None` when there is no
    /// regular file to compare against, or when the file has other hard links
    /// and so gets replaced rather than updated.
    #[instrument(level = "trace", skip(blobs), err)]
    pub fn compare(path: &Path, blobs: &[(BlobId, u64)]) -> io::Result<Option<Self>> {
        let meta = match std::fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        if !meta.is_file() || has_other_links(&meta) {
            return Ok(None);
        }

        let mut file = File::open(path)?;
        let mut matches = Vec::with_capacity(blobs.len());
        let mut buffer = Vec::new();
        let mut eof = false;

        for (id, length) in blobs {
            if eof {
                matches.push(false);
                continue;
            }

            buffer.clear();
            let n = (&mut file).take(*length).read_to_end(&mut buffer)?;
            if (n as u64) < *length {
                eof = true;
                matches.push(false);
                continue;
            }

            matches.push(BlobId::hash(&buffer) == *id);
        }

        Ok(Some(Self { matches }))
    }

    pub fn all_match(&self) -> bool {
        self.matches.iter().all(|m| *m)
    }
}

#[cfg(unix)]
fn has_other_links(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    meta.nlink() > 1
}

#[cfg(not(unix))]
fn has_other_links(_meta: &std::fs::Metadata) -> bool {
    false
}

impl FileState for BlobMatches {
    fn has_matching_blob(&self, index: usize) -> bool {
        self.matches.get(index).copied().unwrap_or(false)
    }
}
