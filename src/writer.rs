#[cfg(windows)]
use std::os::windows::fs::FileExt as WinFileExt;
#[cfg(unix)]
use std::os::unix::fs::FileExt as UnixFileExt;

use std::{
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use fs2::FileExt;
use tracing::{debug, instrument};

/// An open target file. Cloning is cheap; the file is closed when the last
/// clone is dropped.
#[derive(Debug, Clone)]
pub struct FileHandle {
    inner: Arc<File>,
    path: Arc<PathBuf>,
}

impl FileHandle {
    pub fn new(file: File, path: PathBuf) -> Self {
        Self {
            inner: Arc::new(file),
            path: Arc::new(path),
        }
    }

    #[cfg(test)]
    pub(crate) fn downgrade(&self) -> std::sync::Weak<File> {
        Arc::downgrade(&self.inner)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
pub trait FileWriter: Send + Sync {
    /// Creates or reopens `path` and sets it to `size` bytes.
    async fn create(&self, path: &Path, size: u64, sparse: bool) -> io::Result<FileHandle>;

    /// Opens a file previously set up by [`FileWriter::create`] for more
    /// writes, keeping its size and content.
    async fn open(&self, path: &Path) -> io::Result<FileHandle>;

    /// Writes `data` at `offset`. Must be safe to call concurrently for
    /// disjoint ranges of the same file.
    async fn write_at(
        &self,
        handle: &FileHandle,
        data: Arc<[u8]>,
        offset: u64,
        sparse: bool,
    ) -> io::Result<()>;
}

/// Writes restored files to the local filesystem.
#[derive(Debug, Clone, Default)]
pub struct LocalFileWriter {
    allow_recursive_delete: bool,
}

impl LocalFileWriter {
    pub fn new(allow_recursive_delete: bool) -> Self {
        Self {
            allow_recursive_delete,
        }
    }

    fn clear_target(&self, path: &Path) -> io::Result<()> {
        let meta = match fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };

        if meta.is_dir() {
            if !self.allow_recursive_delete {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("cannot replace directory {}", path.display()),
                ));
            }
            debug!(path = %path.display(), "removing directory in the way");
            return fs::remove_dir_all(path);
        }

        if !meta.is_file() || has_other_links(&meta) {
            // Never write through a symlink or into a file shared with
            // another hard link.
            return fs::remove_file(path);
        }

        Ok(())
    }

    fn create_sync(&self, path: &Path, size: u64, sparse: bool) -> io::Result<FileHandle> {
        self.clear_target(path)?;

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if sparse {
            // Old content would show through the holes.
            file.set_len(0)?;
        } else if size > 0 {
            FileExt::allocate(&file, size)?;
        }
        file.set_len(size)?;

        Ok(FileHandle::new(file, path.to_path_buf()))
    }
}

#[cfg(unix)]
fn has_other_links(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    meta.nlink() > 1
}

#[cfg(not(unix))]
fn has_other_links(_meta: &fs::Metadata) -> bool {
    false
}

fn write_all_at(file: &File, mut data: &[u8], mut offset: u64) -> io::Result<()> {
    while !data.is_empty() {
        #[cfg(unix)]
        let n = file.write_at(data, offset)?;

        #[cfg(windows)]
        let n = file.seek_write(data, offset)?;

        if n == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }

        data = &data[n..];
        offset += n as u64;
    }

    Ok(())
}

#[async_trait]
impl FileWriter for LocalFileWriter {
    #[instrument(level = "trace", skip(self), err)]
    async fn create(&self, path: &Path, size: u64, sparse: bool) -> io::Result<FileHandle> {
        let this = self.clone();
        let path = path.to_path_buf();

        tokio::task::spawn_blocking(move || this.create_sync(&path, size, sparse))
            .await
            .map_err(io::Error::other)?
    }

    #[instrument(level = "trace", skip(self), err)]
    async fn open(&self, path: &Path) -> io::Result<FileHandle> {
        let path = path.to_path_buf();

        tokio::task::spawn_blocking(move || -> io::Result<FileHandle> {
            let file = OpenOptions::new().write(true).open(&path)?;
            Ok(FileHandle::new(file, path))
        })
        .await
        .map_err(io::Error::other)?
    }

    #[instrument(level = "trace", skip(self, handle, data), fields(path = %handle.path().display(), len = data.len()), err)]
    async fn write_at(
        &self,
        handle: &FileHandle,
        data: Arc<[u8]>,
        offset: u64,
        sparse: bool,
    ) -> io::Result<()> {
        if sparse && data.iter().all(|b| *b == 0) {
            // The file was sized on creation, the range already reads as zeros.
            return Ok(());
        }

        let file = handle.inner.clone();
        tokio::task::spawn_blocking(move || write_all_at(&file, &data, offset))
            .await
            .map_err(io::Error::other)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn creates_file_with_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file");

        let writer = LocalFileWriter::default();
        let handle = writer.create(&path, 8, false).await.unwrap();
        writer
            .write_at(&handle, Arc::from(&b"abcd"[..]), 4, false)
            .await
            .unwrap();
        drop(handle);

        assert_eq!(fs::read(&path).unwrap(), b"\0\0\0\0abcd");
    }

    #[tokio::test]
    async fn reopen_keeps_size_and_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file");

        let writer = LocalFileWriter::default();
        let handle = writer.create(&path, 8, false).await.unwrap();
        writer
            .write_at(&handle, Arc::from(&b"abcd"[..]), 0, false)
            .await
            .unwrap();
        drop(handle);

        let handle = writer.open(&path).await.unwrap();
        writer
            .write_at(&handle, Arc::from(&b"efgh"[..]), 4, false)
            .await
            .unwrap();
        drop(handle);

        assert_eq!(fs::read(&path).unwrap(), b"abcdefgh");
    }

    #[tokio::test]
    async fn sparse_create_drops_old_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file");
        fs::write(&path, b"old content").unwrap();

        let writer = LocalFileWriter::default();
        let handle = writer.create(&path, 4, true).await.unwrap();
        writer
            .write_at(&handle, Arc::from(&[0u8; 4][..]), 0, true)
            .await
            .unwrap();
        drop(handle);

        assert_eq!(fs::read(&path).unwrap(), vec![0u8; 4]);
    }

    #[tokio::test]
    async fn non_sparse_create_keeps_old_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file");
        fs::write(&path, b"keepXXXX").unwrap();

        let writer = LocalFileWriter::default();
        let handle = writer.create(&path, 6, false).await.unwrap();
        writer
            .write_at(&handle, Arc::from(&b"ab"[..]), 4, false)
            .await
            .unwrap();
        drop(handle);

        assert_eq!(fs::read(&path).unwrap(), b"keepab");
    }

    #[tokio::test]
    async fn directory_needs_recursive_delete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("target");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("inner"), b"x").unwrap();

        let err = LocalFileWriter::new(false)
            .create(&path, 1, false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert!(path.is_dir());

        LocalFileWriter::new(true).create(&path, 1, false).await.unwrap();
        assert!(path.is_file());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn hard_linked_file_is_detached() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file");
        let link = dir.path().join("link");
        fs::write(&path, b"shared").unwrap();
        fs::hard_link(&path, &link).unwrap();

        let writer = LocalFileWriter::default();
        let handle = writer.create(&path, 3, false).await.unwrap();
        writer
            .write_at(&handle, Arc::from(&b"new"[..]), 0, false)
            .await
            .unwrap();
        drop(handle);

        assert_eq!(fs::read(&path).unwrap(), b"new");
        assert_eq!(fs::read(&link).unwrap(), b"shared");
    }

    #[tokio::test]
    async fn concurrent_disjoint_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file");

        let writer = LocalFileWriter::default();
        let handle = writer.create(&path, 64, false).await.unwrap();
        let writes = (0..8u8).map(|i| {
            let data: Arc<[u8]> = Arc::from(vec![b'a' + i; 8]);
            let writer = &writer;
            let handle = &handle;
            async move { writer.write_at(handle, data, i as u64 * 8, false).await }
        });
        for result in futures::future::join_all(writes).await {
            result.unwrap();
        }
        drop(handle);

        let content = fs::read(&path).unwrap();
        for i in 0..8u8 {
            assert_eq!(&content[i as usize * 8..][..8], &[b'a' + i; 8]);
        }
    }
}
