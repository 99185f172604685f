use std::{
    fmt::Debug,
    io,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use tokio::{fs, io::AsyncWriteExt};
use tracing::instrument;

use crate::storage::{self, ObjectKind, StreamReader};

/// Objects kept as plain files below a repository directory.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    #[instrument(err)]
    pub async fn new<P: Into<PathBuf> + Debug>(path: P) -> io::Result<Self> {
        let root = path.into();

        for kind in [ObjectKind::Pack, ObjectKind::Snapshot] {
            fs::create_dir_all(root.join(kind.dir_name())).await?;
        }

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, kind: ObjectKind, name: &str) -> io::Result<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid object name {name:?}"),
            ));
        }

        Ok(self.root.join(kind.dir_name()).join(name))
    }
}

#[async_trait]
impl storage::Storage for LocalStorage {
    #[instrument(err)]
    async fn get(&self, kind: ObjectKind, name: &str) -> io::Result<StreamReader> {
        let path = self.object_path(kind, name)?;
        let file = fs::File::open(&path).await?;

        Ok(Box::new(file))
    }

    #[instrument(skip(reader), err)]
    async fn put(
        &self,
        kind: ObjectKind,
        name: &str,
        mut reader: StreamReader,
        len: u64,
    ) -> io::Result<()> {
        let path = self.object_path(kind, name)?;
        let tmp_path = path.with_extension("tmp");

        let mut file = fs::File::create(&tmp_path).await?;
        let written = tokio::io::copy(&mut reader, &mut file).await?;
        if written != len {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("short object write: {written} of {len} bytes"),
            ));
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp_path, &path).await
    }
}
