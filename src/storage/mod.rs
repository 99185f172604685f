use std::{fmt, io};

use async_trait::async_trait;
use tokio::io::AsyncRead;

pub use local::LocalStorage;

pub type StreamReader = Box<dyn AsyncRead + Unpin + Send>;

mod local;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Pack,
    Snapshot,
}

impl ObjectKind {
    pub fn dir_name(&self) -> &'static str {
        match self {
            ObjectKind::Pack => "packs",
            ObjectKind::Snapshot => "snapshots",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, kind: ObjectKind, name: &str) -> io::Result<StreamReader>;

    async fn put(&self, kind: ObjectKind, name: &str, reader: StreamReader, len: u64)
    -> io::Result<()>;
}
