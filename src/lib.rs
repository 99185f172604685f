pub mod command;
pub mod config;
pub mod error;
pub mod index;
pub mod loader;
pub mod metadata;
pub mod progress;
pub mod restorer;
pub mod state;
pub mod storage;
pub mod writer;

#[cfg(test)]
mod testutil;

pub use error::{RestoreError, Result};
pub use restorer::FileRestorer;
