//! Terrace Incremental View Engine
//!
//! A chain of producer stages materializing sorted datasets as versioned
//! row-group streams. Each stage turns an ordered stream of source updates
//! into the next version of its persisted state and re-publishes its own
//! delta stream, so downstream stages update without re-reading unchanged
//! data.

pub mod codec;
pub mod config;
pub mod cursor;
pub mod engine;
pub mod merge;
pub mod model;
pub mod order;
pub mod sort;
pub mod stage;
pub mod store;

// Re-export main types
pub use config::ProductionConfig;
pub use cursor::Cursor;
pub use model::{ContentRecord, KeyMapping, SourceUpdate, UpdateKind};
pub use order::Comparator;
pub use stage::{
    PreserveHook, Producer, Stage, StageGraph, StageHandle, StageOptions, Version,
};
pub use store::{LocalStore, LocalTempStreams, StreamKind, StreamStore, TempStreams};

use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

/// Engine error type
#[derive(Debug, thiserror::Error)]
pub enum TerraceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Checksum mismatch")]
    ChecksumMismatch,

    #[error("Invalid stream format")]
    InvalidStreamFormat,

    #[error("Stream format version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },

    #[error("Source updates out of order: {0}")]
    Ordering(String),

    #[error("Producer finished before consuming its values: {0}")]
    ProducerUnderconsumed(String),

    #[error("Deletion instruction without matching content: {0}")]
    UnexpectedDeletion(String),

    #[error("Stage not found: {0}")]
    StageNotFound(String),

    #[error("Stage already registered: {0}")]
    StageExists(String),

    #[error("Stage graph error: {0}")]
    Graph(String),

    #[error("Operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, TerraceError>;

/// Bail out of a production when its cancellation token fires.
pub(crate) fn ensure_active(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(TerraceError::Cancelled);
    }
    Ok(())
}

/// Wrap an in-memory batch of rows as a sorted source stream.
pub fn stream_rows<T: Send + 'static>(rows: Vec<T>) -> BoxStream<'static, Result<T>> {
    Box::pin(futures::stream::iter(rows.into_iter().map(Ok)))
}
