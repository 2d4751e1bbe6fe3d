pub mod controller;
pub mod processor;
pub mod state;

use std::sync::Arc;

pub use controller::ChangeListSynchronizer;
pub use processor::{ArchiveChunkProcessor, ChunkProcessor};
pub use state::{SyncOutcome, SyncPhase};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
    /// Changes applied (and committed) per cursor step.
    pub chunk_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self { chunk_size: 10 }
    }
}

/// A collection the synchronizer keeps up to date.
#[derive(Clone)]
pub struct SyncRequest {
    pub key: String,
    pub processor: Arc<dyn ChunkProcessor>,
}
