//! Durable backends for header chain state

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use opentxs_common::{BlockHash, Checkpoint, Height};

use crate::header_record::HeaderRecord;

pub mod fjall;
pub mod memory;

/// Schema version written alongside fresh chain state
pub const SCHEMA_VERSION: u32 = 1;

/// Key-value persistence for the header oracle.
///
/// `write` must apply a batch atomically: either every change in it is
/// durable or none is.
pub trait Store: Send + Sync {
    /// Read back everything needed to rebuild in-memory state at startup
    fn load(&self) -> Result<StoredState>;

    fn write(&self, batch: &StoreBatch) -> Result<()>;
}

/// Contents of a store as read at startup.
#[derive(Debug, Default)]
pub struct StoredState {
    /// `None` for a store that has never been written
    pub version: Option<u32>,
    pub records: Vec<HeaderRecord>,
    /// Best chain table in ascending height order
    pub best_chain: Vec<(Height, BlockHash)>,
    /// (missing parent, child) pairs
    pub disconnected: Vec<(BlockHash, BlockHash)>,
    pub checkpoint: Option<Checkpoint>,
}

/// Pending changes produced by one oracle mutation.
///
/// Later changes to the same key replace earlier ones, so a batch always
/// describes the final state of each key it touches.
#[derive(Debug, Default)]
pub struct StoreBatch {
    /// `None` removes the record
    pub headers: HashMap<BlockHash, Option<HeaderRecord>>,
    /// `None` removes the height from the best chain table
    pub best_chain: BTreeMap<Height, Option<BlockHash>>,
    /// `true` inserts the (parent, child) pair, `false` removes it
    pub disconnected: HashMap<(BlockHash, BlockHash), bool>,
    /// `Some(None)` clears the stored checkpoint
    pub checkpoint: Option<Option<Checkpoint>>,
    pub version: Option<u32>,
}

impl StoreBatch {
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
            && self.best_chain.is_empty()
            && self.disconnected.is_empty()
            && self.checkpoint.is_none()
            && self.version.is_none()
    }

    pub fn put_header(&mut self, record: &HeaderRecord) {
        self.headers.insert(record.header.hash, Some(record.clone()));
    }

    pub fn remove_header(&mut self, hash: BlockHash) {
        self.headers.insert(hash, None);
    }

    pub fn put_best(&mut self, height: Height, hash: BlockHash) {
        self.best_chain.insert(height, Some(hash));
    }

    pub fn remove_best(&mut self, height: Height) {
        self.best_chain.insert(height, None);
    }

    pub fn hold_disconnected(&mut self, parent: BlockHash, child: BlockHash) {
        self.disconnected.insert((parent, child), true);
    }

    pub fn release_disconnected(&mut self, parent: BlockHash, child: BlockHash) {
        self.disconnected.insert((parent, child), false);
    }

    pub fn set_checkpoint(&mut self, checkpoint: Option<Checkpoint>) {
        self.checkpoint = Some(checkpoint);
    }
}
