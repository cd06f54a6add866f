//! Operator-pinned checkpoint enforcement.

use opentxs_common::{BlockHash, Checkpoint, Header, HeaderStatus, Height};

use crate::oracle_error::OracleError;

/// Holds at most one active checkpoint and classifies headers against it.
#[derive(Debug, Default)]
pub struct CheckpointGuard {
    checkpoint: Option<Checkpoint>,
}

impl CheckpointGuard {
    pub fn new(checkpoint: Option<Checkpoint>) -> Self {
        Self { checkpoint }
    }

    /// Check a checkpoint against the genesis header before installing it.
    pub fn validate(checkpoint: &Checkpoint, genesis: &BlockHash) -> Result<(), OracleError> {
        let reason = match checkpoint.height {
            0 if checkpoint.block_hash != *genesis => "height 0 must be the genesis header",
            1 if checkpoint.previous_block_hash != *genesis => {
                "previous hash at height 1 must be the genesis header"
            }
            _ => return Ok(()),
        };
        Err(OracleError::InvalidCheckpoint {
            height: checkpoint.height,
            reason: reason.to_string(),
        })
    }

    /// Replace the active checkpoint, returning the previous one.
    pub fn set(&mut self, checkpoint: Checkpoint) -> Option<Checkpoint> {
        self.checkpoint.replace(checkpoint)
    }

    pub fn clear(&mut self) -> Option<Checkpoint> {
        self.checkpoint.take()
    }

    pub fn get(&self) -> Option<&Checkpoint> {
        self.checkpoint.as_ref()
    }

    /// Heights whose classification depends on the active checkpoint.
    pub fn heights(&self) -> Vec<Height> {
        match &self.checkpoint {
            Some(checkpoint) if checkpoint.height > 0 => {
                vec![checkpoint.height - 1, checkpoint.height]
            }
            Some(checkpoint) => vec![checkpoint.height],
            None => Vec::new(),
        }
    }

    /// Local status of a header under the active checkpoint.
    pub fn classify(&self, header: &Header) -> HeaderStatus {
        let Some(checkpoint) = &self.checkpoint else {
            return HeaderStatus::Normal;
        };

        if header.height == checkpoint.height {
            if header.hash == checkpoint.block_hash {
                HeaderStatus::Checkpoint
            } else {
                HeaderStatus::CheckpointBanned
            }
        } else if checkpoint.height.checked_sub(1) == Some(header.height) {
            if header.hash == checkpoint.previous_block_hash {
                HeaderStatus::Normal
            } else {
                HeaderStatus::CheckpointBanned
            }
        } else {
            HeaderStatus::Normal
        }
    }
}
