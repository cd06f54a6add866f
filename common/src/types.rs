//! Core type definitions for the header subsystem

use crate::{hash::BlockHash, hash::FilterHash, work::Work};
use anyhow::{Context, Result};
use std::fmt;

/// Block height; genesis is 0.
pub type Height = u64;

/// A decoded block header as delivered by the peer or sync layer.
///
/// Proof-of-work format and signature checks have already been applied by
/// the decoder; `work` is the header's own contribution in absolute units.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[derive(minicbor::Encode, minicbor::Decode)]
pub struct Header {
    #[n(0)]
    pub hash: BlockHash,
    #[n(1)]
    pub parent_hash: BlockHash,
    #[n(2)]
    pub height: Height,
    #[n(3)]
    pub work: Work,
    #[n(4)]
    pub timestamp: u64,
}

impl Header {
    pub fn position(&self) -> Position {
        Position::new(self.height, self.hash)
    }

    /// Canonical CBOR encoding, as carried in sync batches
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        minicbor::encode(self, &mut bytes).expect("infallible");
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        minicbor::decode(bytes).context("could not decode header")
    }
}

/// A point on some chain.
///
/// The ordering (height, then hash) is only for use as a map key; fork
/// choice compares cumulative work instead.
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Position {
    pub height: Height,
    pub hash: BlockHash,
}

impl Position {
    pub const fn new(height: Height, hash: BlockHash) -> Self {
        Self { height, hash }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.hash, self.height)
    }
}

/// Header status relative to linkage and the active checkpoint.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    serde::Serialize,
    serde::Deserialize,
    minicbor::Encode,
    minicbor::Decode,
)]
#[cbor(index_only)]
pub enum HeaderStatus {
    #[n(0)]
    Normal,
    #[n(1)]
    Disconnected,
    #[n(2)]
    CheckpointBanned,
    #[n(3)]
    Checkpoint,
}

impl HeaderStatus {
    /// Effective status of a header given its own status and its parent's
    /// effective status. A banned ancestor bans every descendant.
    pub fn inherit(self, parent: HeaderStatus) -> HeaderStatus {
        match parent {
            HeaderStatus::CheckpointBanned => HeaderStatus::CheckpointBanned,
            _ => self,
        }
    }

    /// Whether a header with this effective status may become the best tip
    pub fn is_candidate(self) -> bool {
        matches!(self, HeaderStatus::Normal | HeaderStatus::Checkpoint)
    }
}

/// Operator-pinned checkpoint.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    serde::Serialize,
    serde::Deserialize,
    minicbor::Encode,
    minicbor::Decode,
)]
pub struct Checkpoint {
    #[n(0)]
    pub height: Height,
    #[n(1)]
    pub block_hash: BlockHash,
    #[n(2)]
    pub previous_block_hash: BlockHash,
    #[n(3)]
    pub filter_hash: Option<FilterHash>,
}

/// Best-chain switch: positions leaving the chain (descending from the old
/// tip) and joining it (ascending to the new tip).
#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Reorg {
    pub disconnect: Vec<Position>,
    pub connect: Vec<Position>,
}

impl Reorg {
    pub fn is_empty(&self) -> bool {
        self.disconnect.is_empty() && self.connect.is_empty()
    }

    /// Tip after the switch, if any header was connected
    pub fn new_tip(&self) -> Option<Position> {
        self.connect.last().copied()
    }

    /// Tip before the switch, if any header was disconnected
    pub fn old_tip(&self) -> Option<Position> {
        self.disconnect.first().copied()
    }
}

/// Availability of the header oracle to its collaborators.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum OracleState {
    Available,
    /// Chain state can no longer be guaranteed; mutations are refused
    Degraded { reason: String },
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(n: u8) -> BlockHash {
        let mut bytes = [0u8; 32];
        bytes[0] = n;
        BlockHash::from(bytes)
    }

    #[test]
    fn header_bytes_decode_to_same_header() {
        let header = Header {
            hash: hash(2),
            parent_hash: hash(1),
            height: 1,
            work: Work::from(1_000_000),
            timestamp: 1_231_006_505,
        };
        assert_eq!(Header::from_bytes(&header.to_bytes()).unwrap(), header);
    }

    #[test]
    fn garbage_header_bytes_fail() {
        assert!(Header::from_bytes(&[0xff, 0x00, 0x13]).is_err());
    }

    #[test]
    fn position_orders_by_height_then_hash() {
        let low = Position::new(1, hash(9));
        let high = Position::new(2, hash(1));
        assert!(low < high);
        assert!(Position::new(2, hash(0)) < high);
    }

    #[test]
    fn banned_parent_is_absorbing() {
        use HeaderStatus::*;
        assert_eq!(Normal.inherit(CheckpointBanned), CheckpointBanned);
        assert_eq!(Checkpoint.inherit(CheckpointBanned), CheckpointBanned);
        assert_eq!(Normal.inherit(Checkpoint), Normal);
        assert_eq!(CheckpointBanned.inherit(Normal), CheckpointBanned);
    }

    #[test]
    fn reorg_tips_come_from_each_end() {
        let reorg = Reorg {
            disconnect: vec![Position::new(2, hash(3)), Position::new(1, hash(2))],
            connect: vec![Position::new(1, hash(4)), Position::new(2, hash(5)), Position::new(3, hash(6))],
        };
        assert_eq!(reorg.old_tip(), Some(Position::new(2, hash(3))));
        assert_eq!(reorg.new_tip(), Some(Position::new(3, hash(6))));

        let extend = Reorg {
            disconnect: vec![],
            connect: vec![Position::new(3, hash(6))],
        };
        assert_eq!(extend.old_tip(), None);
    }
}
