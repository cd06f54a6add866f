use crate::{
    types::{Checkpoint, Header, HeaderStatus, Height, OracleState, Position},
    work::Work,
    BlockHash,
};

pub const DEFAULT_HEADERS_QUERY_TOPIC: (&str, &str) =
    ("headers-query-topic", "opentxs.query.headers");

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum HeadersStateQuery {
    GetBestTip,
    GetHeightAt { height: Height },
    GetHeader { hash: BlockHash },
    GetBestHashes { start: Height, limit: usize },
    GetRecentHashes { limit: usize },
    IsInBestChain { position: Position },
    GetCommonParent { position: Position },
    GetSiblings,
    GetAncestors { start: Position, stop: Position },
    GetCheckpoint,
    GetStatus,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum HeadersStateQueryResponse {
    BestTip(BestTip),
    HeightAt(Option<BlockHash>),
    Header(HeaderInfo),
    BestHashes(Vec<BlockHash>),
    RecentHashes(Vec<BlockHash>),
    IsInBestChain(bool),
    CommonParent(CommonParent),
    Siblings(Vec<Position>),
    Ancestors(Vec<Position>),
    Checkpoint(Option<Checkpoint>),
    Status(OracleState),
    NotFound,
    Error(String),
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BestTip {
    pub position: Position,
    pub work: Work,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct HeaderInfo {
    pub header: Header,
    /// Cumulative work; `None` while disconnected
    pub work: Option<Work>,
    pub status: HeaderStatus,
    pub in_best_chain: bool,
}

/// Deepest best-chain ancestor of a position, alongside the current tip
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CommonParent {
    pub parent: Position,
    pub best: Position,
}
