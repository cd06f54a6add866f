//! Definition of bus messages

use crate::commands::header_oracle::{HeaderOracleCommand, HeaderOracleCommandResponse};
use crate::queries::headers::{HeadersStateQuery, HeadersStateQueryResponse};
use crate::types::{Header, OracleState, Reorg};
use crate::{BlockHash, FilterHash};

/// Decoded headers announced by a peer
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct HeadersMessage {
    /// Headers in the order the peer sent them
    pub headers: Vec<Header>,
}

/// One entry of a sync-server batch
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SyncHeader {
    /// Declared header hash
    pub hash: BlockHash,

    /// Encoded header
    pub bytes: Vec<u8>,

    /// Compact-filter header for this block, forwarded untouched
    pub filter_header: Option<FilterHash>,

    /// Compact-filter hash for this block, forwarded untouched
    pub filter_hash: Option<FilterHash>,
}

/// Batch of headers from a sync server
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SyncHeadersMessage {
    /// Hash the first header in the batch builds on
    pub prior_hash: BlockHash,

    /// Headers in chain order
    pub headers: Vec<SyncHeader>,
}

/// Compact-filter data forwarded from an accepted sync batch
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FilterHeadersMessage {
    pub prior_hash: BlockHash,

    /// (block hash, filter header, filter hash)
    pub filters: Vec<(BlockHash, Option<FilterHash>, Option<FilterHash>)>,
}

/// Best chain changed
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ReorgMessage {
    pub reorg: Reorg,
}

/// Oracle availability changed
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct OracleStatusMessage {
    pub state: OracleState,
}

/// State queries
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum StateQuery {
    Headers(HeadersStateQuery),
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum StateQueryResponse {
    Headers(HeadersStateQueryResponse),
}

/// Administrative commands
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Command {
    HeaderOracle(HeaderOracleCommand),
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum CommandResponse {
    HeaderOracle(HeaderOracleCommandResponse),
}

// === Global message enum ===
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Message {
    None(()), // Just so we have a simple default

    // Generic messages, get out of jail free cards
    String(String),
    JSON(serde_json::Value),

    // Header subsystem messages
    Headers(HeadersMessage),
    SyncHeaders(SyncHeadersMessage),
    FilterHeaders(FilterHeadersMessage),
    Reorg(ReorgMessage),
    OracleStatus(OracleStatusMessage),

    // Request/response
    StateQuery(StateQuery),
    StateQueryResponse(StateQueryResponse),
    Command(Command),
    CommandResponse(CommandResponse),
}

impl Default for Message {
    fn default() -> Self {
        Self::None(())
    }
}

// Casts from specific messages
impl From<HeadersMessage> for Message {
    fn from(msg: HeadersMessage) -> Self {
        Message::Headers(msg)
    }
}

impl From<SyncHeadersMessage> for Message {
    fn from(msg: SyncHeadersMessage) -> Self {
        Message::SyncHeaders(msg)
    }
}

impl From<ReorgMessage> for Message {
    fn from(msg: ReorgMessage) -> Self {
        Message::Reorg(msg)
    }
}

impl From<OracleStatusMessage> for Message {
    fn from(msg: OracleStatusMessage) -> Self {
        Message::OracleStatus(msg)
    }
}
