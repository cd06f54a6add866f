//! Error types for header oracle operations.

use opentxs_common::{BlockHash, Height};

/// Errors returned by [`HeaderOracle`](crate::oracle::HeaderOracle) operations.
///
/// Linkage and checkpoint outcomes are not errors; they are reported through
/// [`AcceptOutcome`](crate::fork_choice::AcceptOutcome) and
/// [`IngestStatus`](crate::sync_ingestor::IngestStatus).
#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    /// The header is already present in the store.
    #[error("duplicate header: {hash}")]
    DuplicateHeader { hash: BlockHash },

    /// The header cannot be part of any valid chain.
    #[error("invalid header {hash}: {reason}")]
    InvalidHeader { hash: BlockHash, reason: String },

    /// A hash referenced by an operation is not in the store.
    #[error("unknown header: {hash}")]
    UnknownHeader { hash: BlockHash },

    /// The checkpoint contradicts the configured genesis header.
    #[error("invalid checkpoint at height {height}: {reason}")]
    InvalidCheckpoint { height: Height, reason: String },

    /// Persisted chain state was built for a different genesis header.
    #[error("genesis mismatch: configured {configured}, stored {stored}")]
    GenesisMismatch {
        configured: BlockHash,
        stored: BlockHash,
    },

    /// Persisted chain state uses an unsupported schema version.
    #[error("incompatible store version: expected {expected}, found {found}")]
    IncompatibleVersion { expected: u32, found: u32 },

    /// The backing store failed; chain state can no longer be guaranteed.
    #[error("storage failure: {0}")]
    StorageFailure(#[source] anyhow::Error),

    /// A previous storage failure stopped all further mutation.
    #[error("header oracle is degraded: {reason}")]
    Degraded { reason: String },

    /// The oracle has been shut down.
    #[error("header oracle is stopped")]
    Stopped,

    /// The best chain index has no entry where one is required.
    #[error("best chain has no header at height {height}")]
    MissingBestChainEntry { height: Height },
}

impl OracleError {
    pub(crate) fn invalid(hash: BlockHash, reason: impl Into<String>) -> Self {
        Self::InvalidHeader {
            hash,
            reason: reason.into(),
        }
    }
}
