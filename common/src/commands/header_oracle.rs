use crate::{types::Checkpoint, BlockHash};

pub const DEFAULT_HEADER_ORACLE_COMMAND_TOPIC: (&str, &str) =
    ("command-topic", "opentxs.command.header-oracle");

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum HeaderOracleCommand {
    /// Replace the active checkpoint
    SetCheckpoint(Checkpoint),

    /// Stop enforcing the checkpoint; banned headers stay banned
    ClearCheckpoint,

    /// Reset the checkpoint status of one header
    RemoveCheckpointState { hash: BlockHash },

    /// Retry the write that left the oracle degraded
    Resume,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum HeaderOracleCommandResponse {
    Done,
    Error(String),
}
