use thiserror::Error;

use crate::block::BlockHash;

/// Failures surfaced by the hashgraph core.
///
/// `AlreadyExists` and `Pending` are deliberately absent: they are admission outcomes
/// (see [`crate::store::Admission`]), not errors.
#[derive(Debug, Error)]
pub enum HashgraphError {
    /// The bytes could not be decoded into a block, or the block is structurally invalid.
    #[error("malformed block: {0}")]
    MalformedBlock(String),

    /// The transmitted hash does not match the hash recomputed from the event.
    #[error("integrity error: block claims {claimed} but its event hashes to {computed}")]
    IntegrityError { claimed: BlockHash, computed: BlockHash },

    /// The topic root has never been committed locally.
    ///
    /// Usually a local backfill gap rather than a caller bug, so it is never papered over
    /// with an empty result.
    #[error("unknown topic {0}")]
    UnknownTopic(BlockHash),

    #[error("block {0} not found")]
    NotFound(BlockHash),

    /// An envelope arrived with a message type this core does not handle.
    #[error("unknown message type {0}")]
    UnknownMessageType(String),

    #[error("transport error: {0}")]
    Transport(String),
}

pub type Result<T, E = HashgraphError> = std::result::Result<T, E>;
