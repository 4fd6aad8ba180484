//! Error types for the master engine.
//!
//! Protocol-level outcomes (RESET, WAIT, SOFT_ERROR, ...) are response codes,
//! not errors. `MasterError` covers the cases where an operation on the
//! engine's own API cannot proceed.

use thiserror::Error;
use vecfarm_array::CodecError;
use vecfarm_wire::ClientId;

#[derive(Debug, Error)]
pub enum MasterError {
    /// No live session is registered under this client id.
    #[error("client {client_id} has no live session")]
    UnknownClient { client_id: ClientId },

    /// Every receiver of the ingestion queue has been dropped.
    #[error("ingestion queue closed")]
    QueueClosed,

    /// Request body could not be decoded.
    #[error("malformed request: {0}")]
    Decode(#[from] prost::DecodeError),

    /// Frame arrived without an observation.
    #[error("frame carries no observation")]
    MissingObservation,

    /// Frame carried an observation that does not match its declared layout.
    #[error("invalid observation: {0}")]
    Codec(#[from] CodecError),
}

/// Result type alias for master operations.
pub type Result<T> = std::result::Result<T, MasterError>;
