//! Bridge error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("peer {0} already configured")]
    AlreadyExists(String),

    #[error("peer {0} not found")]
    NotFound(String),

    #[error("invalid peer url: {0}")]
    InvalidUrl(String),

    #[error(transparent)]
    Storage(#[from] mqmesh_storage::StorageError),
}
