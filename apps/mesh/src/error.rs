use thiserror::Error;

use crate::transport::chunk::ChunkError;

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("no open link to peer {0}")]
    UnknownPeer(String),
    #[error("room manager is not running")]
    ManagerStopped,
    #[error(transparent)]
    Chunk(#[from] ChunkError),
}

pub type MeshResult<T> = Result<T, MeshError>;
