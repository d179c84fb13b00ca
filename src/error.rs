use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReplikvError {
    #[error("not the leader, current leader is node {0:?}")]
    NotLeader(Option<u64>),

    #[error("proposal was not committed before the deadline")]
    ProposalTimeout,

    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),

    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

pub type Result<T> = std::result::Result<T, ReplikvError>;
