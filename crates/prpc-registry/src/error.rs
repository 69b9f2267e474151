use prpc_common::PrpcError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("node {0} already exists")]
    NodeExists(String),

    #[error("node {0} not found")]
    NodeNotFound(String),

    #[error("{service}@{group} already subscribed by {subscriber}")]
    AlreadySubscribed {
        service: String,
        group: String,
        subscriber: String,
    },

    #[error("invalid node option: {0}")]
    InvalidOption(String),

    #[error("decode node error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("registry closed")]
    Closed,
}

impl From<RegistryError> for PrpcError {
    fn from(err: RegistryError) -> Self {
        PrpcError::Registry(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;
