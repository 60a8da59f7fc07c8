use thiserror::Error;

pub type Result<T> = std::result::Result<T, RepoError>;

#[derive(Error, Debug)]
pub enum RepoError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid entity id: {0}")]
    InvalidId(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
