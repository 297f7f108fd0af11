use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue is full")]
    Full,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
