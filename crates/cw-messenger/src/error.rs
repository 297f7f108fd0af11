use cw_common::MessengerState;
use thiserror::Error;

use crate::link::LinkError;

#[derive(Error, Debug)]
pub enum MessengerError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Operation not allowed while {0:?}")]
    WrongState(MessengerState),

    #[error("Send queue is full")]
    QueueFull,

    #[error("Already subscribed for messages")]
    AlreadySubscribed,

    #[error("Not subscribed for messages")]
    NotSubscribed,

    #[error("No receiver link is open")]
    NoReceiver,

    #[error("Disposition ticket does not match the open receiver link")]
    StaleTicket,

    #[error("Unknown option: {0}")]
    UnknownOption(String),

    #[error("Invalid value for option `{0}`")]
    InvalidOptionValue(String),

    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("Queue error: {0}")]
    Queue(#[from] cw_queue::QueueError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
