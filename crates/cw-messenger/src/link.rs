//! The seam to the external AMQP 1.0 library.
//!
//! The connection, session, and frame plumbing live outside this crate; a
//! transport implements these traits over its AMQP stack, tests implement
//! them with mocks. The seam is polled: the messenger reads endpoint states
//! and drains completions/deliveries from inside `tick()`, which keeps every
//! callback on the caller's thread.
//!
//! `open_sender`/`open_receiver` hand back an endpoint that is already
//! attaching; link handle and endpoint handle are one object, so an endpoint
//! exists exactly when its link does.

use std::cell::RefCell;
use std::rc::Rc;

use thiserror::Error;

use cw_common::{AmqpMessage, AttachProperties};

/// Sub-state of a sender or receiver endpoint, mirrored from the library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Opening,
    Open,
    Closing,
    Error,
}

/// When the receiver settles an inbound delivery. `First` settles as soon as
/// the disposition is sent; there is no further exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverSettleMode {
    First,
    Second,
}

#[derive(Debug, Clone)]
pub struct SenderOptions {
    pub name: String,
    pub source: String,
    pub target: String,
    pub attach_properties: AttachProperties,
    /// `None` leaves the link's max-message-size unbounded.
    pub max_message_size: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ReceiverOptions {
    pub name: String,
    pub source: String,
    pub target: String,
    pub attach_properties: AttachProperties,
    pub max_message_size: Option<u64>,
    pub settle_mode: ReceiverSettleMode,
}

/// Result of one transfer started with [`MessageSender::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendCompletion {
    Ok,
    Error,
    Cancelled,
    Timeout,
}

/// Terminal verdict returned to the peer for a received delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Accepted,
    Released,
    Rejected { condition: String, description: String },
}

/// One inbound transfer surfaced by a receiver.
#[derive(Debug, Clone)]
pub struct InboundDelivery {
    pub message: AmqpMessage,
    /// Per-link monotonically increasing wire identifier.
    pub delivery_id: u64,
}

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Link is detached")]
    Detached,

    #[error("Link is in an invalid state for this operation")]
    InvalidState,

    #[error("Link attach rejected: {0}")]
    Rejected(String),

    #[error("Delivery {0} is not awaiting a disposition")]
    UnknownDelivery(u64),

    #[error("I/O error: {0}")]
    Io(String),
}

pub trait MessageSender {
    fn state(&self) -> LinkState;

    /// Start one transfer. The library takes its own copy of the message;
    /// the caller keeps ownership of the original for retries.
    fn send(&mut self, message: AmqpMessage) -> Result<(), LinkError>;

    /// Drain transfer results, in the order `send` was called.
    fn poll_completion(&mut self) -> Option<SendCompletion>;

    fn close(&mut self) -> Result<(), LinkError>;
}

pub trait MessageReceiver {
    fn state(&self) -> LinkState;

    /// Drain inbound deliveries in arrival order.
    fn try_next(&mut self) -> Option<InboundDelivery>;

    fn disposition(&mut self, delivery_id: u64, disposition: Disposition) -> Result<(), LinkError>;

    fn close(&mut self) -> Result<(), LinkError>;
}

/// One AMQP session; both of a messenger's links are parented by it.
pub trait AmqpSession {
    fn open_sender(&mut self, options: SenderOptions) -> Result<Box<dyn MessageSender>, LinkError>;

    fn open_receiver(
        &mut self,
        options: ReceiverOptions,
    ) -> Result<Box<dyn MessageReceiver>, LinkError>;
}

/// Shared handle to a session owned by the transport. The messenger keeps a
/// clone while started and drops it on stop; it never tears the session down.
pub type SessionHandle = Rc<RefCell<dyn AmqpSession>>;
