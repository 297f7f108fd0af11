//! Device-to-cloud AMQP messaging core.
//!
//! This crate provides:
//! - AmqpMessenger: lifecycle state machine over one send link and one
//!   optional receive link, with a retrying send queue and explicit
//!   dispositions for inbound deliveries
//! - LinkFactory: link name/address/attach-option synthesis from a device
//!   identity
//! - TwinMessenger: device-twin framing adapter on top of AmqpMessenger
//! - link: the trait seam behind which the external AMQP 1.0 stack lives

pub mod error;
pub mod factory;
pub mod link;
pub mod messenger;
pub mod twin;

pub use error::MessengerError;
pub use factory::{LinkFactory, RECEIVER_MAX_MESSAGE_SIZE};
pub use link::{
    AmqpSession, Disposition, InboundDelivery, LinkError, LinkState, MessageReceiver,
    MessageSender, ReceiverOptions, ReceiverSettleMode, SendCompletion, SenderOptions,
    SessionHandle,
};
pub use messenger::{
    AmqpMessenger, DispositionResult, DispositionTicket, MessageResponse, MessengerConfig,
    DEFAULT_MAX_SEND_ERROR_COUNT, LINK_OPEN_TIMEOUT, OPTION_EVENT_SEND_TIMEOUT_SECS,
    OPTION_MESSAGE_QUEUE_OPTIONS,
};
pub use twin::{ReportStateResult, TwinConfig, TwinMessenger};

pub type Result<T> = std::result::Result<T, MessengerError>;
