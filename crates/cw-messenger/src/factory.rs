//! Synthesis of link names, addresses, and attach options from a device
//! identity. Everything here is pure: no state, no side effects beyond the
//! uuid draw that makes link names unique.

use uuid::Uuid;

use cw_common::{AttachProperties, DeviceIdentity};

use crate::link::{ReceiverOptions, ReceiverSettleMode, SenderOptions};

const SENDER_LINK_PREFIX: &str = "sender";
const RECEIVER_LINK_PREFIX: &str = "receiver";

/// Inbound transfers are capped; outbound links stay unbounded.
pub const RECEIVER_MAX_MESSAGE_SIZE: u64 = 65_536;

pub struct LinkFactory<'a> {
    identity: &'a DeviceIdentity,
    attach_properties: &'a AttachProperties,
}

impl<'a> LinkFactory<'a> {
    pub fn new(identity: &'a DeviceIdentity, attach_properties: &'a AttachProperties) -> Self {
        Self {
            identity,
            attach_properties,
        }
    }

    /// `amqps://<devices path>/<suffix>`, with the suffix used verbatim.
    pub fn link_address(&self, suffix: &str) -> String {
        format!("amqps://{}/{}", self.identity.devices_path(), suffix)
    }

    /// `<prefix>-<device_id>-<uuid>`; unique per call so a reopened link never
    /// collides with a half-closed predecessor on the broker.
    pub fn unique_link_name(&self, prefix: &str) -> String {
        format!("{}-{}-{}", prefix, self.identity.device_id, Uuid::new_v4())
    }

    pub fn sender_options(&self) -> SenderOptions {
        let name = self.unique_link_name(SENDER_LINK_PREFIX);
        SenderOptions {
            source: format!("{name}-source"),
            target: self.link_address(&self.identity.send_link_suffix),
            attach_properties: self.attach_properties.clone(),
            max_message_size: None,
            name,
        }
    }

    pub fn receiver_options(&self) -> ReceiverOptions {
        let name = self.unique_link_name(RECEIVER_LINK_PREFIX);
        ReceiverOptions {
            source: self.link_address(&self.identity.receive_link_suffix),
            target: format!("{name}-target"),
            attach_properties: self.attach_properties.clone(),
            max_message_size: Some(RECEIVER_MAX_MESSAGE_SIZE),
            settle_mode: ReceiverSettleMode::First,
            name,
        }
    }
}
