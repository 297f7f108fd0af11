use bytes::Bytes;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub mod logging;

// ============================================================================
// Device Identity
// ============================================================================

/// Default template for the devices path: `<host_fqdn>/devices/<device_id>`.
pub const DEFAULT_DEVICES_PATH_TEMPLATE: &str = "{host_fqdn}/devices/{device_id}";

const HOST_PLACEHOLDER: &str = "{host_fqdn}";
const DEVICE_PLACEHOLDER: &str = "{device_id}";

/// Identity of one device against one hub, immutable for the lifetime of a
/// messenger.
///
/// The link suffixes are appended verbatim to the rendered devices path when
/// building link addresses; the direction-specific values (`/messages/events`,
/// `/messages/devicebound`, `twin/`) come from the layer that owns the
/// protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub host_fqdn: String,
    /// Template rendered with `{host_fqdn}` and `{device_id}`.
    pub devices_path_template: String,
    pub send_link_suffix: String,
    pub receive_link_suffix: String,
}

impl DeviceIdentity {
    /// Check that every field is usable before any link is derived from it.
    pub fn validate(&self) -> Result<(), IdentityError> {
        for (name, value) in [
            ("device_id", &self.device_id),
            ("host_fqdn", &self.host_fqdn),
            ("devices_path_template", &self.devices_path_template),
            ("send_link_suffix", &self.send_link_suffix),
            ("receive_link_suffix", &self.receive_link_suffix),
        ] {
            if value.is_empty() {
                return Err(IdentityError::Empty(name));
            }
        }
        if !self.devices_path_template.contains(HOST_PLACEHOLDER)
            || !self.devices_path_template.contains(DEVICE_PLACEHOLDER)
        {
            return Err(IdentityError::Template);
        }
        Ok(())
    }

    /// Render the devices path, e.g. `h.example/devices/dev1`.
    pub fn devices_path(&self) -> String {
        self.devices_path_template
            .replace(HOST_PLACEHOLDER, &self.host_fqdn)
            .replace(DEVICE_PLACEHOLDER, &self.device_id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("Identity field `{0}` must not be empty")]
    Empty(&'static str),

    #[error("Devices path template must contain {{host_fqdn}} and {{device_id}}")]
    Template,
}

// ============================================================================
// Messages
// ============================================================================

/// Properties applied to a link at attach time (symbol -> string map).
///
/// Owned by whoever configures the messenger; the core deep-clones the map
/// into every link it opens and never hands out a shared reference.
pub type AttachProperties = IndexMap<String, String>;

/// A message-annotation value. The twin protocol only ever writes strings and
/// an explicit null, so that is the whole vocabulary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnnotationValue {
    String(String),
    Null,
}

impl From<&str> for AnnotationValue {
    fn from(value: &str) -> Self {
        AnnotationValue::String(value.to_string())
    }
}

impl From<String> for AnnotationValue {
    fn from(value: String) -> Self {
        AnnotationValue::String(value)
    }
}

/// An AMQP message as the core sees it: message annotations plus an opaque
/// body. The core never parses the body (framing belongs to adapters).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AmqpMessage {
    pub message_annotations: IndexMap<String, AnnotationValue>,
    pub body: Bytes,
}

impl AmqpMessage {
    pub fn new(body: Bytes) -> Self {
        Self {
            message_annotations: IndexMap::new(),
            body,
        }
    }

    /// Add one message annotation, replacing any previous value for the key.
    pub fn annotate(mut self, key: impl Into<String>, value: impl Into<AnnotationValue>) -> Self {
        self.message_annotations.insert(key.into(), value.into());
        self
    }
}

// ============================================================================
// Messenger State & Outcomes
// ============================================================================

/// Top-level messenger lifecycle state.
///
/// `Error` persists until an explicit `stop` + `start`; the messenger never
/// restarts itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessengerState {
    Stopped,
    Starting,
    Started,
    Stopping,
    Error,
}

/// Terminal outcome reported once per submitted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Accepted by the peer.
    Ok,
    /// Failed after exhausting retries.
    Failed,
    /// Aged out of the queue or exceeded its processing window.
    TimedOut,
    /// The messenger was torn down with the message still queued.
    MessengerDestroyed,
    /// Reserved for adapters that decode reply bodies.
    Unparseable,
}

/// Coarse view of the send pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Nothing pending and nothing in flight.
    Idle,
    Busy,
}
