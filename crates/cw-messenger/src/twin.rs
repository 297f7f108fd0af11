//! Device-twin framing adapter.
//!
//! Wraps an [`AmqpMessenger`] with the twin protocol's wire constants: both
//! links use the `twin/` suffix, attach with a per-instance correlation id,
//! and reported-state updates carry the fixed resource/operation/version
//! annotations. Twin payloads are opaque bytes here; encoding and decoding
//! them belongs to the caller.

use std::time::Instant;

use bytes::Bytes;
use serde_json::{Map, Value};
use uuid::Uuid;

use cw_common::{
    AmqpMessage, AnnotationValue, AttachProperties, DeviceIdentity, MessengerState, SendOutcome,
    SendStatus, DEFAULT_DEVICES_PATH_TEMPLATE,
};

use crate::link::SessionHandle;
use crate::messenger::{
    AmqpMessenger, DispositionResult, DispositionTicket, MessageResponse, MessengerConfig,
};
use crate::Result;

/// Link suffix for both twin directions.
pub const TWIN_LINK_SUFFIX: &str = "twin/";

pub const CHANNEL_CORRELATION_ID_PROPERTY: &str = "com.microsoft:channel-correlation-id";
pub const API_VERSION_PROPERTY: &str = "com.microsoft:api-version";
pub const API_VERSION: &str = "1.0";

pub const RESOURCE_ANNOTATION: &str = "resource";
pub const OPERATION_ANNOTATION: &str = "operation";
pub const VERSION_ANNOTATION: &str = "version";
pub const DESIRED_PROPERTIES_RESOURCE: &str = "/notifications/twin/properties/desired";
pub const PATCH_OPERATION: &str = "PATCH";

/// Outcome of one reported-state update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportStateResult {
    Success,
    Error,
}

#[derive(Debug, Clone)]
pub struct TwinConfig {
    pub device_id: String,
    pub host_fqdn: String,
}

pub struct TwinMessenger {
    messenger: AmqpMessenger,
    correlation_id: String,
}

impl TwinMessenger {
    pub fn new(config: TwinConfig) -> Result<Self> {
        let correlation_id = format!("twin:{}", Uuid::new_v4());
        let mut attach_properties = AttachProperties::new();
        attach_properties.insert(
            CHANNEL_CORRELATION_ID_PROPERTY.to_string(),
            correlation_id.clone(),
        );
        attach_properties.insert(API_VERSION_PROPERTY.to_string(), API_VERSION.to_string());

        let identity = DeviceIdentity {
            device_id: config.device_id,
            host_fqdn: config.host_fqdn,
            devices_path_template: DEFAULT_DEVICES_PATH_TEMPLATE.to_string(),
            send_link_suffix: TWIN_LINK_SUFFIX.to_string(),
            receive_link_suffix: TWIN_LINK_SUFFIX.to_string(),
        };
        let mut messenger_config = MessengerConfig::new(identity);
        messenger_config.attach_properties = attach_properties;

        Ok(Self {
            messenger: AmqpMessenger::new(messenger_config)?,
            correlation_id,
        })
    }

    /// Install a state listener on the underlying messenger.
    pub fn with_state_listener(
        mut self,
        listener: impl FnMut(MessengerState, MessengerState) + 'static,
    ) -> Self {
        self.messenger = self.messenger.with_state_listener(listener);
        self
    }

    /// The `twin:<uuid>` token attached to both links as the
    /// channel-correlation-id.
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Queue a reported-state update. The payload is framed with the twin
    /// annotations and sent through the underlying messenger; `on_done` fires
    /// once with `Success` iff the send completed `Ok`.
    pub fn report_state_async(
        &mut self,
        payload: Bytes,
        on_done: impl FnOnce(ReportStateResult) + 'static,
    ) -> Result<()> {
        let message = AmqpMessage::new(payload)
            .annotate(RESOURCE_ANNOTATION, DESIRED_PROPERTIES_RESOURCE)
            .annotate(OPERATION_ANNOTATION, PATCH_OPERATION)
            .annotate(VERSION_ANNOTATION, AnnotationValue::Null);
        self.messenger.send_async(message, move |outcome| {
            on_done(match outcome {
                SendOutcome::Ok => ReportStateResult::Success,
                _ => ReportStateResult::Error,
            })
        })
    }

    /// Subscribe for desired-property patches. Messages arrive undecoded.
    pub fn subscribe(
        &mut self,
        on_message: impl FnMut(&AmqpMessage, DispositionTicket) -> MessageResponse + 'static,
    ) -> Result<()> {
        self.messenger.subscribe(on_message)
    }

    pub fn unsubscribe(&mut self) -> Result<()> {
        self.messenger.unsubscribe()
    }

    pub fn send_message_disposition(
        &mut self,
        ticket: DispositionTicket,
        result: DispositionResult,
    ) -> Result<()> {
        self.messenger.send_message_disposition(ticket, result)
    }

    pub fn start(&mut self, session: SessionHandle) -> Result<()> {
        self.messenger.start(session)
    }

    pub fn stop(&mut self) -> Result<()> {
        self.messenger.stop()
    }

    pub fn tick(&mut self, now: Instant) {
        self.messenger.tick(now)
    }

    pub fn state(&self) -> MessengerState {
        self.messenger.state()
    }

    /// Delegates to the underlying messenger: `Idle` iff its queue is empty.
    pub fn send_status(&self) -> SendStatus {
        self.messenger.send_status()
    }

    /// No options are recognized at the twin layer; any name/value is
    /// accepted and ignored. The recognized options live on the underlying
    /// messenger.
    pub fn set_option(&mut self, _name: &str, _value: &Value) -> Result<()> {
        Ok(())
    }

    /// Shape-preserving counterpart of `set_option`: always an empty map.
    pub fn retrieve_options(&self) -> Result<Value> {
        Ok(Value::Object(Map::new()))
    }
}
