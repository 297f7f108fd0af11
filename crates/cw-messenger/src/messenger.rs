//! The generic bidirectional AMQP messenger.
//!
//! An `AmqpMessenger` owns one sender link and (while subscribed) one
//! receiver link over a session shared with the transport, plus the outbound
//! send queue. Everything is driven by `tick(now)`:
//! - link sub-states are read and folded into the messenger state machine
//!   (`Stopped -> Starting -> Started`, with `Error` as the terminal fault),
//! - outbound items are handed to the sender and their wire completions are
//!   drained back into the queue,
//! - inbound deliveries are handed to the subscriber together with a
//!   [`DispositionTicket`], and the subscriber's verdict (or a later
//!   [`AmqpMessenger::send_message_disposition`]) is forwarded to the peer.
//!
//! `Error` persists until an explicit `stop` + `start`; the messenger never
//! reconnects on its own.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use cw_common::{
    AmqpMessage, AttachProperties, DeviceIdentity, MessengerState, SendOutcome, SendStatus,
};
use cw_queue::{Dispatch, ItemId, MessageQueue, ProcessingResult, QueueError, QueueOptions, QueueStats};

use crate::error::MessengerError;
use crate::factory::LinkFactory;
use crate::link::{
    Disposition, LinkState, MessageReceiver, MessageSender, SendCompletion, SessionHandle,
};
use crate::Result;

/// How long a link may stay in `Opening` before the messenger faults.
pub const LINK_OPEN_TIMEOUT: Duration = Duration::from_secs(300);

/// Default for [`MessengerConfig::max_send_error_count`].
pub const DEFAULT_MAX_SEND_ERROR_COUNT: u32 = 10;

/// Option: unsigned integer, seconds an outbound message may stay queued.
pub const OPTION_EVENT_SEND_TIMEOUT_SECS: &str = "amqp_event_send_timeout_secs";
/// Option: opaque queue-options blob, as produced by `retrieve_options`.
pub const OPTION_MESSAGE_QUEUE_OPTIONS: &str = "amqp_message_queue_options";

const REJECT_MESSAGE_REASON: &str = "Rejected by application";

#[derive(Debug, Clone)]
pub struct MessengerConfig {
    pub identity: DeviceIdentity,
    /// Applied (cloned) to both links at attach time.
    pub attach_properties: AttachProperties,
    /// Consecutive wire-level send failures tolerated before the messenger
    /// faults.
    pub max_send_error_count: u32,
    pub queue: QueueOptions,
}

impl MessengerConfig {
    pub fn new(identity: DeviceIdentity) -> Self {
        Self {
            identity,
            attach_properties: AttachProperties::new(),
            max_send_error_count: DEFAULT_MAX_SEND_ERROR_COUNT,
            queue: QueueOptions::default(),
        }
    }
}

/// Subscriber's response to a delivered message. `Deferred` keeps the ticket
/// alive for a later [`AmqpMessenger::send_message_disposition`]; the other
/// three answer the peer before the subscriber returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageResponse {
    Accepted,
    Released,
    Rejected,
    Deferred,
}

/// Verdict vocabulary of [`AmqpMessenger::send_message_disposition`].
/// `None` consumes the ticket without answering the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispositionResult {
    Accepted,
    Released,
    Rejected,
    None,
}

/// Proof of one inbound delivery that still owes the peer a disposition.
///
/// Not cloneable: it is consumed by value in `send_message_disposition`, so a
/// delivery can be answered at most once. Dropping the ticket answers with
/// nothing.
#[derive(Debug)]
pub struct DispositionTicket {
    link_name: String,
    delivery_id: u64,
}

impl DispositionTicket {
    fn new(link_name: String, delivery_id: u64) -> Self {
        Self {
            link_name,
            delivery_id,
        }
    }

    pub fn link_name(&self) -> &str {
        &self.link_name
    }

    pub fn delivery_id(&self) -> u64 {
        self.delivery_id
    }
}

type StateListener = Box<dyn FnMut(MessengerState, MessengerState)>;
type SubscriberFn = Box<dyn FnMut(&AmqpMessage, DispositionTicket) -> MessageResponse>;

/// Observed sub-state of one endpoint: current, previous, and when the last
/// change was seen. `changed_at == None` means no observation yet.
#[derive(Debug, Clone, Copy)]
struct LinkStateTrack {
    current: LinkState,
    previous: LinkState,
    changed_at: Option<Instant>,
}

impl LinkStateTrack {
    fn new() -> Self {
        Self {
            current: LinkState::Idle,
            previous: LinkState::Idle,
            changed_at: None,
        }
    }

    fn observe(&mut self, state: LinkState, now: Instant) {
        if state != self.current {
            self.previous = self.current;
            self.current = state;
            self.changed_at = Some(now);
        } else if self.changed_at.is_none() {
            self.changed_at = Some(now);
        }
    }

    /// Time spent in the current sub-state.
    fn stuck_for(&self, now: Instant) -> Duration {
        self.changed_at
            .map(|at| now.duration_since(at))
            .unwrap_or(Duration::ZERO)
    }
}

pub struct AmqpMessenger {
    identity: DeviceIdentity,
    attach_properties: AttachProperties,
    max_send_error_count: u32,

    state: MessengerState,
    session: Option<SessionHandle>,

    sender: Option<Box<dyn MessageSender>>,
    sender_link_name: Option<String>,
    sender_track: LinkStateTrack,

    receiver: Option<Box<dyn MessageReceiver>>,
    receiver_link_name: Option<String>,
    receiver_track: LinkStateTrack,

    subscriber: Option<SubscriberFn>,

    queue: MessageQueue<AmqpMessage>,
    /// Queue ids of dispatched items, in the order the sender took them;
    /// wire completions are matched against this FIFO.
    awaiting: VecDeque<ItemId>,
    consecutive_send_failures: u32,

    on_state_changed: Option<StateListener>,
    in_tick: bool,
}

impl AmqpMessenger {
    pub fn new(config: MessengerConfig) -> Result<Self> {
        config
            .identity
            .validate()
            .map_err(|e| MessengerError::Config(e.to_string()))?;
        info!(device_id = %config.identity.device_id, "messenger created");
        Ok(Self {
            identity: config.identity,
            attach_properties: config.attach_properties,
            max_send_error_count: config.max_send_error_count,
            state: MessengerState::Stopped,
            session: None,
            sender: None,
            sender_link_name: None,
            sender_track: LinkStateTrack::new(),
            receiver: None,
            receiver_link_name: None,
            receiver_track: LinkStateTrack::new(),
            subscriber: None,
            queue: MessageQueue::new(config.queue),
            awaiting: VecDeque::new(),
            consecutive_send_failures: 0,
            on_state_changed: None,
            in_tick: false,
        })
    }

    /// Install the state-changed listener, invoked synchronously with
    /// `(previous, new)` from inside the operation that transitioned. The
    /// listener must not call back into `start`/`stop` (guarded, fails with
    /// `WrongState`).
    pub fn with_state_listener(
        mut self,
        listener: impl FnMut(MessengerState, MessengerState) + 'static,
    ) -> Self {
        self.on_state_changed = Some(Box::new(listener));
        self
    }

    pub fn state(&self) -> MessengerState {
        self.state
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Wire-level send failures seen since the last success. Exposed for
    /// fault-injection tests and diagnostics.
    pub fn consecutive_send_failures(&self) -> u32 {
        self.consecutive_send_failures
    }

    /// Begin operating over `session`. Links are opened lazily by the next
    /// `tick`, never here.
    pub fn start(&mut self, session: SessionHandle) -> Result<()> {
        if self.in_tick || self.state != MessengerState::Stopped {
            return Err(MessengerError::WrongState(self.state));
        }
        self.session = Some(session);
        self.set_state(MessengerState::Starting);
        Ok(())
    }

    /// Tear down both links and return every in-flight item to the head of
    /// the pending queue; queued items survive for the next `start`.
    pub fn stop(&mut self) -> Result<()> {
        if self.in_tick || self.state == MessengerState::Stopped {
            return Err(MessengerError::WrongState(self.state));
        }
        self.set_state(MessengerState::Stopping);
        self.destroy_receiver();
        self.destroy_sender();
        self.session = None;
        self.queue.move_all_in_flight_back_to_pending();
        self.consecutive_send_failures = 0;
        self.set_state(MessengerState::Stopped);
        Ok(())
    }

    /// Queue `message` for delivery. `on_complete` fires exactly once with
    /// the terminal outcome; items queued while stopped are dispatched after
    /// the next `start`.
    pub fn send_async(
        &mut self,
        message: AmqpMessage,
        on_complete: impl FnOnce(SendOutcome) + 'static,
    ) -> Result<()> {
        let id = self
            .queue
            .enqueue(message, Instant::now(), move |result| {
                on_complete(send_outcome(result))
            })
            .map_err(|e| match e {
                QueueError::Full => MessengerError::QueueFull,
                other => MessengerError::Queue(other),
            })?;
        debug!(item = ?id, device_id = %self.identity.device_id, "message queued for send");
        Ok(())
    }

    /// `Idle` iff nothing is pending and nothing is in flight.
    pub fn send_status(&self) -> SendStatus {
        if self.queue.is_empty() {
            SendStatus::Idle
        } else {
            SendStatus::Busy
        }
    }

    /// Register the inbound subscriber. The receiver link is opened by the
    /// next `tick` once the messenger is started.
    pub fn subscribe(
        &mut self,
        on_message: impl FnMut(&AmqpMessage, DispositionTicket) -> MessageResponse + 'static,
    ) -> Result<()> {
        if self.subscriber.is_some() {
            return Err(MessengerError::AlreadySubscribed);
        }
        self.subscriber = Some(Box::new(on_message));
        Ok(())
    }

    /// Drop the subscriber; the receiver link is torn down by the next
    /// `tick`, releasing any deliveries still queued on it.
    pub fn unsubscribe(&mut self) -> Result<()> {
        if self.subscriber.is_none() {
            return Err(MessengerError::NotSubscribed);
        }
        self.subscriber = None;
        Ok(())
    }

    /// Answer a deferred delivery. Consumes the ticket; `None` consumes it
    /// without answering the peer.
    pub fn send_message_disposition(
        &mut self,
        ticket: DispositionTicket,
        result: DispositionResult,
    ) -> Result<()> {
        let Some(receiver) = self.receiver.as_deref_mut() else {
            return Err(MessengerError::NoReceiver);
        };
        if self.receiver_link_name.as_deref() != Some(ticket.link_name()) {
            return Err(MessengerError::StaleTicket);
        }
        let disposition = match result {
            DispositionResult::Accepted => Disposition::Accepted,
            DispositionResult::Released => Disposition::Released,
            DispositionResult::Rejected => rejected_by_application(),
            DispositionResult::None => {
                debug!(delivery_id = ticket.delivery_id(), "disposition withheld");
                return Ok(());
            }
        };
        receiver.disposition(ticket.delivery_id(), disposition)?;
        Ok(())
    }

    pub fn set_option(&mut self, name: &str, value: &Value) -> Result<()> {
        match name {
            OPTION_EVENT_SEND_TIMEOUT_SECS => {
                let secs = value
                    .as_u64()
                    .ok_or_else(|| MessengerError::InvalidOptionValue(name.to_string()))?;
                self.queue.set_max_enqueued_time(secs);
                Ok(())
            }
            OPTION_MESSAGE_QUEUE_OPTIONS => Ok(self.queue.restore_options(value)?),
            _ => Err(MessengerError::UnknownOption(name.to_string())),
        }
    }

    /// Snapshot the runtime-tunable options for persistence; feeding the
    /// result back through `set_option` restores them.
    pub fn retrieve_options(&self) -> Result<Value> {
        let mut options = Map::new();
        options.insert(
            OPTION_MESSAGE_QUEUE_OPTIONS.to_string(),
            self.queue.retrieve_options()?,
        );
        Ok(Value::Object(options))
    }

    /// One cooperative turn. All deferred work happens here: link creation
    /// and teardown, state evaluation, inbound delivery, queue dispatch and
    /// completion.
    pub fn tick(&mut self, now: Instant) {
        if matches!(
            self.state,
            MessengerState::Stopped | MessengerState::Stopping | MessengerState::Error
        ) {
            return;
        }
        self.in_tick = true;
        self.tick_inner(now);
        self.in_tick = false;
    }

    fn tick_inner(&mut self, now: Instant) {
        self.observe_links(now);
        self.evaluate_state(now);

        if self.state == MessengerState::Starting && self.sender.is_none() {
            if let Err(e) = self.create_sender(now) {
                error!(error = %e, device_id = %self.identity.device_id, "failed to open sender link");
                self.fail("sender link creation failed");
            }
        }

        if self.state != MessengerState::Started {
            return;
        }

        if self.subscriber.is_some() && self.receiver.is_none() {
            // Not fatal: creation is retried on every tick while subscribed.
            if let Err(e) = self.create_receiver(now) {
                warn!(error = %e, device_id = %self.identity.device_id, "failed to open receiver link, retrying");
            }
        } else if self.subscriber.is_none() && self.receiver.is_some() {
            self.destroy_receiver();
        }

        self.pump_inbound();
        self.pump_send_completions();
        self.dispatch_sends(now);

        if self.consecutive_send_failures >= self.max_send_error_count {
            self.fail("too many consecutive send failures");
        }
    }

    fn observe_links(&mut self, now: Instant) {
        if let Some(sender) = self.sender.as_deref() {
            self.sender_track.observe(sender.state(), now);
        }
        if let Some(receiver) = self.receiver.as_deref() {
            self.receiver_track.observe(receiver.state(), now);
        }
    }

    fn evaluate_state(&mut self, now: Instant) {
        match self.state {
            MessengerState::Starting if self.sender.is_some() => {
                match self.sender_track.current {
                    LinkState::Open => self.set_state(MessengerState::Started),
                    LinkState::Opening => {
                        if self.sender_track.stuck_for(now) >= LINK_OPEN_TIMEOUT {
                            self.fail("sender link did not open in time");
                        }
                    }
                    LinkState::Idle | LinkState::Closing | LinkState::Error => {
                        self.fail("sender link failed while starting");
                    }
                }
            }
            MessengerState::Started => {
                if self.sender_track.current != LinkState::Open {
                    self.fail("sender link left the open state");
                    return;
                }
                if self.subscriber.is_some() && self.receiver.is_some() {
                    match self.receiver_track.current {
                        LinkState::Open => {}
                        LinkState::Opening => {
                            if self.receiver_track.stuck_for(now) >= LINK_OPEN_TIMEOUT {
                                self.fail("receiver link did not open in time");
                            }
                        }
                        LinkState::Idle | LinkState::Closing | LinkState::Error => {
                            self.fail("receiver link failed");
                        }
                    }
                }
            }
            _ => {}
        }
    }

    fn create_sender(&mut self, now: Instant) -> Result<()> {
        let Some(session) = self.session.clone() else {
            return Err(MessengerError::WrongState(self.state));
        };
        let options = LinkFactory::new(&self.identity, &self.attach_properties).sender_options();
        let name = options.name.clone();
        info!(link = %name, target = %options.target, "opening sender link");
        let sender = session.borrow_mut().open_sender(options)?;
        self.sender_track = LinkStateTrack::new();
        self.sender_track.observe(sender.state(), now);
        self.sender = Some(sender);
        self.sender_link_name = Some(name);
        Ok(())
    }

    fn create_receiver(&mut self, now: Instant) -> Result<()> {
        let Some(session) = self.session.clone() else {
            return Err(MessengerError::WrongState(self.state));
        };
        let options = LinkFactory::new(&self.identity, &self.attach_properties).receiver_options();
        let name = options.name.clone();
        info!(link = %name, source = %options.source, "opening receiver link");
        let receiver = session.borrow_mut().open_receiver(options)?;
        self.receiver_track = LinkStateTrack::new();
        self.receiver_track.observe(receiver.state(), now);
        self.receiver = Some(receiver);
        self.receiver_link_name = Some(name);
        Ok(())
    }

    fn destroy_sender(&mut self) {
        if let Some(mut sender) = self.sender.take() {
            if let Err(e) = sender.close() {
                warn!(error = %e, link = ?self.sender_link_name, "error closing sender link");
            }
        }
        self.sender_link_name = None;
        self.sender_track = LinkStateTrack::new();
        self.awaiting.clear();
    }

    fn destroy_receiver(&mut self) {
        if let Some(mut receiver) = self.receiver.take() {
            // Deliveries nobody consumed go back to the peer.
            while let Some(delivery) = receiver.try_next() {
                debug!(delivery_id = delivery.delivery_id, "releasing unconsumed inbound message");
                if let Err(e) = receiver.disposition(delivery.delivery_id, Disposition::Released) {
                    warn!(error = %e, delivery_id = delivery.delivery_id, "failed to release inbound message");
                }
            }
            if let Err(e) = receiver.close() {
                warn!(error = %e, link = ?self.receiver_link_name, "error closing receiver link");
            }
        }
        self.receiver_link_name = None;
        self.receiver_track = LinkStateTrack::new();
    }

    fn pump_inbound(&mut self) {
        // Receiver management keeps these in lockstep: the receiver only
        // exists while a subscriber is installed.
        let (Some(receiver), Some(on_message)) =
            (self.receiver.as_deref_mut(), self.subscriber.as_mut())
        else {
            return;
        };
        let link_name = self.receiver_link_name.clone().unwrap_or_default();
        while let Some(delivery) = receiver.try_next() {
            debug!(delivery_id = delivery.delivery_id, "delivering inbound message");
            let ticket = DispositionTicket::new(link_name.clone(), delivery.delivery_id);
            let disposition = match on_message(&delivery.message, ticket) {
                MessageResponse::Accepted => Disposition::Accepted,
                MessageResponse::Released => Disposition::Released,
                MessageResponse::Rejected => rejected_by_application(),
                // The subscriber kept the ticket; nothing goes back to the
                // peer yet.
                MessageResponse::Deferred => continue,
            };
            if let Err(e) = receiver.disposition(delivery.delivery_id, disposition) {
                warn!(error = %e, delivery_id = delivery.delivery_id, "failed to send disposition");
            }
        }
    }

    fn pump_send_completions(&mut self) {
        let Some(sender) = self.sender.as_deref_mut() else {
            return;
        };
        while let Some(completion) = sender.poll_completion() {
            match completion {
                SendCompletion::Ok => self.consecutive_send_failures = 0,
                SendCompletion::Error => self.consecutive_send_failures += 1,
                SendCompletion::Cancelled | SendCompletion::Timeout => {}
            }
            let Some(id) = self.awaiting.pop_front() else {
                warn!("send completion with no matching in-flight item");
                continue;
            };
            self.queue.complete(id, completion_result(completion));
        }
    }

    fn dispatch_sends(&mut self, now: Instant) {
        let Some(sender) = self.sender.as_deref_mut() else {
            return;
        };
        let awaiting = &mut self.awaiting;
        let failures = &mut self.consecutive_send_failures;
        self.queue.tick(now, &mut |id, message: &AmqpMessage| {
            match sender.send(message.clone()) {
                Ok(()) => {
                    debug!(item = ?id, "message handed to sender");
                    awaiting.push_back(id);
                    Dispatch::Dispatched
                }
                Err(e) => {
                    warn!(item = ?id, error = %e, "synchronous send failure");
                    *failures += 1;
                    Dispatch::Failed
                }
            }
        });
    }

    fn set_state(&mut self, new: MessengerState) {
        if new == self.state {
            return;
        }
        let previous = self.state;
        self.state = new;
        if new == MessengerState::Error {
            error!(?previous, state = ?new, device_id = %self.identity.device_id, "messenger faulted");
        } else {
            info!(?previous, state = ?new, device_id = %self.identity.device_id, "messenger state changed");
        }
        if let Some(listener) = self.on_state_changed.as_mut() {
            listener(previous, new);
        }
    }

    fn fail(&mut self, reason: &str) {
        error!(reason, device_id = %self.identity.device_id, "fatal messenger failure");
        self.set_state(MessengerState::Error);
    }
}

impl Drop for AmqpMessenger {
    fn drop(&mut self) {
        if self.state != MessengerState::Stopped {
            self.set_state(MessengerState::Stopping);
            self.destroy_receiver();
            self.destroy_sender();
            self.session = None;
            self.set_state(MessengerState::Stopped);
        }
        // Hard cancel: every queued completion fires, then the callbacks die
        // with the queue.
        self.queue.fail_all(ProcessingResult::Cancelled);
    }
}

fn rejected_by_application() -> Disposition {
    Disposition::Rejected {
        condition: REJECT_MESSAGE_REASON.to_string(),
        description: REJECT_MESSAGE_REASON.to_string(),
    }
}

fn send_outcome(result: ProcessingResult) -> SendOutcome {
    match result {
        ProcessingResult::Success => SendOutcome::Ok,
        ProcessingResult::Error => SendOutcome::Failed,
        ProcessingResult::Timeout => SendOutcome::TimedOut,
        ProcessingResult::Cancelled => SendOutcome::MessengerDestroyed,
    }
}

fn completion_result(completion: SendCompletion) -> ProcessingResult {
    match completion {
        SendCompletion::Ok => ProcessingResult::Success,
        SendCompletion::Error => ProcessingResult::Error,
        SendCompletion::Cancelled => ProcessingResult::Cancelled,
        SendCompletion::Timeout => ProcessingResult::Timeout,
    }
}
