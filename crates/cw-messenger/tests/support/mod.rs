//! Hand-rolled mocks for the AMQP link seam.
//!
//! The hub hands the messenger real trait objects while keeping shared
//! handles to their state, so tests flip link sub-states, queue wire
//! completions, and inject inbound deliveries from the outside.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use bytes::Bytes;
use cw_common::AmqpMessage;
use cw_messenger::{
    AmqpSession, Disposition, InboundDelivery, LinkError, LinkState, MessageReceiver,
    MessageSender, ReceiverOptions, SendCompletion, SenderOptions, SessionHandle,
};

pub struct SenderState {
    pub options: SenderOptions,
    pub state: LinkState,
    pub sent: Vec<AmqpMessage>,
    pub completions: VecDeque<SendCompletion>,
    /// When set, `send` fails synchronously.
    pub fail_sends: bool,
    pub closed: bool,
}

pub struct ReceiverState {
    pub options: ReceiverOptions,
    pub state: LinkState,
    pub inbound: VecDeque<InboundDelivery>,
    pub dispositions: Vec<(u64, Disposition)>,
    pub closed: bool,
}

#[derive(Default)]
struct HubState {
    senders: Vec<Rc<RefCell<SenderState>>>,
    receivers: Vec<Rc<RefCell<ReceiverState>>>,
    fail_next_sender: Option<String>,
    fail_next_receiver: Option<String>,
}

/// Control surface for the mock AMQP stack.
#[derive(Clone)]
pub struct MockHub {
    inner: Rc<RefCell<HubState>>,
}

impl MockHub {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(HubState::default())),
        }
    }

    pub fn session(&self) -> SessionHandle {
        let session: SessionHandle = Rc::new(RefCell::new(MockSession {
            hub: self.inner.clone(),
        }));
        session
    }

    pub fn sender_count(&self) -> usize {
        self.inner.borrow().senders.len()
    }

    pub fn receiver_count(&self) -> usize {
        self.inner.borrow().receivers.len()
    }

    pub fn sender(&self, index: usize) -> Rc<RefCell<SenderState>> {
        self.inner.borrow().senders[index].clone()
    }

    pub fn receiver(&self, index: usize) -> Rc<RefCell<ReceiverState>> {
        self.inner.borrow().receivers[index].clone()
    }

    /// Make the next `open_sender` fail with an attach rejection.
    pub fn fail_next_sender(&self, reason: &str) {
        self.inner.borrow_mut().fail_next_sender = Some(reason.to_string());
    }

    pub fn fail_next_receiver(&self, reason: &str) {
        self.inner.borrow_mut().fail_next_receiver = Some(reason.to_string());
    }
}

struct MockSession {
    hub: Rc<RefCell<HubState>>,
}

impl AmqpSession for MockSession {
    fn open_sender(&mut self, options: SenderOptions) -> Result<Box<dyn MessageSender>, LinkError> {
        let mut hub = self.hub.borrow_mut();
        if let Some(reason) = hub.fail_next_sender.take() {
            return Err(LinkError::Rejected(reason));
        }
        let state = Rc::new(RefCell::new(SenderState {
            options,
            state: LinkState::Opening,
            sent: Vec::new(),
            completions: VecDeque::new(),
            fail_sends: false,
            closed: false,
        }));
        hub.senders.push(state.clone());
        Ok(Box::new(MockSender { state }))
    }

    fn open_receiver(
        &mut self,
        options: ReceiverOptions,
    ) -> Result<Box<dyn MessageReceiver>, LinkError> {
        let mut hub = self.hub.borrow_mut();
        if let Some(reason) = hub.fail_next_receiver.take() {
            return Err(LinkError::Rejected(reason));
        }
        let state = Rc::new(RefCell::new(ReceiverState {
            options,
            state: LinkState::Opening,
            inbound: VecDeque::new(),
            dispositions: Vec::new(),
            closed: false,
        }));
        hub.receivers.push(state.clone());
        Ok(Box::new(MockReceiver { state }))
    }
}

struct MockSender {
    state: Rc<RefCell<SenderState>>,
}

impl MessageSender for MockSender {
    fn state(&self) -> LinkState {
        self.state.borrow().state
    }

    fn send(&mut self, message: AmqpMessage) -> Result<(), LinkError> {
        let mut state = self.state.borrow_mut();
        if state.fail_sends {
            return Err(LinkError::Detached);
        }
        state.sent.push(message);
        Ok(())
    }

    fn poll_completion(&mut self) -> Option<SendCompletion> {
        self.state.borrow_mut().completions.pop_front()
    }

    fn close(&mut self) -> Result<(), LinkError> {
        let mut state = self.state.borrow_mut();
        state.closed = true;
        state.state = LinkState::Closing;
        Ok(())
    }
}

struct MockReceiver {
    state: Rc<RefCell<ReceiverState>>,
}

impl MessageReceiver for MockReceiver {
    fn state(&self) -> LinkState {
        self.state.borrow().state
    }

    fn try_next(&mut self) -> Option<InboundDelivery> {
        let mut state = self.state.borrow_mut();
        // Nothing surfaces before the link is up.
        if state.state != LinkState::Open {
            return None;
        }
        state.inbound.pop_front()
    }

    fn disposition(&mut self, delivery_id: u64, disposition: Disposition) -> Result<(), LinkError> {
        let mut state = self.state.borrow_mut();
        if state.closed {
            return Err(LinkError::Detached);
        }
        state.dispositions.push((delivery_id, disposition));
        Ok(())
    }

    fn close(&mut self) -> Result<(), LinkError> {
        let mut state = self.state.borrow_mut();
        state.closed = true;
        state.state = LinkState::Closing;
        Ok(())
    }
}

pub fn text_message(text: &str) -> AmqpMessage {
    AmqpMessage::new(Bytes::copy_from_slice(text.as_bytes()))
}

pub fn delivery(text: &str, delivery_id: u64) -> InboundDelivery {
    InboundDelivery {
        message: text_message(text),
        delivery_id,
    }
}

/// Route test logs through the harness; repeated calls are fine.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
