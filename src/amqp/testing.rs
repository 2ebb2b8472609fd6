//! An in-memory [`AmqpSession`] used only by this crate's own unit tests.
//!
//! Every sent message lands in a shared log the test can inspect; every
//! outcome and every inbound delivery is something the test pushes in by
//! hand. There is no background thread and no actual framing: a test drives
//! time and the "wire" explicitly, matching how `do_work` is meant to be
//! driven in the first place.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use super::{
    AmqpError, AmqpMessage, AmqpReceiver, AmqpSender, AmqpSession, DispositionInfo, LinkSpec,
    LinkState, SendOutcome,
};

#[derive(Default)]
struct Shared {
    sent: Vec<(u64, AmqpMessage)>,
    next_token: u64,
    outcomes: VecDeque<(u64, SendOutcome)>,
    incoming: VecDeque<(AmqpMessage, DispositionInfo)>,
    dispositions: Vec<(DispositionInfo, SendOutcome)>,
    fail_open: bool,
}

/// A handle shared between the test and the fake session's links, used to
/// inject wire activity and inspect what was sent.
#[derive(Clone, Default)]
pub struct TestBus {
    shared: Rc<RefCell<Shared>>,
}

impl TestBus {
    pub fn new() -> Self {
        TestBus::default()
    }

    /// Make the next `open_sender`/`open_receiver` call fail, simulating a
    /// transport that cannot attach a link.
    pub fn fail_next_open(&self) {
        self.shared.borrow_mut().fail_open = true;
    }

    /// Queue an outcome for the next not-yet-resolved send.
    pub fn resolve_next_send(&self, outcome: SendOutcome) {
        let mut shared = self.shared.borrow_mut();
        if let Some((token, _)) = shared
            .sent
            .iter()
            .find(|(token, _)| !shared_has_outcome(&shared.outcomes, *token))
            .map(|(t, m)| (*t, m.clone()))
        {
            shared.outcomes.push_back((token, outcome));
        }
    }

    /// Deliver a message to whatever receiver link is open, as if it arrived
    /// over the wire.
    pub fn deliver(&self, message: AmqpMessage, delivery_number: u64, link_name: &str) {
        self.shared.borrow_mut().incoming.push_back((
            message,
            DispositionInfo {
                link_name: link_name.to_string(),
                delivery_number,
            },
        ));
    }

    pub fn sent_messages(&self) -> Vec<AmqpMessage> {
        self.shared
            .borrow()
            .sent
            .iter()
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn dispositions(&self) -> Vec<(DispositionInfo, SendOutcome)> {
        self.shared.borrow().dispositions.clone()
    }
}

fn shared_has_outcome(outcomes: &VecDeque<(u64, SendOutcome)>, token: u64) -> bool {
    outcomes.iter().any(|(t, _)| *t == token)
}

pub struct TestSession {
    bus: TestBus,
}

impl TestSession {
    pub fn new(bus: TestBus) -> Self {
        TestSession { bus }
    }
}

impl AmqpSession for TestSession {
    type Sender = TestSender;
    type Receiver = TestReceiver;

    fn open_sender(&mut self, spec: LinkSpec) -> Result<Self::Sender, AmqpError> {
        if self.bus.shared.borrow_mut().fail_open {
            self.bus.shared.borrow_mut().fail_open = false;
            return Err(AmqpError::LinkOpenFailed(spec.name));
        }
        Ok(TestSender {
            name: spec.name,
            bus: self.bus.clone(),
        })
    }

    fn open_receiver(&mut self, spec: LinkSpec) -> Result<Self::Receiver, AmqpError> {
        if self.bus.shared.borrow_mut().fail_open {
            self.bus.shared.borrow_mut().fail_open = false;
            return Err(AmqpError::LinkOpenFailed(spec.name));
        }
        Ok(TestReceiver {
            name: spec.name,
            bus: self.bus.clone(),
        })
    }
}

pub struct TestSender {
    name: String,
    bus: TestBus,
}

impl AmqpSender for TestSender {
    fn send(&mut self, message: AmqpMessage) -> Result<u64, AmqpError> {
        let mut shared = self.bus.shared.borrow_mut();
        let token = shared.next_token;
        shared.next_token += 1;
        shared.sent.push((token, message));
        Ok(token)
    }

    fn poll_send_outcome(&mut self) -> Option<(u64, SendOutcome)> {
        self.bus.shared.borrow_mut().outcomes.pop_front()
    }

    fn state(&self) -> LinkState {
        LinkState::Open
    }

    fn link_name(&self) -> &str {
        &self.name
    }
}

pub struct TestReceiver {
    name: String,
    bus: TestBus,
}

impl AmqpReceiver for TestReceiver {
    fn poll_message(&mut self) -> Option<(AmqpMessage, DispositionInfo)> {
        self.bus.shared.borrow_mut().incoming.pop_front()
    }

    fn send_disposition(
        &mut self,
        info: DispositionInfo,
        outcome: SendOutcome,
    ) -> Result<(), AmqpError> {
        self.bus.shared.borrow_mut().dispositions.push((info, outcome));
        Ok(())
    }

    fn state(&self) -> LinkState {
        LinkState::Open
    }

    fn link_name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sent_message_is_visible_on_the_bus() {
        let bus = TestBus::new();
        let mut session = TestSession::new(bus.clone());
        let mut sender = session
            .open_sender(LinkSpec {
                name: "link-snd-1".into(),
                address: "devices/d1/messages/events".into(),
                attach_properties: Default::default(),
                settled: false,
                max_message_size: u64::MAX,
            })
            .unwrap();

        sender.send(AmqpMessage::new(vec![1, 2, 3])).unwrap();

        assert_eq!(bus.sent_messages().len(), 1);
        assert_eq!(bus.sent_messages()[0].body, vec![1, 2, 3]);
    }

    #[test]
    fn delivered_message_is_polled_by_receiver() {
        let bus = TestBus::new();
        let mut session = TestSession::new(bus.clone());
        let mut receiver = session
            .open_receiver(LinkSpec {
                name: "link-rcv-1".into(),
                address: "devices/d1/messages/devicebound".into(),
                attach_properties: Default::default(),
                settled: false,
                max_message_size: 65536,
            })
            .unwrap();

        bus.deliver(AmqpMessage::new(vec![9]), 7, "link-rcv-1");

        let (message, info) = receiver.poll_message().unwrap();
        assert_eq!(message.body, vec![9]);
        assert_eq!(info.delivery_number, 7);
    }

    #[test]
    fn fail_next_open_surfaces_as_amqp_error() {
        let bus = TestBus::new();
        bus.fail_next_open();
        let mut session = TestSession::new(bus);

        let result = session.open_sender(LinkSpec {
            name: "link-snd-1".into(),
            address: "devices/d1/messages/events".into(),
            attach_properties: Default::default(),
            settled: false,
            max_message_size: u64::MAX,
        });

        assert!(matches!(result, Err(AmqpError::LinkOpenFailed(_))));
    }
}
