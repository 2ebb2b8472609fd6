//! A bidirectional AMQP pump: an outbound [`crate::queue::MessageQueue`] fed
//! through a sender link, and an optional receiver link for inbound
//! messages. [`StreamingClient`](crate::streaming::StreamingClient) and
//! [`TwinClient`](crate::twin::TwinClient) are both built on top of one of
//! these rather than opening their own links directly.

pub mod config;

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::amqp::{
    AmqpError, AmqpMessage, AmqpReceiver, AmqpSender, AmqpSession, DispositionInfo, LinkSpec,
    LinkState, SendOutcome,
};
use crate::queue::{MessageQueue, QueueConfig, QueueResult};
use crate::{ClientState, DispositionResult, SendReason, SendResult, SendStatus};

pub use config::{LinkConfig, MessengerConfig, MessengerConfigBuilder, MessengerConfigError};

/// Named constants carried verbatim from `iothubtransport_amqp_messenger.c`.
pub mod defaults {
    use std::time::Duration;

    pub const SEND_LINK_NAME_PREFIX: &str = "link-snd";
    pub const RECEIVE_LINK_NAME_PREFIX: &str = "link-rcv";
    pub const DEFAULT_SEND_LINK_SUFFIX: &str = "messages/events";
    pub const DEFAULT_RECEIVE_LINK_SUFFIX: &str = "messages/devicebound";
    pub const SENDER_MAX_LINK_SIZE: u64 = u64::MAX;
    pub const RECEIVER_MAX_LINK_SIZE: u64 = 65536;
    pub const DEFAULT_EVENT_SEND_RETRY_LIMIT: u32 = 0;
    pub const DEFAULT_EVENT_SEND_TIMEOUT_SECS: u64 = 600;
    pub const DEFAULT_MAX_SEND_ERROR_COUNT: u32 = 10;
    pub const MAX_SENDER_STATE_CHANGE_TIMEOUT_SECS: u64 = 300;
    pub const MAX_RECEIVER_STATE_CHANGE_TIMEOUT_SECS: u64 = 300;

    pub const MAX_SENDER_STATE_CHANGE_TIMEOUT: Duration =
        Duration::from_secs(MAX_SENDER_STATE_CHANGE_TIMEOUT_SECS);
    pub const MAX_RECEIVER_STATE_CHANGE_TIMEOUT: Duration =
        Duration::from_secs(MAX_RECEIVER_STATE_CHANGE_TIMEOUT_SECS);
}

/// A runtime-settable messenger option. A tagged enum rather than a
/// stringly-typed key/value pair, the idiomatic replacement for the
/// source's `messenger_set_option(key, value)` entry point.
#[derive(Debug, Clone)]
pub enum MessengerOption {
    EventSendTimeout(Duration),
    ProductInfo(String),
    MaxSendErrorCount(u32),
}

/// Snapshot of the options worth replaying across a reconnect, this crate's
/// answer to `messenger_retrieve_options`/`OPTIONHANDLER`.
#[derive(Debug, Clone)]
pub struct OptionsSnapshot {
    pub event_send_timeout: Duration,
    pub product_info: String,
    pub max_send_error_count: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum MessengerError {
    #[error(transparent)]
    Config(#[from] MessengerConfigError),
    #[error("messenger is not started")]
    NotStarted,
    #[error(transparent)]
    Amqp(#[from] AmqpError),
}

/// See [`Messenger::sender_handle`].
#[derive(Clone)]
pub struct MessengerSender {
    queue: MessageQueue<AmqpMessage>,
    consecutive_send_errors: Rc<RefCell<u32>>,
}

impl MessengerSender {
    pub fn send_async(&self, message: AmqpMessage, on_complete: impl FnOnce(SendResult, SendReason) + 'static) {
        let error_count = Rc::clone(&self.consecutive_send_errors);
        self.queue.add(message, move |_message, result| {
            let (send_result, reason) = match result {
                QueueResult::Success => {
                    *error_count.borrow_mut() = 0;
                    (SendResult::Success, SendReason::None)
                }
                QueueResult::Error => {
                    *error_count.borrow_mut() += 1;
                    (SendResult::Error, SendReason::FailSending)
                }
                QueueResult::Timeout => {
                    *error_count.borrow_mut() += 1;
                    (SendResult::Error, SendReason::Timeout)
                }
                QueueResult::Cancelled => (SendResult::Cancelled, SendReason::MessengerDestroyed),
            };
            on_complete(send_result, reason);
        });
    }
}

/// A bidirectional AMQP pump built from a validated [`MessengerConfig`].
pub struct Messenger<S: AmqpSession> {
    config: MessengerConfig,
    state: ClientState,
    queue: MessageQueue<AmqpMessage>,
    sender: Option<S::Sender>,
    receiver: Option<S::Receiver>,
    subscribed: bool,
    link_open_started_at: Option<Instant>,
    pending_sends: HashMap<u64, u64>,
    consecutive_send_errors: Rc<RefCell<u32>>,
    on_message: Option<Box<dyn FnMut(AmqpMessage) -> DispositionResult>>,
}

impl<S: AmqpSession> Messenger<S> {
    pub fn create(config: MessengerConfig) -> Self {
        let queue_config = QueueConfig {
            max_retry_count: defaults::DEFAULT_EVENT_SEND_RETRY_LIMIT,
            max_message_enqueued_time: config.event_send_timeout,
            max_message_processing_time: Duration::ZERO,
        };
        Messenger {
            config,
            state: ClientState::Stopped,
            queue: MessageQueue::create(queue_config),
            sender: None,
            receiver: None,
            subscribed: false,
            link_open_started_at: None,
            pending_sends: HashMap::new(),
            consecutive_send_errors: Rc::new(RefCell::new(0)),
            on_message: None,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Move from `Stopped` to `Starting`. Link attach is deferred to the
    /// next [`Messenger::do_work`] call, since opening a link is the
    /// transport's job and this crate never blocks waiting on it.
    pub fn start(&mut self) -> Result<(), MessengerError> {
        if self.state != ClientState::Stopped && self.state != ClientState::Error {
            return Ok(());
        }
        self.state = ClientState::Starting;
        self.link_open_started_at = None;
        Ok(())
    }

    /// Move to `Stopping`; the next [`Messenger::do_work`] call detaches the
    /// links and rewinds any in-flight sends back to pending so a later
    /// `start` resends them.
    pub fn stop(&mut self) {
        if self.state == ClientState::Stopped {
            return;
        }
        self.state = ClientState::Stopping;
    }

    pub fn send_async(
        &mut self,
        message: AmqpMessage,
        on_complete: impl FnOnce(SendResult, SendReason) + 'static,
    ) -> Result<(), MessengerError> {
        if self.state != ClientState::Started {
            return Err(MessengerError::NotStarted);
        }
        self.sender_handle().send_async(message, on_complete);
        Ok(())
    }

    /// A cheap, cloneable handle that can enqueue an outbound send without
    /// borrowing `self`. Lets a callback registered with
    /// [`Messenger::subscribe_for_messages`] send a reply from inside its own
    /// disposition decision, which it could not do by holding `&mut Messenger`
    /// since the messenger already has that callback on loan while it runs.
    pub fn sender_handle(&self) -> MessengerSender {
        MessengerSender {
            queue: self.queue.clone(),
            consecutive_send_errors: Rc::clone(&self.consecutive_send_errors),
        }
    }

    pub fn subscribe_for_messages(
        &mut self,
        on_message: impl FnMut(AmqpMessage) -> DispositionResult + 'static,
    ) {
        self.subscribed = true;
        self.on_message = Some(Box::new(on_message));
    }

    pub fn unsubscribe_for_messages(&mut self) {
        self.subscribed = false;
        self.on_message = None;
        self.receiver = None;
    }

    /// Send a disposition for a message whose handler returned
    /// [`DispositionResult::None`] to defer acking it.
    pub fn send_message_disposition(
        &mut self,
        info: DispositionInfo,
        result: DispositionResult,
    ) -> Result<(), MessengerError> {
        let outcome = match result {
            DispositionResult::Accepted => SendOutcome::Accepted,
            DispositionResult::Rejected => SendOutcome::Rejected,
            DispositionResult::Released => SendOutcome::Released,
            DispositionResult::None => return Ok(()),
        };
        if let Some(receiver) = self.receiver.as_mut() {
            receiver.send_disposition(info, outcome)?;
        }
        Ok(())
    }

    pub fn get_send_status(&self) -> SendStatus {
        if self.queue.is_empty() {
            SendStatus::Idle
        } else {
            SendStatus::Busy
        }
    }

    pub fn set_option(&mut self, option: MessengerOption) {
        match option {
            MessengerOption::EventSendTimeout(timeout) => {
                self.config.event_send_timeout = timeout;
                self.queue.set_max_message_enqueued_time_secs(timeout.as_secs());
            }
            MessengerOption::ProductInfo(product_info) => {
                self.config.product_info = product_info;
            }
            MessengerOption::MaxSendErrorCount(count) => {
                self.config.max_send_error_count = count;
            }
        }
    }

    pub fn retrieve_options(&self) -> OptionsSnapshot {
        OptionsSnapshot {
            event_send_timeout: self.config.event_send_timeout,
            product_info: self.config.product_info.clone(),
            max_send_error_count: self.config.max_send_error_count,
        }
    }

    /// Cancel everything outstanding and reset to `Stopped`. Unlike `stop`,
    /// this does not attempt a clean rewind for resubmission.
    pub fn destroy(&mut self) {
        self.queue.cancel_all();
        self.sender = None;
        self.receiver = None;
        self.subscribed = false;
        self.on_message = None;
        self.state = ClientState::Stopped;
    }

    fn link_spec(
        &self,
        name: String,
        address: String,
        settled: bool,
        max_message_size: u64,
        attach_properties: &HashMap<String, String>,
    ) -> LinkSpec {
        LinkSpec {
            name,
            address,
            attach_properties: attach_properties
                .iter()
                .map(|(k, v)| (k.clone(), crate::amqp::AnnotationValue::Str(v.clone())))
                .collect(),
            settled,
            max_message_size,
        }
    }

    pub fn do_work(&mut self, session: &mut S) {
        match self.state {
            ClientState::Starting => self.do_work_starting(session),
            ClientState::Started => self.do_work_started(),
            ClientState::Stopping => self.do_work_stopping(),
            ClientState::Stopped | ClientState::Error => {}
        }
    }

    fn do_work_starting(&mut self, session: &mut S) {
        let started_at = *self.link_open_started_at.get_or_insert_with(Instant::now);

        if self.sender.is_none() {
            let spec = self.link_spec(
                self.config.send_link_name(),
                self.config.send_link_address(),
                self.config.send_link.settled,
                defaults::SENDER_MAX_LINK_SIZE,
                &self.config.send_link.attach_properties,
            );
            match session.open_sender(spec) {
                Ok(sender) => self.sender = Some(sender),
                Err(_) => {
                    self.state = ClientState::Error;
                    return;
                }
            }
        }

        if self.subscribed && self.receiver.is_none() {
            let spec = self.link_spec(
                self.config.receive_link_name(),
                self.config.receive_link_address(),
                self.config.receive_link.settled,
                defaults::RECEIVER_MAX_LINK_SIZE,
                &self.config.receive_link.attach_properties,
            );
            match session.open_receiver(spec) {
                Ok(receiver) => self.receiver = Some(receiver),
                Err(_) => {
                    self.state = ClientState::Error;
                    return;
                }
            }
        }

        let sender_ready = self.sender.as_ref().is_some_and(|s| s.state() == LinkState::Open);
        let receiver_ready = !self.subscribed
            || self.receiver.as_ref().is_some_and(|r| r.state() == LinkState::Open);

        if sender_ready && receiver_ready {
            self.state = ClientState::Started;
            self.link_open_started_at = None;
            return;
        }

        if started_at.elapsed() > defaults::MAX_SENDER_STATE_CHANGE_TIMEOUT {
            self.state = ClientState::Error;
        }
    }

    fn do_work_started(&mut self) {
        if let Some(sender) = self.sender.as_mut() {
            while let Some((token, outcome)) = sender.poll_send_outcome() {
                if let Some(id) = self.pending_sends.remove(&token) {
                    let result = match outcome {
                        SendOutcome::Accepted => QueueResult::Success,
                        SendOutcome::Rejected | SendOutcome::Released => QueueResult::Error,
                    };
                    self.queue.complete(id, result);
                }
            }
        }

        if let Some(sender) = self.sender.as_mut() {
            let pending_sends = &mut self.pending_sends;
            self.queue.do_work(|message, id, handle| match sender.send(message) {
                Ok(token) => {
                    pending_sends.insert(token, id);
                }
                Err(_) => handle.complete(id, QueueResult::Error),
            });
        }

        if let Some(receiver) = self.receiver.as_mut() {
            if let Some(on_message) = self.on_message.as_mut() {
                while let Some((message, info)) = receiver.poll_message() {
                    let disposition = on_message(message);
                    if disposition != DispositionResult::None {
                        let outcome = match disposition {
                            DispositionResult::Accepted => SendOutcome::Accepted,
                            DispositionResult::Rejected => SendOutcome::Rejected,
                            DispositionResult::Released => SendOutcome::Released,
                            DispositionResult::None => unreachable!(),
                        };
                        let _ = receiver.send_disposition(info, outcome);
                    }
                }
            }
        }

        let error_count = *self.consecutive_send_errors.borrow();
        if self.config.max_send_error_count != 0 && error_count >= self.config.max_send_error_count {
            self.state = ClientState::Error;
        }
    }

    fn do_work_stopping(&mut self) {
        self.queue.move_all_back_to_pending();
        self.sender = None;
        self.receiver = None;
        self.pending_sends.clear();
        self.state = ClientState::Stopped;
    }
}
