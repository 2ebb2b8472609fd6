//! The trait boundary standing in for the AMQP 1.0 framing library.
//!
//! Everything in this module is a contract, not an implementation: opening
//! links, sending messages, polling for deliveries and acking them are all
//! the transport's job. [`messenger`](crate::messenger), [`streaming`](crate::streaming)
//! and [`twin`](crate::twin) are written only against [`AmqpSession`],
//! [`AmqpSender`] and [`AmqpReceiver`] so they compile and run against any
//! conforming transport. [`testing`] provides an in-memory one used by this
//! crate's own unit tests.

#[cfg(test)]
pub mod testing;

use std::collections::HashMap;
use std::fmt;

use uuid::Uuid;

/// A correlation id as carried on the wire: either the AMQP-native UUID form
/// or a plain string, mirroring the two shapes the source accepts
/// (`IOTHUB_MESSAGE_HANDLE` correlation ids are UUID-typed properties, but
/// some responses come back as plain strings).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CorrelationId {
    Uuid(Uuid),
    String(String),
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrelationId::Uuid(id) => write!(f, "{id}"),
            CorrelationId::String(s) => write!(f, "{s}"),
        }
    }
}

/// A message annotation value. AMQP annotations can carry several scalar
/// types; these three cover every annotation this crate reads or writes.
#[derive(Debug, Clone, PartialEq)]
pub enum AnnotationValue {
    Str(String),
    Long(i64),
    Bool(bool),
}

impl From<&str> for AnnotationValue {
    fn from(value: &str) -> Self {
        AnnotationValue::Str(value.to_string())
    }
}

impl From<String> for AnnotationValue {
    fn from(value: String) -> Self {
        AnnotationValue::Str(value)
    }
}

impl From<i64> for AnnotationValue {
    fn from(value: i64) -> Self {
        AnnotationValue::Long(value)
    }
}

impl From<bool> for AnnotationValue {
    fn from(value: bool) -> Self {
        AnnotationValue::Bool(value)
    }
}

/// A message as it travels over a link, in either direction.
///
/// This is a DTO, not a trait: every component in this crate builds one to
/// send and reads one back on receive, so there is no reason to abstract
/// over its shape the way we abstract over the link/session operations.
#[derive(Debug, Clone, Default)]
pub struct AmqpMessage {
    pub body: Vec<u8>,
    pub correlation_id: Option<CorrelationId>,
    pub application_properties: HashMap<String, String>,
    pub message_annotations: HashMap<String, AnnotationValue>,
}

impl AmqpMessage {
    pub fn new(body: Vec<u8>) -> Self {
        AmqpMessage {
            body,
            ..Default::default()
        }
    }

    pub fn with_correlation_id(mut self, id: CorrelationId) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub fn with_application_property(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.application_properties.insert(key.into(), value.into());
        self
    }

    pub fn with_annotation(
        mut self,
        key: impl Into<String>,
        value: impl Into<AnnotationValue>,
    ) -> Self {
        self.message_annotations.insert(key.into(), value.into());
        self
    }
}

/// Lifecycle of a single sender or receiver link, as reported by the
/// transport. Mirrors `MESSAGE_SENDER_STATE`/`MESSAGE_RECEIVER_STATE` from
/// the source, collapsed to one enum since both link kinds use the same
/// shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Opening,
    Open,
    Closing,
    Closed,
    Error,
}

/// Everything needed to open a link: name, target/source address and attach
/// properties. `max_message_size` and `settled` correspond to the source's
/// `messagesender_set_max_message_size`/`link_set_snd_settle_mode` calls.
#[derive(Debug, Clone)]
pub struct LinkSpec {
    pub name: String,
    pub address: String,
    pub attach_properties: HashMap<String, AnnotationValue>,
    pub settled: bool,
    pub max_message_size: u64,
}

/// Identifies a delivery for the purpose of acking it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispositionInfo {
    pub link_name: String,
    pub delivery_number: u64,
}

/// Failures a transport can report back to this crate.
#[derive(Debug, thiserror::Error)]
pub enum AmqpError {
    #[error("link {0} failed to open")]
    LinkOpenFailed(String),
    #[error("link {0} timed out waiting to reach the open state")]
    LinkOpenTimeout(String),
    #[error("send on link {0} failed: {1}")]
    SendFailed(String, String),
    #[error("disposition for delivery {0} on link {1} failed")]
    DispositionFailed(u64, String),
    #[error("the AMQP session is closed")]
    SessionClosed,
}

/// Outcome the transport reports about a message handed to [`AmqpSender::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Accepted,
    Rejected,
    Released,
}

/// A single outbound link.
pub trait AmqpSender {
    /// Hand a message to the transport. This call does not block for a
    /// network round trip; the outcome arrives later through
    /// [`AmqpSender::poll_send_outcome`].
    fn send(&mut self, message: AmqpMessage) -> Result<u64, AmqpError>;

    /// Drain outcomes for sends previously submitted via [`AmqpSender::send`],
    /// identified by the token it returned.
    fn poll_send_outcome(&mut self) -> Option<(u64, SendOutcome)>;

    fn state(&self) -> LinkState;

    fn link_name(&self) -> &str;
}

/// A single inbound link.
pub trait AmqpReceiver {
    /// Take the next delivered message, if any, along with the information
    /// needed to ack it.
    fn poll_message(&mut self) -> Option<(AmqpMessage, DispositionInfo)>;

    fn send_disposition(
        &mut self,
        info: DispositionInfo,
        outcome: SendOutcome,
    ) -> Result<(), AmqpError>;

    fn state(&self) -> LinkState;

    fn link_name(&self) -> &str;
}

/// The AMQP session a caller owns and drives. A [`crate::messenger::Messenger`]
/// opens at most one sender and one receiver against it.
pub trait AmqpSession {
    type Sender: AmqpSender;
    type Receiver: AmqpReceiver;

    fn open_sender(&mut self, spec: LinkSpec) -> Result<Self::Sender, AmqpError>;

    fn open_receiver(&mut self, spec: LinkSpec) -> Result<Self::Receiver, AmqpError>;
}
