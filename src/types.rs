//! Small, shared, wire-adjacent enums exposed to callers of every client.

/// Lifecycle state shared by [`crate::messenger::Messenger`],
/// [`crate::streaming::StreamingClient`] and [`crate::twin::TwinClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    Stopped,
    Starting,
    Started,
    Stopping,
    Error,
}

/// Outcome reported to a send-completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SendResult {
    Success,
    Error,
    Cancelled,
}

/// Why a send completed the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SendReason {
    None,
    FailSending,
    Timeout,
    MessengerDestroyed,
    CannotParse,
    InvalidResponse,
    InternalError,
}

/// What the receiver should tell the AMQP layer about a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispositionResult {
    /// Do not send a disposition at all.
    None,
    Accepted,
    Rejected,
    Released,
}

/// Whether a client currently has outstanding send work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SendStatus {
    Idle,
    Busy,
}

/// Whether a desired-properties notification is a full snapshot or a delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateType {
    Complete,
    Partial,
}
