//! AMQP messaging core for an IoT device-to-cloud client.
//!
//! This crate implements the part of a device SDK that sits directly on top
//! of a single AMQP session: a retry-aware outbound [`queue::MessageQueue`],
//! a bidirectional [`messenger::Messenger`] pump built from a sender link and
//! an optional receiver link, and two subsystems carried on top of it:
//! [`streaming::StreamingClient`] for cloud-to-device stream invitations and
//! [`twin::TwinClient`] for desired/reported device twin properties.
//!
//! The AMQP framing layer itself (links, message senders/receivers, session
//! management) is out of scope here and is modeled as the [`amqp`] trait
//! boundary. Callers supply a concrete implementation of [`amqp::AmqpSession`]
//! bound to their transport; the [`amqp::testing`] module provides an
//! in-memory implementation used by this crate's own tests.

pub mod amqp;
pub mod messenger;
pub mod queue;
pub mod streaming;
pub mod twin;
mod types;

pub use types::{ClientState, DispositionResult, SendReason, SendResult, SendStatus, UpdateType};
