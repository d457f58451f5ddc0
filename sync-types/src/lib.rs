//! # sync-types
//!
//! Data model for the chat-sync offline-first message engine.
//!
//! This crate provides the foundational types used across all chat-sync
//! crates:
//! - [`LocalId`], [`ServerId`], [`ConversationId`], [`OpId`], [`UserId`] -
//!   identifier types
//! - [`Message`], [`MessageDraft`], [`DeliveryStatus`] - the message entity
//! - [`PendingOperation`] - durable record of an unconfirmed client mutation
//! - [`ServerEvent`], [`SendAck`] - frames exchanged with the remote service

#![warn(missing_docs)]
#![warn(clippy::all)]

mod events;
mod ids;
mod message;
mod pending;

pub use events::{ReadTarget, RemoteMessage, RemoteStatus, SendAck, ServerEvent};
pub use ids::{ConversationId, LocalId, OpId, ServerId, UserId};
pub use message::{DeliveryStatus, MediaDescriptor, Message, MessageDraft, MessageKind, MessagePayload};
pub use pending::{OpTarget, OperationKind, PendingOperation};
