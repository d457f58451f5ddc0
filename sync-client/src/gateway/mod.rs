//! Transport gateway abstraction.
//!
//! The gateway is a thin request/response and push-stream boundary: it
//! performs no retries and no persistence. Retry policy, offline queueing,
//! and reconciliation all live in the coordinator, so any backing protocol
//! (HTTP + websocket, QUIC, mock) slots in behind this trait.

mod mock;

pub use mock::MockGateway;

use async_trait::async_trait;
use thiserror::Error;

use chat_sync_types::{MessageDraft, ReadTarget, SendAck, ServerEvent, ServerId};

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The request never reached the server (connectivity). Retryable.
    #[error("network error: {0}")]
    Network(String),

    /// The request timed out. Retryable.
    #[error("request timed out")]
    Timeout,

    /// The server refused the request. Not retryable.
    #[error("rejected by server: {reason}")]
    Rejected {
        /// Server-supplied reason.
        reason: String,
    },

    /// Credentials are invalid or expired. Not retryable.
    #[error("unauthorized")]
    Unauthorized,
}

impl TransportError {
    /// Whether retrying the same request can succeed.
    ///
    /// Connectivity failures and timeouts are transient; a rejection or an
    /// auth failure will repeat until something else changes.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout)
    }
}

/// Gateway trait for the remote chat service.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Submit a message; the ack echoes the draft's `temp_id`.
    async fn send_message(&self, draft: &MessageDraft) -> Result<SendAck, TransportError>;

    /// Delete a confirmed message.
    async fn delete_message(&self, server_id: &ServerId) -> Result<(), TransportError>;

    /// Report read state for one message or a whole conversation.
    async fn mark_read(&self, target: &ReadTarget) -> Result<(), TransportError>;

    /// Recall a confirmed message.
    async fn recall_message(&self, server_id: &ServerId) -> Result<(), TransportError>;

    /// Wait for the next frame from the server push stream.
    async fn next_event(&self) -> Result<ServerEvent, TransportError>;
}
