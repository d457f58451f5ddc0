//! Durable records of client mutations not yet confirmed by the server.

use serde::{Deserialize, Serialize};

use crate::{ConversationId, LocalId, MessageDraft, OpId, ServerId};

/// The kind of mutation a pending operation replays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// Send a message.
    Send,
    /// Hard-delete a message.
    Delete,
    /// Mark one message read.
    MarkRead,
    /// Mark every message in a conversation read.
    MarkAllRead,
    /// Recall a message.
    Recall,
}

impl OperationKind {
    /// Stable string form, used for storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::Delete => "delete",
            Self::MarkRead => "mark_read",
            Self::MarkAllRead => "mark_all_read",
            Self::Recall => "recall",
        }
    }

    /// Parse the stable string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "send" => Some(Self::Send),
            "delete" => Some(Self::Delete),
            "mark_read" => Some(Self::MarkRead),
            "mark_all_read" => Some(Self::MarkAllRead),
            "recall" => Some(Self::Recall),
            _ => None,
        }
    }
}

/// What a pending operation targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OpTarget {
    /// A message known only by its client identifier (unconfirmed).
    Local {
        /// The client identifier.
        local_id: LocalId,
    },
    /// A server-confirmed message.
    Server {
        /// The server identifier.
        server_id: ServerId,
    },
    /// The whole conversation (mark-all-read).
    Conversation,
}

impl OpTarget {
    /// Stable string form, used as part of the coalescing key in storage.
    pub fn key(&self) -> String {
        match self {
            Self::Local { local_id } => format!("local:{local_id}"),
            Self::Server { server_id } => format!("server:{server_id}"),
            Self::Conversation => "conversation".to_string(),
        }
    }

    /// Parse the stable string form.
    pub fn parse(s: &str) -> Option<Self> {
        if s == "conversation" {
            return Some(Self::Conversation);
        }
        if let Some(rest) = s.strip_prefix("local:") {
            return LocalId::parse(rest).map(|local_id| Self::Local { local_id });
        }
        s.strip_prefix("server:").map(|rest| Self::Server {
            server_id: ServerId::new(rest),
        })
    }
}

/// A client-issued mutation awaiting server confirmation.
///
/// At most one outstanding operation exists per
/// `(conversation_id, kind, target)`; a second identical request coalesces
/// into the existing entry rather than duplicating it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Local identifier for this operation.
    pub op_id: OpId,
    /// Conversation the mutation belongs to.
    pub conversation_id: ConversationId,
    /// What the mutation does.
    pub kind: OperationKind,
    /// What it targets.
    pub target: OpTarget,
    /// Payload snapshot, present for `Send` operations.
    pub draft: Option<MessageDraft>,
    /// Number of transport attempts made so far.
    pub attempt_count: u32,
    /// Earliest time the next attempt may run, unix milliseconds.
    pub next_retry_at: i64,
    /// Creation time, unix milliseconds. Orders replay within a conversation.
    pub created_at: i64,
}

impl PendingOperation {
    /// Create a new operation due immediately.
    pub fn new(
        conversation_id: ConversationId,
        kind: OperationKind,
        target: OpTarget,
        created_at: i64,
    ) -> Self {
        Self {
            op_id: OpId::new(),
            conversation_id,
            kind,
            target,
            draft: None,
            attempt_count: 0,
            next_retry_at: created_at,
            created_at,
        }
    }

    /// Attach a send-payload snapshot.
    pub fn with_draft(mut self, draft: MessageDraft) -> Self {
        self.draft = Some(draft);
        self
    }
}
