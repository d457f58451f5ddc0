//! SyncCoordinator - the main interface for chat-sync.
//!
//! This module provides [`SyncCoordinator`], the primary API for applications
//! to send, read, recall, and synchronize chat messages.
//!
//! # Architecture
//!
//! The coordinator owns no protocol logic of its own: it persists through the
//! [`MessageStore`] trait, talks to the remote service through the
//! [`Gateway`] trait, and applies the pure functions from `chat-sync-core`
//! (delivery transitions, reconciliation merges, recall policy, backoff)
//! around those two boundaries.
//!
//! ```text
//! Application → SyncCoordinator → Gateway → Network
//!                     ↓
//!                MessageStore (SQLite)
//!                     ↓
//!               chat-sync-core (pure logic)
//! ```
//!
//! # Durability before transmission
//!
//! Every send persists a `Sending` row before the first network attempt, so
//! a crash or connectivity loss can never drop a message the user believes
//! they sent. Failed sends become durable [`PendingOperation`]s replayed by
//! [`process_due`](SyncCoordinator::process_due) with exponential backoff,
//! FIFO within each conversation.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use dashmap::DashSet;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

use chat_sync_core::{delivery, policy, reconcile, Merged, RecallPolicy};
use chat_sync_store::MessageStore;
use chat_sync_types::{
    ConversationId, DeliveryStatus, LocalId, Message, MessageKind, MessagePayload, OpTarget,
    OperationKind, PendingOperation, ReadTarget, ServerEvent, ServerId, UserId,
};

use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::events::SyncEvent;
use crate::gateway::{Gateway, TransportError};

struct Inner<G> {
    user: UserId,
    store: Arc<dyn MessageStore>,
    gateway: G,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    policy: RecallPolicy,
    events: broadcast::Sender<SyncEvent>,
    // Sends cancelled while a gateway call was in flight; checked before
    // reconciling the ack.
    cancelled: DashSet<LocalId>,
}

/// The sync coordinator.
///
/// Cheap to clone; clones share all state.
pub struct SyncCoordinator<G: Gateway> {
    inner: Arc<Inner<G>>,
}

impl<G: Gateway> Clone for SyncCoordinator<G> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<G: Gateway + 'static> SyncCoordinator<G> {
    /// Create a coordinator using the system clock.
    pub fn new(
        user: UserId,
        store: Arc<dyn MessageStore>,
        gateway: G,
        config: SyncConfig,
    ) -> Self {
        Self::with_clock(user, store, gateway, config, Arc::new(SystemClock))
    }

    /// Create a coordinator with an explicit clock (for testing).
    pub fn with_clock(
        user: UserId,
        store: Arc<dyn MessageStore>,
        gateway: G,
        config: SyncConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity);
        let policy = RecallPolicy::new(config.recall_window);
        Self {
            inner: Arc::new(Inner {
                user,
                store,
                gateway,
                clock,
                config,
                policy,
                events,
                cancelled: DashSet::new(),
            }),
        }
    }

    /// Subscribe to state-change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// The coordinator's clock reading, unix milliseconds.
    pub fn now_millis(&self) -> i64 {
        self.inner.clock.now_millis()
    }

    /// The underlying message store.
    pub fn store(&self) -> Arc<dyn MessageStore> {
        Arc::clone(&self.inner.store)
    }

    /// Query a conversation newest-first (see
    /// [`MessageStore::query_conversation`]).
    pub async fn messages(
        &self,
        conversation_id: &ConversationId,
        limit: u32,
        before: Option<&LocalId>,
    ) -> Result<Vec<Message>> {
        Ok(self
            .inner
            .store
            .query_conversation(conversation_id, limit, before)
            .await?)
    }

    /// Send a message.
    ///
    /// The optimistic `Sending` row is persisted before any network attempt.
    /// A retryable transport failure marks the row `Failed`, queues a durable
    /// retry, and still returns `Ok` with the failed message; only a
    /// non-retryable rejection surfaces as an error.
    pub async fn send(
        &self,
        conversation_id: ConversationId,
        kind: MessageKind,
        payload: MessagePayload,
    ) -> Result<Message> {
        let message = Message::draft(
            conversation_id,
            self.inner.user.clone(),
            kind,
            payload,
            self.now_millis(),
        );
        self.inner.store.put_message(&message).await?;
        tracing::debug!(local_id = %message.local_id, "persisted outgoing message");
        self.dispatch_send(message).await
    }

    /// Re-dispatch a failed message after its retries were exhausted or
    /// cancelled.
    pub async fn resend(&self, local_id: &LocalId) -> Result<Message> {
        let mut message = self.load(local_id).await?;
        message.status = delivery::begin_retry(message.status)?;
        self.inner.store.put_message(&message).await?;
        self.inner.cancelled.remove(local_id);
        self.dispatch_send(message).await
    }

    /// Delete a message.
    ///
    /// An unconfirmed message is removed locally (along with its queued send,
    /// if any). A confirmed message is deleted on the server first; when
    /// offline the row is kept and the deletion is queued.
    pub async fn delete(&self, local_id: &LocalId) -> Result<()> {
        let message = self.load(local_id).await?;
        let now = self.now_millis();

        let Some(server_id) = message.server_id.clone() else {
            self.remove_op(
                &message.conversation_id,
                OperationKind::Send,
                &OpTarget::Local {
                    local_id: message.local_id,
                },
            )
            .await?;
            self.inner.cancelled.remove(local_id);
            self.inner.store.delete_message(local_id).await?;
            self.emit(SyncEvent::MessageDeleted {
                local_id: *local_id,
            });
            return Ok(());
        };

        match self
            .request(self.inner.gateway.delete_message(&server_id))
            .await
        {
            Ok(()) => {
                self.remove_op(
                    &message.conversation_id,
                    OperationKind::Delete,
                    &OpTarget::Server {
                        server_id: server_id.clone(),
                    },
                )
                .await?;
                self.inner.store.delete_message(local_id).await?;
                self.emit(SyncEvent::MessageDeleted {
                    local_id: *local_id,
                });
                Ok(())
            }
            Err(error) if error.is_retryable() => {
                tracing::debug!(%server_id, %error, "delete deferred until connectivity returns");
                let op = PendingOperation::new(
                    message.conversation_id,
                    OperationKind::Delete,
                    OpTarget::Server { server_id },
                    now,
                );
                self.enqueue_retry(op, now).await?;
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Mark every delivered message in a conversation as read.
    ///
    /// Local advancement happens first and is never rolled back; the server
    /// notification is queued when offline.
    pub async fn mark_read(&self, conversation_id: &ConversationId) -> Result<u64> {
        let advanced = self.inner.store.mark_conversation_read(conversation_id).await?;
        if advanced > 0 {
            self.emit(SyncEvent::MessageRead {
                conversation_id: *conversation_id,
            });
        }

        let now = self.now_millis();
        match self
            .request(
                self.inner
                    .gateway
                    .mark_read(&ReadTarget::Conversation(*conversation_id)),
            )
            .await
        {
            Ok(()) => {
                self.remove_op(conversation_id, OperationKind::MarkAllRead, &OpTarget::Conversation)
                    .await?;
                Ok(advanced)
            }
            Err(error) if error.is_retryable() => {
                let op = PendingOperation::new(
                    *conversation_id,
                    OperationKind::MarkAllRead,
                    OpTarget::Conversation,
                    now,
                );
                self.enqueue_retry(op, now).await?;
                Ok(advanced)
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Mark one delivered message as read.
    pub async fn mark_message_read(&self, server_id: &ServerId) -> Result<()> {
        let message = self
            .inner
            .store
            .get_by_server_id(server_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(server_id.to_string()))?;

        self.inner.store.mark_message_read(server_id).await?;
        self.emit(SyncEvent::MessageUpdated {
            local_id: message.local_id,
            server_id: Some(server_id.clone()),
        });

        let now = self.now_millis();
        let target = OpTarget::Server {
            server_id: server_id.clone(),
        };
        match self
            .request(
                self.inner
                    .gateway
                    .mark_read(&ReadTarget::Message(server_id.clone())),
            )
            .await
        {
            Ok(()) => {
                self.remove_op(&message.conversation_id, OperationKind::MarkRead, &target)
                    .await?;
                Ok(())
            }
            Err(error) if error.is_retryable() => {
                let op = PendingOperation::new(
                    message.conversation_id,
                    OperationKind::MarkRead,
                    target,
                    now,
                );
                self.enqueue_retry(op, now).await?;
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Recall a sent message.
    ///
    /// The policy check runs locally first: a violation fails fast with zero
    /// network traffic. On server confirmation the payload becomes a
    /// tombstone. Offline, the recall is queued; the retry pass re-checks
    /// the window before dispatching.
    pub async fn recall(&self, local_id: &LocalId, requester: &UserId) -> Result<Message> {
        let message = self.load(local_id).await?;
        let now = self.now_millis();
        self.inner.policy.check_recall(&message, requester, now)?;

        let Some(server_id) = message.server_id.clone() else {
            return Err(SyncError::Policy(
                chat_sync_core::PolicyViolation::NotRecallable {
                    status: message.status,
                },
            ));
        };

        match self
            .request(self.inner.gateway.recall_message(&server_id))
            .await
        {
            Ok(()) => {
                let recalled = policy::apply_recall(message, now);
                self.inner.store.put_message(&recalled).await?;
                tracing::info!(%server_id, "message recalled");
                self.emit(SyncEvent::MessageRecalled {
                    local_id: *local_id,
                });
                Ok(recalled)
            }
            Err(error) if error.is_retryable() => {
                tracing::debug!(%server_id, %error, "recall deferred until connectivity returns");
                let op = PendingOperation::new(
                    message.conversation_id,
                    OperationKind::Recall,
                    OpTarget::Server { server_id },
                    now,
                );
                self.enqueue_retry(op, now).await?;
                Ok(message)
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Edit a sent message's payload.
    ///
    /// Same ownership and window rules as recall. The edit applies locally;
    /// the wire contract carries no edit request.
    pub async fn edit(
        &self,
        local_id: &LocalId,
        requester: &UserId,
        payload: MessagePayload,
    ) -> Result<Message> {
        let message = self.load(local_id).await?;
        let now = self.now_millis();
        self.inner.policy.check_edit(&message, requester, now)?;

        let edited = policy::apply_edit(message, payload, now);
        self.inner.store.put_message(&edited).await?;
        self.emit(SyncEvent::MessageUpdated {
            local_id: *local_id,
            server_id: edited.server_id.clone(),
        });
        Ok(edited)
    }

    /// Cancel an unconfirmed send.
    ///
    /// A queued retry is removed. If a gateway call is in flight its result
    /// is discarded when it lands: the message stays `Failed` with no
    /// `server_id`. Cancelling a confirmed message is a no-op (too late).
    pub async fn cancel_send(&self, local_id: &LocalId) -> Result<()> {
        let mut message = self.load(local_id).await?;
        if message.is_confirmed() {
            return Ok(());
        }

        self.remove_op(
            &message.conversation_id,
            OperationKind::Send,
            &OpTarget::Local {
                local_id: *local_id,
            },
        )
        .await?;

        if message.status == DeliveryStatus::Sending {
            self.inner.cancelled.insert(*local_id);
            message.status = delivery::mark_failed(message.status)?;
            self.inner.store.put_message(&message).await?;
            self.emit(SyncEvent::MessageFailed {
                local_id: *local_id,
            });
        }
        Ok(())
    }

    /// Apply a frame from the server push stream.
    ///
    /// Idempotent: frames arrive at-least-once and possibly out of order.
    pub async fn apply_event(&self, event: ServerEvent) -> Result<()> {
        match event {
            ServerEvent::NewMessage(remote) => {
                let local = match self.inner.store.get_by_server_id(&remote.server_id).await? {
                    Some(existing) => Some(existing),
                    None => match remote.temp_id {
                        Some(temp_id) => self.inner.store.get_by_local_id(&temp_id).await?,
                        None => None,
                    },
                };

                let merged = reconcile::merge_remote(local, remote);
                let message = match &merged {
                    Merged::Updated(msg) | Merged::Inserted(msg) => msg.clone(),
                };
                self.inner.store.put_message(&message).await?;

                // Our own echo confirms the optimistic send; the queued
                // retry, if any, is obsolete.
                if message.sender_id == self.inner.user {
                    self.remove_op(
                        &message.conversation_id,
                        OperationKind::Send,
                        &OpTarget::Local {
                            local_id: message.local_id,
                        },
                    )
                    .await?;
                }

                self.emit(SyncEvent::MessageUpdated {
                    local_id: message.local_id,
                    server_id: message.server_id.clone(),
                });
            }
            ServerEvent::StatusUpdate { server_id, status } => {
                let Some(mut message) = self.inner.store.get_by_server_id(&server_id).await?
                else {
                    tracing::debug!(%server_id, "status update for unknown message; ignoring");
                    return Ok(());
                };
                let Some(next) = delivery::apply_remote(message.status, status) else {
                    return Ok(());
                };
                message.status = next;
                self.inner.store.put_message(&message).await?;
                self.emit(SyncEvent::MessageUpdated {
                    local_id: message.local_id,
                    server_id: Some(server_id),
                });
            }
            ServerEvent::RecallNotice {
                server_id,
                recalled_at,
            } => {
                let Some(message) = self.inner.store.get_by_server_id(&server_id).await? else {
                    return Ok(());
                };
                if message.status == DeliveryStatus::Recalled {
                    return Ok(());
                }
                // The server already confirmed this recall; the window check
                // does not apply to remote-initiated recalls.
                let local_id = message.local_id;
                let recalled = policy::apply_recall(message, recalled_at);
                self.inner.store.put_message(&recalled).await?;
                self.emit(SyncEvent::MessageRecalled { local_id });
            }
        }
        Ok(())
    }

    /// Run one retry pass: replay every queued operation whose deadline has
    /// elapsed.
    ///
    /// Operations replay FIFO within a conversation; a retryable failure
    /// stops that conversation's batch so causal order is preserved.
    /// Conversations are processed concurrently.
    pub async fn process_due(&self, now_millis: i64) -> Result<()> {
        let due = self.inner.store.list_due_ops(now_millis).await?;
        if due.is_empty() {
            return Ok(());
        }
        tracing::debug!(count = due.len(), "processing due operations");

        let mut by_conversation: HashMap<ConversationId, Vec<PendingOperation>> = HashMap::new();
        for op in due {
            by_conversation.entry(op.conversation_id).or_default().push(op);
        }

        let mut tasks = JoinSet::new();
        for (_, ops) in by_conversation {
            let this = self.clone();
            tasks.spawn(async move { this.process_conversation_batch(ops, now_millis).await });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    tracing::warn!(%error, "retry batch failed");
                    first_error.get_or_insert(error);
                }
                Err(error) => tracing::warn!(%error, "retry batch panicked"),
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn process_conversation_batch(
        &self,
        ops: Vec<PendingOperation>,
        now_millis: i64,
    ) -> Result<()> {
        for op in ops {
            if !self.run_op(&op, now_millis).await? {
                break;
            }
        }
        Ok(())
    }

    /// Replay one queued operation. Returns whether the conversation's batch
    /// may continue.
    async fn run_op(&self, op: &PendingOperation, now_millis: i64) -> Result<bool> {
        if op.kind == OperationKind::Send {
            return self.retry_send(op, now_millis).await;
        }

        let result = match (&op.kind, &op.target) {
            (OperationKind::Delete, OpTarget::Server { server_id }) => {
                self.request(self.inner.gateway.delete_message(server_id)).await
            }
            (OperationKind::MarkRead, OpTarget::Server { server_id }) => {
                self.request(
                    self.inner
                        .gateway
                        .mark_read(&ReadTarget::Message(server_id.clone())),
                )
                .await
            }
            (OperationKind::MarkAllRead, OpTarget::Conversation) => {
                self.request(
                    self.inner
                        .gateway
                        .mark_read(&ReadTarget::Conversation(op.conversation_id)),
                )
                .await
            }
            (OperationKind::Recall, OpTarget::Server { server_id }) => {
                let Some(message) = self.inner.store.get_by_server_id(server_id).await? else {
                    self.inner.store.remove_pending_op(&op.op_id).await?;
                    return Ok(true);
                };
                // The window keeps running while the recall waits in the
                // queue; re-check before dispatching.
                if let Err(violation) =
                    self.inner
                        .policy
                        .check_recall(&message, &message.sender_id, now_millis)
                {
                    tracing::info!(op_id = %op.op_id, %violation, "queued recall no longer valid");
                    self.inner.store.remove_pending_op(&op.op_id).await?;
                    self.emit(SyncEvent::OperationRejected {
                        op_id: op.op_id,
                        reason: violation.to_string(),
                    });
                    return Ok(true);
                }
                self.request(self.inner.gateway.recall_message(server_id)).await
            }
            (kind, target) => {
                tracing::warn!(op_id = %op.op_id, ?kind, ?target, "malformed queued operation");
                self.inner.store.remove_pending_op(&op.op_id).await?;
                return Ok(true);
            }
        };

        match result {
            Ok(()) => {
                match (&op.kind, &op.target) {
                    (OperationKind::Delete, OpTarget::Server { server_id }) => {
                        if let Some(message) =
                            self.inner.store.get_by_server_id(server_id).await?
                        {
                            self.inner.store.delete_message(&message.local_id).await?;
                            self.emit(SyncEvent::MessageDeleted {
                                local_id: message.local_id,
                            });
                        }
                    }
                    (OperationKind::Recall, OpTarget::Server { server_id }) => {
                        if let Some(message) =
                            self.inner.store.get_by_server_id(server_id).await?
                        {
                            let local_id = message.local_id;
                            let recalled = policy::apply_recall(message, now_millis);
                            self.inner.store.put_message(&recalled).await?;
                            self.emit(SyncEvent::MessageRecalled { local_id });
                        }
                    }
                    // Read state was already advanced locally when queued.
                    _ => {}
                }
                self.inner.store.remove_pending_op(&op.op_id).await?;
                Ok(true)
            }
            Err(error) if error.is_retryable() => {
                self.reschedule_or_exhaust(op, now_millis, &error).await?;
                Ok(false)
            }
            Err(error) => {
                tracing::warn!(op_id = %op.op_id, %error, "queued operation rejected");
                self.inner.store.remove_pending_op(&op.op_id).await?;
                self.emit(SyncEvent::OperationRejected {
                    op_id: op.op_id,
                    reason: error.to_string(),
                });
                Ok(true)
            }
        }
    }

    /// Replay a queued send. Returns whether the batch may continue.
    async fn retry_send(&self, op: &PendingOperation, now_millis: i64) -> Result<bool> {
        let OpTarget::Local { local_id } = op.target else {
            self.inner.store.remove_pending_op(&op.op_id).await?;
            return Ok(true);
        };
        let Some(mut message) = self.inner.store.get_by_local_id(&local_id).await? else {
            // Deleted while queued.
            self.inner.store.remove_pending_op(&op.op_id).await?;
            return Ok(true);
        };
        if message.is_confirmed() {
            // A push echo already reconciled this send.
            self.inner.store.remove_pending_op(&op.op_id).await?;
            return Ok(true);
        }
        let Ok(status) = delivery::begin_retry(message.status) else {
            self.inner.store.remove_pending_op(&op.op_id).await?;
            return Ok(true);
        };
        message.status = status;
        self.inner.store.put_message(&message).await?;

        // Prefer the durable snapshot taken at enqueue time.
        let draft = match &op.draft {
            Some(draft) => draft.clone(),
            None => message.to_draft(),
        };

        match self.request(self.inner.gateway.send_message(&draft)).await {
            Ok(ack) => {
                if self.inner.cancelled.remove(&local_id).is_some() {
                    // Cancelled mid-flight: discard the ack, unless an echo
                    // already proved the send happened.
                    self.fail_unless_confirmed(&local_id).await?;
                    self.inner.store.remove_pending_op(&op.op_id).await?;
                    return Ok(true);
                }
                // Re-read: a push echo may have reconciled the row while the
                // request was in flight, and its server id is write-once.
                let Some(current) = self.inner.store.get_by_local_id(&local_id).await? else {
                    self.inner.store.remove_pending_op(&op.op_id).await?;
                    return Ok(true);
                };
                if current.is_confirmed() {
                    self.inner.store.remove_pending_op(&op.op_id).await?;
                    return Ok(true);
                }
                let merged = reconcile::merge_ack(current, &ack);
                self.inner.store.put_message(&merged).await?;
                self.inner.store.remove_pending_op(&op.op_id).await?;
                tracing::debug!(%local_id, server_id = %ack.server_id, "queued send confirmed");
                self.emit(SyncEvent::MessageUpdated {
                    local_id,
                    server_id: merged.server_id.clone(),
                });
                Ok(true)
            }
            Err(error) if error.is_retryable() => {
                if self.fail_unless_confirmed(&local_id).await? {
                    // The send reached the server after all; the echo
                    // confirmed it while this attempt was failing.
                    self.inner.store.remove_pending_op(&op.op_id).await?;
                    return Ok(true);
                }
                self.emit(SyncEvent::MessageFailed { local_id });
                self.reschedule_or_exhaust(op, now_millis, &error).await?;
                Ok(false)
            }
            Err(error) => {
                let confirmed = self.fail_unless_confirmed(&local_id).await?;
                self.inner.store.remove_pending_op(&op.op_id).await?;
                if !confirmed {
                    self.emit(SyncEvent::MessageFailed { local_id });
                    self.emit(SyncEvent::OperationRejected {
                        op_id: op.op_id,
                        reason: error.to_string(),
                    });
                }
                Ok(true)
            }
        }
    }

    /// Pull the next frame from the gateway push stream (used by the event
    /// loop driver).
    pub(crate) async fn next_gateway_event(&self) -> std::result::Result<ServerEvent, TransportError> {
        self.inner.gateway.next_event().await
    }

    pub(crate) fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    /// Mark a message `Failed` after an unsuccessful send attempt, unless a
    /// push echo confirmed it in the meantime. Returns whether the row is
    /// confirmed.
    async fn fail_unless_confirmed(&self, local_id: &LocalId) -> Result<bool> {
        let Some(mut current) = self.inner.store.get_by_local_id(local_id).await? else {
            return Ok(false);
        };
        if current.is_confirmed() {
            return Ok(true);
        }
        if current.status == DeliveryStatus::Sending {
            current.status = delivery::mark_failed(current.status)?;
            self.inner.store.put_message(&current).await?;
        }
        Ok(false)
    }

    async fn load(&self, local_id: &LocalId) -> Result<Message> {
        self.inner
            .store
            .get_by_local_id(local_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(local_id.to_string()))
    }

    /// Dispatch a persisted `Sending` message over the gateway and reconcile
    /// the outcome.
    async fn dispatch_send(&self, message: Message) -> Result<Message> {
        let draft = message.to_draft();
        let local_id = message.local_id;
        let conversation_id = message.conversation_id;

        match self.request(self.inner.gateway.send_message(&draft)).await {
            Ok(ack) => {
                if self.inner.cancelled.remove(&local_id).is_some() {
                    tracing::debug!(%local_id, "send cancelled in flight; discarding ack");
                    return self.load(&local_id).await;
                }
                // Re-read: a push event may have advanced the row while the
                // request was in flight. A row deleted meanwhile stays gone.
                let Some(current) = self.inner.store.get_by_local_id(&local_id).await? else {
                    return Ok(message);
                };
                let merged = reconcile::merge_ack(current, &ack);
                self.inner.store.put_message(&merged).await?;
                self.remove_op(
                    &conversation_id,
                    OperationKind::Send,
                    &OpTarget::Local { local_id },
                )
                .await?;
                tracing::debug!(%local_id, server_id = %ack.server_id, "send confirmed");
                self.emit(SyncEvent::MessageUpdated {
                    local_id,
                    server_id: merged.server_id.clone(),
                });
                Ok(merged)
            }
            Err(error) if error.is_retryable() => {
                let mut failed = match self.inner.store.get_by_local_id(&local_id).await? {
                    Some(current) => current,
                    None => return Ok(message),
                };
                if failed.status == DeliveryStatus::Sending {
                    failed.status = delivery::mark_failed(failed.status)?;
                    self.inner.store.put_message(&failed).await?;
                }
                self.emit(SyncEvent::MessageFailed { local_id });

                if self.inner.cancelled.remove(&local_id).is_some() {
                    // Cancelled while in flight: no retry.
                    return Ok(failed);
                }

                tracing::debug!(%local_id, %error, "send failed; queued for retry");
                let now = self.now_millis();
                let op = PendingOperation::new(
                    conversation_id,
                    OperationKind::Send,
                    OpTarget::Local { local_id },
                    now,
                )
                .with_draft(draft);
                self.enqueue_retry(op, now).await?;
                Ok(failed)
            }
            Err(error) => {
                tracing::warn!(%local_id, %error, "send rejected");
                if let Some(mut failed) = self.inner.store.get_by_local_id(&local_id).await? {
                    if failed.status == DeliveryStatus::Sending {
                        failed.status = delivery::mark_failed(failed.status)?;
                        self.inner.store.put_message(&failed).await?;
                    }
                }
                self.emit(SyncEvent::MessageFailed { local_id });
                Err(error.into())
            }
        }
    }

    /// Coalesce `op` into the queue and schedule its next attempt.
    async fn enqueue_retry(&self, op: PendingOperation, now_millis: i64) -> Result<()> {
        let stored = self.inner.store.upsert_pending_op(op).await?;
        let attempt = stored.attempt_count + 1;
        let deadline = self.inner.config.retry.next_retry_at(now_millis, attempt);
        self.inner
            .store
            .reschedule_op(&stored.op_id, attempt, deadline)
            .await?;
        tracing::debug!(op_id = %stored.op_id, attempt, "operation queued for retry");
        Ok(())
    }

    /// After a retryable failure: either schedule the next attempt or give
    /// up permanently.
    async fn reschedule_or_exhaust(
        &self,
        op: &PendingOperation,
        now_millis: i64,
        error: &TransportError,
    ) -> Result<()> {
        let attempt = op.attempt_count + 1;
        if self.inner.config.retry.exhausted(attempt) {
            tracing::warn!(op_id = %op.op_id, attempt, %error, "retries exhausted");
            self.inner.store.remove_pending_op(&op.op_id).await?;
            self.emit(SyncEvent::RetriesExhausted { op_id: op.op_id });
        } else {
            let deadline = self.inner.config.retry.next_retry_at(now_millis, attempt);
            self.inner
                .store
                .reschedule_op(&op.op_id, attempt, deadline)
                .await?;
            tracing::debug!(op_id = %op.op_id, attempt, deadline, "operation rescheduled");
        }
        Ok(())
    }

    async fn remove_op(
        &self,
        conversation_id: &ConversationId,
        kind: OperationKind,
        target: &OpTarget,
    ) -> Result<()> {
        let ops = self.inner.store.list_pending_ops(Some(conversation_id)).await?;
        if let Some(op) = ops.into_iter().find(|op| op.kind == kind && &op.target == target) {
            self.inner.store.remove_pending_op(&op.op_id).await?;
        }
        Ok(())
    }

    /// Wrap a gateway call in the configured timeout.
    async fn request<T>(
        &self,
        call: impl Future<Output = std::result::Result<T, TransportError>>,
    ) -> std::result::Result<T, TransportError> {
        match tokio::time::timeout(self.inner.config.request_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::gateway::MockGateway;
    use chat_sync_core::RetrySchedule;
    use chat_sync_store::SqliteStore;
    use chat_sync_types::{RemoteMessage, RemoteStatus};
    use std::collections::BTreeMap;
    use std::time::Duration;

    const T0: i64 = 1_700_000_000_000;

    async fn setup() -> (
        SyncCoordinator<MockGateway>,
        MockGateway,
        Arc<ManualClock>,
        Arc<SqliteStore>,
    ) {
        setup_with_config(SyncConfig::default()).await
    }

    async fn setup_with_config(
        config: SyncConfig,
    ) -> (
        SyncCoordinator<MockGateway>,
        MockGateway,
        Arc<ManualClock>,
        Arc<SqliteStore>,
    ) {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let gateway = MockGateway::new();
        let clock = Arc::new(ManualClock::new(T0));
        let coordinator = SyncCoordinator::with_clock(
            UserId::from("alice"),
            store.clone(),
            gateway.clone(),
            config,
            clock.clone(),
        );
        (coordinator, gateway, clock, store)
    }

    fn text(body: &str) -> MessagePayload {
        MessagePayload::text(body)
    }

    async fn send_text(
        coordinator: &SyncCoordinator<MockGateway>,
        conversation: ConversationId,
        body: &str,
    ) -> Message {
        coordinator
            .send(conversation, MessageKind::Text, text(body))
            .await
            .unwrap()
    }

    // ===========================================
    // Optimistic Send Tests
    // ===========================================

    #[tokio::test]
    async fn send_confirms_with_ack() {
        let (coordinator, gateway, _, _) = setup().await;
        let mut events = coordinator.subscribe();
        let conversation = ConversationId::new();

        let msg = send_text(&coordinator, conversation, "hi").await;

        assert_eq!(msg.status, DeliveryStatus::Sent);
        assert_eq!(msg.server_id, Some(ServerId::from("srv-1")));
        assert_eq!(msg.created_at, T0);

        // The draft echoed our local_id for reconciliation.
        let drafts = gateway.sent_drafts();
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].temp_id, msg.local_id);

        let event = events.recv().await.unwrap();
        assert_eq!(
            event,
            SyncEvent::MessageUpdated {
                local_id: msg.local_id,
                server_id: Some(ServerId::from("srv-1")),
            }
        );
    }

    #[tokio::test]
    async fn offline_send_marks_failed_and_queues() {
        let (coordinator, gateway, _, store) = setup().await;
        gateway.set_offline(true);
        let conversation = ConversationId::new();

        // A retryable failure is not an error: the message is durable.
        let msg = send_text(&coordinator, conversation, "hi").await;

        assert_eq!(msg.status, DeliveryStatus::Failed);
        assert!(msg.server_id.is_none());

        let ops = store.list_pending_ops(Some(&conversation)).await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].kind, OperationKind::Send);
        assert_eq!(ops[0].attempt_count, 1);
        assert_eq!(
            ops[0].draft.as_ref().unwrap().payload,
            MessagePayload::text("hi")
        );
    }

    #[tokio::test]
    async fn rejected_send_surfaces_error_without_retry() {
        let (coordinator, gateway, _, store) = setup().await;
        gateway.queue_send_result(Err(TransportError::Rejected {
            reason: "payload too large".into(),
        }));
        let conversation = ConversationId::new();

        let result = coordinator
            .send(conversation, MessageKind::Text, text("hi"))
            .await;
        assert!(matches!(
            result,
            Err(SyncError::Transport(TransportError::Rejected { .. }))
        ));

        let msgs = store.query_conversation(&conversation, 10, None).await.unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].status, DeliveryStatus::Failed);
        // No retry for a permanent rejection.
        assert!(store.list_pending_ops(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn request_timeout_is_retryable() {
        let config = SyncConfig::default().with_request_timeout(Duration::from_millis(20));
        let (coordinator, gateway, _, store) = setup_with_config(config).await;
        gateway.set_send_delay(Duration::from_millis(200));
        let conversation = ConversationId::new();

        let msg = send_text(&coordinator, conversation, "slow").await;

        assert_eq!(msg.status, DeliveryStatus::Failed);
        assert_eq!(store.list_pending_ops(None).await.unwrap().len(), 1);
    }

    // ===========================================
    // Retry Pass Tests
    // ===========================================

    #[tokio::test]
    async fn offline_send_then_retry_confirms_exactly_once() {
        let (coordinator, gateway, clock, store) = setup().await;
        gateway.set_offline(true);
        let conversation = ConversationId::new();

        let msg = send_text(&coordinator, conversation, "hi").await;
        assert_eq!(msg.status, DeliveryStatus::Failed);

        gateway.set_offline(false);
        clock.advance(Duration::from_secs(10));
        coordinator.process_due(coordinator.now_millis()).await.unwrap();

        let msgs = store.query_conversation(&conversation, 10, None).await.unwrap();
        assert_eq!(msgs.len(), 1, "retry must not duplicate the message");
        assert_eq!(msgs[0].local_id, msg.local_id);
        assert_eq!(msgs[0].status, DeliveryStatus::Sent);
        assert!(msgs[0].server_id.is_some());
        assert!(store.list_pending_ops(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn queued_sends_replay_fifo_within_conversation() {
        let (coordinator, gateway, clock, _) = setup().await;
        gateway.set_offline(true);
        let conversation = ConversationId::new();

        send_text(&coordinator, conversation, "a").await;
        send_text(&coordinator, conversation, "b").await;
        send_text(&coordinator, conversation, "c").await;

        gateway.set_offline(false);
        clock.advance(Duration::from_secs(10));
        coordinator.process_due(coordinator.now_millis()).await.unwrap();

        // Drafts 0..3 are the failed foreground attempts; the replay comes
        // after, in creation order.
        let drafts = gateway.sent_drafts();
        assert_eq!(drafts.len(), 6);
        let replayed: Vec<_> = drafts[3..].iter().map(|d| d.payload.clone()).collect();
        assert_eq!(
            replayed,
            vec![text("a"), text("b"), text("c")],
            "causal order within a conversation must survive the retry pass"
        );
    }

    #[tokio::test]
    async fn retryable_failure_stops_conversation_batch() {
        let (coordinator, gateway, clock, store) = setup().await;
        gateway.set_offline(true);
        let conversation = ConversationId::new();

        let first = send_text(&coordinator, conversation, "a").await;
        let second = send_text(&coordinator, conversation, "b").await;

        // Still offline at retry time.
        clock.advance(Duration::from_secs(10));
        coordinator.process_due(coordinator.now_millis()).await.unwrap();

        let ops = store.list_pending_ops(Some(&conversation)).await.unwrap();
        assert_eq!(ops.len(), 2);
        let first_op = ops
            .iter()
            .find(|op| op.target == OpTarget::Local { local_id: first.local_id })
            .unwrap();
        let second_op = ops
            .iter()
            .find(|op| op.target == OpTarget::Local { local_id: second.local_id })
            .unwrap();
        // Only the head of the queue was attempted.
        assert_eq!(first_op.attempt_count, 2);
        assert_eq!(second_op.attempt_count, 1);
    }

    #[tokio::test]
    async fn exhausted_retries_remove_op_and_leave_message_failed() {
        let config = SyncConfig::default().with_retry(RetrySchedule {
            max_attempts: 2,
            ..RetrySchedule::default()
        });
        let (coordinator, gateway, clock, store) = setup_with_config(config).await;
        let mut events = coordinator.subscribe();
        gateway.set_offline(true);
        let conversation = ConversationId::new();

        let msg = send_text(&coordinator, conversation, "hi").await; // Attempt 1.
        clock.advance(Duration::from_secs(10));
        coordinator.process_due(coordinator.now_millis()).await.unwrap(); // Attempt 2: exhausted.

        assert!(store.list_pending_ops(None).await.unwrap().is_empty());
        let stored = store.get_by_local_id(&msg.local_id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Failed);

        let mut saw_exhausted = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SyncEvent::RetriesExhausted { .. }) {
                saw_exhausted = true;
            }
        }
        assert!(saw_exhausted);
    }

    #[tokio::test]
    async fn retry_ack_keeps_server_id_stamped_by_echo() {
        let (coordinator, gateway, clock, store) = setup().await;
        gateway.set_offline(true);
        let conversation = ConversationId::new();
        let msg = send_text(&coordinator, conversation, "hi").await;

        // The original attempt reached the server even though its ack was
        // lost; the echo lands while the replayed send is still in flight.
        gateway.set_offline(false);
        gateway.set_send_delay(Duration::from_millis(100));
        clock.advance(Duration::from_secs(10));

        let retrier = coordinator.clone();
        let now = coordinator.now_millis();
        let pass = tokio::spawn(async move { retrier.process_due(now).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut echo = remote_message("s-echo", conversation, "alice", "hi");
        echo.temp_id = Some(msg.local_id);
        coordinator
            .apply_event(ServerEvent::NewMessage(echo))
            .await
            .unwrap();
        let stamped = store.get_by_local_id(&msg.local_id).await.unwrap().unwrap();
        assert_eq!(stamped.server_id, Some(ServerId::from("s-echo")));

        pass.await.unwrap().unwrap();

        let stored = store.get_by_local_id(&msg.local_id).await.unwrap().unwrap();
        assert_eq!(
            stored.server_id,
            Some(ServerId::from("s-echo")),
            "server id is write-once; the replay's ack must not clobber it"
        );
        assert!(store.list_pending_ops(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn retry_failure_does_not_regress_echoed_confirmation() {
        let (coordinator, gateway, clock, store) = setup().await;
        gateway.set_offline(true);
        let conversation = ConversationId::new();
        let msg = send_text(&coordinator, conversation, "hi").await;

        // Echo arrives while the replay is in flight, but this time the
        // replayed request itself times out on the way back.
        gateway.set_send_delay(Duration::from_millis(100));
        clock.advance(Duration::from_secs(10));

        let retrier = coordinator.clone();
        let now = coordinator.now_millis();
        let pass = tokio::spawn(async move { retrier.process_due(now).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut echo = remote_message("s-echo", conversation, "alice", "hi");
        echo.temp_id = Some(msg.local_id);
        coordinator
            .apply_event(ServerEvent::NewMessage(echo))
            .await
            .unwrap();

        pass.await.unwrap().unwrap();

        let stored = store.get_by_local_id(&msg.local_id).await.unwrap().unwrap();
        assert_eq!(stored.server_id, Some(ServerId::from("s-echo")));
        assert_eq!(stored.status, DeliveryStatus::Sent, "confirmed row must not fail");
        assert!(store.list_pending_ops(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn resend_after_failure_succeeds() {
        let (coordinator, gateway, _, _) = setup().await;
        gateway.set_offline(true);
        let conversation = ConversationId::new();

        let msg = send_text(&coordinator, conversation, "hi").await;
        assert_eq!(msg.status, DeliveryStatus::Failed);

        gateway.set_offline(false);
        let resent = coordinator.resend(&msg.local_id).await.unwrap();
        assert_eq!(resent.status, DeliveryStatus::Sent);
        assert_eq!(resent.local_id, msg.local_id);
        assert!(resent.server_id.is_some());
    }

    #[tokio::test]
    async fn resend_of_confirmed_message_is_illegal() {
        let (coordinator, _, _, _) = setup().await;
        let conversation = ConversationId::new();
        let msg = send_text(&coordinator, conversation, "hi").await;

        let result = coordinator.resend(&msg.local_id).await;
        assert!(matches!(result, Err(SyncError::Transition(_))));
    }

    // ===========================================
    // Inbound Event Tests
    // ===========================================

    fn remote_message(
        server_id: &str,
        conversation: ConversationId,
        sender: &str,
        body: &str,
    ) -> RemoteMessage {
        RemoteMessage {
            server_id: ServerId::from(server_id),
            temp_id: None,
            conversation_id: conversation,
            sender_id: UserId::from(sender),
            kind: MessageKind::Text,
            payload: MessagePayload::text(body),
            metadata: BTreeMap::new(),
            created_at: T0 + 1_000,
        }
    }

    #[tokio::test]
    async fn inbound_message_is_stored_as_delivered() {
        let (coordinator, _, _, store) = setup().await;
        let conversation = ConversationId::new();

        coordinator
            .apply_event(ServerEvent::NewMessage(remote_message(
                "s9",
                conversation,
                "bob",
                "hello",
            )))
            .await
            .unwrap();

        let msgs = store.query_conversation(&conversation, 10, None).await.unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].status, DeliveryStatus::Delivered);
        assert_eq!(msgs[0].sender_id, UserId::from("bob"));
    }

    #[tokio::test]
    async fn duplicate_new_message_events_store_one_row() {
        let (coordinator, _, _, store) = setup().await;
        let conversation = ConversationId::new();
        let remote = remote_message("s9", conversation, "bob", "hello");

        coordinator
            .apply_event(ServerEvent::NewMessage(remote.clone()))
            .await
            .unwrap();
        coordinator
            .apply_event(ServerEvent::NewMessage(remote))
            .await
            .unwrap();

        let msgs = store.query_conversation(&conversation, 10, None).await.unwrap();
        assert_eq!(msgs.len(), 1);
    }

    #[tokio::test]
    async fn own_echo_does_not_duplicate_optimistic_send() {
        let (coordinator, _, _, store) = setup().await;
        let conversation = ConversationId::new();
        let msg = send_text(&coordinator, conversation, "hi").await;

        let mut echo = remote_message("srv-1", conversation, "alice", "hi");
        echo.temp_id = Some(msg.local_id);
        coordinator
            .apply_event(ServerEvent::NewMessage(echo))
            .await
            .unwrap();

        let msgs = store.query_conversation(&conversation, 10, None).await.unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].local_id, msg.local_id);
    }

    #[tokio::test]
    async fn echo_while_offline_confirms_and_drops_queued_retry() {
        let (coordinator, gateway, _, store) = setup().await;
        gateway.set_offline(true);
        let conversation = ConversationId::new();
        let msg = send_text(&coordinator, conversation, "hi").await;
        assert_eq!(store.list_pending_ops(None).await.unwrap().len(), 1);

        // The send reached the server even though the ack was lost; the
        // push stream echoes it back.
        let mut echo = remote_message("s1", conversation, "alice", "hi");
        echo.temp_id = Some(msg.local_id);
        coordinator
            .apply_event(ServerEvent::NewMessage(echo))
            .await
            .unwrap();

        let stored = store.get_by_local_id(&msg.local_id).await.unwrap().unwrap();
        assert_eq!(stored.server_id, Some(ServerId::from("s1")));
        assert_eq!(stored.status, DeliveryStatus::Sent);
        assert!(
            store.list_pending_ops(None).await.unwrap().is_empty(),
            "confirmed send must not be replayed"
        );
    }

    #[tokio::test]
    async fn status_updates_advance_monotonically() {
        let (coordinator, _, _, store) = setup().await;
        let conversation = ConversationId::new();
        let msg = send_text(&coordinator, conversation, "hi").await;
        let server_id = msg.server_id.clone().unwrap();

        coordinator
            .apply_event(ServerEvent::StatusUpdate {
                server_id: server_id.clone(),
                status: RemoteStatus::Read,
            })
            .await
            .unwrap();
        // A stale delivered event after read is a no-op.
        coordinator
            .apply_event(ServerEvent::StatusUpdate {
                server_id,
                status: RemoteStatus::Delivered,
            })
            .await
            .unwrap();

        let stored = store.get_by_local_id(&msg.local_id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Read);
    }

    #[tokio::test]
    async fn status_update_for_unknown_message_is_ignored() {
        let (coordinator, _, _, _) = setup().await;
        coordinator
            .apply_event(ServerEvent::StatusUpdate {
                server_id: ServerId::from("nope"),
                status: RemoteStatus::Read,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn recall_notice_applies_tombstone() {
        let (coordinator, _, _, store) = setup().await;
        let conversation = ConversationId::new();

        coordinator
            .apply_event(ServerEvent::NewMessage(remote_message(
                "s9",
                conversation,
                "bob",
                "regret",
            )))
            .await
            .unwrap();
        coordinator
            .apply_event(ServerEvent::RecallNotice {
                server_id: ServerId::from("s9"),
                recalled_at: T0 + 5_000,
            })
            .await
            .unwrap();

        let stored = store.get_by_server_id(&ServerId::from("s9")).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Recalled);
        assert_eq!(stored.payload, MessagePayload::Tombstone);
        assert_eq!(stored.recalled_at, Some(T0 + 5_000));
    }

    #[tokio::test]
    async fn redelivered_message_does_not_resurrect_recalled_payload() {
        let (coordinator, _, _, store) = setup().await;
        let conversation = ConversationId::new();
        let remote = remote_message("s9", conversation, "bob", "regret");

        coordinator
            .apply_event(ServerEvent::NewMessage(remote.clone()))
            .await
            .unwrap();
        coordinator
            .apply_event(ServerEvent::RecallNotice {
                server_id: ServerId::from("s9"),
                recalled_at: T0 + 5_000,
            })
            .await
            .unwrap();
        // At-least-once delivery replays the original frame after the recall.
        coordinator
            .apply_event(ServerEvent::NewMessage(remote))
            .await
            .unwrap();

        let stored = store.get_by_server_id(&ServerId::from("s9")).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Recalled);
        assert_eq!(stored.payload, MessagePayload::Tombstone);
        assert_eq!(stored.recalled_at, Some(T0 + 5_000));
    }

    // ===========================================
    // Recall and Edit Tests
    // ===========================================

    #[tokio::test]
    async fn recall_inside_window_tombstones() {
        let (coordinator, gateway, clock, store) = setup().await;
        let conversation = ConversationId::new();
        let msg = send_text(&coordinator, conversation, "oops").await;

        clock.advance(Duration::from_secs(30));
        let recalled = coordinator
            .recall(&msg.local_id, &UserId::from("alice"))
            .await
            .unwrap();

        assert_eq!(recalled.status, DeliveryStatus::Recalled);
        assert_eq!(recalled.payload, MessagePayload::Tombstone);
        assert_eq!(recalled.recalled_at, Some(clock.now_millis()));
        assert_eq!(gateway.recalled(), vec![ServerId::from("srv-1")]);

        let stored = store.get_by_local_id(&msg.local_id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Recalled);
    }

    #[tokio::test]
    async fn recall_outside_window_fails_without_network() {
        let (coordinator, gateway, clock, store) = setup().await;
        let conversation = ConversationId::new();
        let msg = send_text(&coordinator, conversation, "too late").await;

        clock.advance(Duration::from_secs(121));
        let result = coordinator.recall(&msg.local_id, &UserId::from("alice")).await;

        assert!(matches!(result, Err(SyncError::Policy(_))));
        assert!(gateway.recalled().is_empty(), "violation must not reach the network");
        let stored = store.get_by_local_id(&msg.local_id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Sent);
    }

    #[tokio::test]
    async fn recall_by_non_sender_fails() {
        let (coordinator, _, _, _) = setup().await;
        let conversation = ConversationId::new();
        let msg = send_text(&coordinator, conversation, "mine").await;

        let result = coordinator.recall(&msg.local_id, &UserId::from("mallory")).await;
        assert!(matches!(result, Err(SyncError::Policy(_))));
    }

    #[tokio::test]
    async fn recall_rejected_by_server_leaves_message_intact() {
        let (coordinator, gateway, _, store) = setup().await;
        let conversation = ConversationId::new();
        let msg = send_text(&coordinator, conversation, "hi").await;

        gateway.queue_recall_result(Err(TransportError::Rejected {
            reason: "window elapsed on server".into(),
        }));
        let result = coordinator.recall(&msg.local_id, &UserId::from("alice")).await;

        assert!(matches!(result, Err(SyncError::Transport(_))));
        let stored = store.get_by_local_id(&msg.local_id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Sent);
        assert_ne!(stored.payload, MessagePayload::Tombstone);
    }

    #[tokio::test]
    async fn offline_recall_queues_and_driver_rechecks_window() {
        let (coordinator, gateway, clock, store) = setup().await;
        let mut events = coordinator.subscribe();
        let conversation = ConversationId::new();
        let msg = send_text(&coordinator, conversation, "hi").await;

        gateway.set_offline(true);
        let still_sent = coordinator
            .recall(&msg.local_id, &UserId::from("alice"))
            .await
            .unwrap();
        assert_eq!(still_sent.status, DeliveryStatus::Sent);
        assert_eq!(store.list_pending_ops(None).await.unwrap().len(), 1);

        // Connectivity returns only after the window has elapsed.
        gateway.set_offline(false);
        clock.advance(Duration::from_secs(300));
        coordinator.process_due(coordinator.now_millis()).await.unwrap();

        assert_eq!(gateway.recalled().len(), 1, "only the foreground attempt reached the gateway");
        assert!(store.list_pending_ops(None).await.unwrap().is_empty());
        let stored = store.get_by_local_id(&msg.local_id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Sent, "stale recall must not apply");

        let mut saw_rejection = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SyncEvent::OperationRejected { .. }) {
                saw_rejection = true;
            }
        }
        assert!(saw_rejection);
    }

    #[tokio::test]
    async fn offline_recall_replays_inside_window() {
        let (coordinator, gateway, clock, store) = setup().await;
        let conversation = ConversationId::new();
        let msg = send_text(&coordinator, conversation, "hi").await;

        gateway.set_offline(true);
        coordinator
            .recall(&msg.local_id, &UserId::from("alice"))
            .await
            .unwrap();

        gateway.set_offline(false);
        clock.advance(Duration::from_secs(10));
        coordinator.process_due(coordinator.now_millis()).await.unwrap();

        let stored = store.get_by_local_id(&msg.local_id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Recalled);
        assert_eq!(gateway.recalled().len(), 2);
    }

    #[tokio::test]
    async fn edit_replaces_payload_and_stamps_time() {
        let (coordinator, _, clock, store) = setup().await;
        let conversation = ConversationId::new();
        let msg = send_text(&coordinator, conversation, "helo").await;

        clock.advance(Duration::from_secs(5));
        let edited = coordinator
            .edit(&msg.local_id, &UserId::from("alice"), text("hello"))
            .await
            .unwrap();

        assert_eq!(edited.payload, MessagePayload::text("hello"));
        assert_eq!(edited.edited_at, Some(clock.now_millis()));
        assert_eq!(edited.status, DeliveryStatus::Sent);
        let stored = store.get_by_local_id(&msg.local_id).await.unwrap().unwrap();
        assert_eq!(stored.payload, MessagePayload::text("hello"));
    }

    #[tokio::test]
    async fn edit_by_non_sender_fails() {
        let (coordinator, _, _, _) = setup().await;
        let conversation = ConversationId::new();
        let msg = send_text(&coordinator, conversation, "hi").await;

        let result = coordinator
            .edit(&msg.local_id, &UserId::from("mallory"), text("hacked"))
            .await;
        assert!(matches!(result, Err(SyncError::Policy(_))));
    }

    // ===========================================
    // Read State Tests
    // ===========================================

    #[tokio::test]
    async fn mark_read_advances_locally_and_notifies_server() {
        let (coordinator, gateway, _, store) = setup().await;
        let conversation = ConversationId::new();
        coordinator
            .apply_event(ServerEvent::NewMessage(remote_message(
                "s1",
                conversation,
                "bob",
                "hello",
            )))
            .await
            .unwrap();

        let advanced = coordinator.mark_read(&conversation).await.unwrap();
        assert_eq!(advanced, 1);

        let msgs = store.query_conversation(&conversation, 10, None).await.unwrap();
        assert_eq!(msgs[0].status, DeliveryStatus::Read);
        assert_eq!(gateway.read_marks(), vec![ReadTarget::Conversation(conversation)]);
    }

    #[tokio::test]
    async fn offline_mark_read_coalesces_to_one_op() {
        let (coordinator, gateway, _, store) = setup().await;
        let conversation = ConversationId::new();
        coordinator
            .apply_event(ServerEvent::NewMessage(remote_message(
                "s1",
                conversation,
                "bob",
                "hello",
            )))
            .await
            .unwrap();

        gateway.set_offline(true);
        coordinator.mark_read(&conversation).await.unwrap();
        coordinator.mark_read(&conversation).await.unwrap();

        let ops = store.list_pending_ops(Some(&conversation)).await.unwrap();
        assert_eq!(ops.len(), 1, "identical requests must coalesce");
        assert_eq!(ops[0].kind, OperationKind::MarkAllRead);

        // Local state advanced despite being offline.
        let msgs = store.query_conversation(&conversation, 10, None).await.unwrap();
        assert_eq!(msgs[0].status, DeliveryStatus::Read);
    }

    #[tokio::test]
    async fn mark_single_message_read() {
        let (coordinator, gateway, _, store) = setup().await;
        let conversation = ConversationId::new();
        coordinator
            .apply_event(ServerEvent::NewMessage(remote_message(
                "s1",
                conversation,
                "bob",
                "hello",
            )))
            .await
            .unwrap();

        coordinator.mark_message_read(&ServerId::from("s1")).await.unwrap();

        let stored = store.get_by_server_id(&ServerId::from("s1")).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Read);
        assert_eq!(
            gateway.read_marks(),
            vec![ReadTarget::Message(ServerId::from("s1"))]
        );
    }

    // ===========================================
    // Delete Tests
    // ===========================================

    #[tokio::test]
    async fn delete_unconfirmed_is_local_only() {
        let (coordinator, gateway, _, store) = setup().await;
        gateway.set_offline(true);
        let conversation = ConversationId::new();
        let msg = send_text(&coordinator, conversation, "draft").await;
        assert_eq!(store.list_pending_ops(None).await.unwrap().len(), 1);

        coordinator.delete(&msg.local_id).await.unwrap();

        assert!(store.get_by_local_id(&msg.local_id).await.unwrap().is_none());
        // The queued send went with it.
        assert!(store.list_pending_ops(None).await.unwrap().is_empty());
        assert!(gateway.deleted().is_empty());
    }

    #[tokio::test]
    async fn delete_confirmed_calls_gateway() {
        let (coordinator, gateway, _, store) = setup().await;
        let conversation = ConversationId::new();
        let msg = send_text(&coordinator, conversation, "hi").await;

        coordinator.delete(&msg.local_id).await.unwrap();

        assert!(store.get_by_local_id(&msg.local_id).await.unwrap().is_none());
        assert_eq!(gateway.deleted(), vec![ServerId::from("srv-1")]);
    }

    #[tokio::test]
    async fn delete_confirmed_offline_defers() {
        let (coordinator, gateway, clock, store) = setup().await;
        let conversation = ConversationId::new();
        let msg = send_text(&coordinator, conversation, "hi").await;

        gateway.set_offline(true);
        coordinator.delete(&msg.local_id).await.unwrap();

        // Row survives until the server confirms.
        assert!(store.get_by_local_id(&msg.local_id).await.unwrap().is_some());
        assert_eq!(store.list_pending_ops(None).await.unwrap().len(), 1);

        gateway.set_offline(false);
        clock.advance(Duration::from_secs(10));
        coordinator.process_due(coordinator.now_millis()).await.unwrap();

        assert!(store.get_by_local_id(&msg.local_id).await.unwrap().is_none());
        assert!(store.list_pending_ops(None).await.unwrap().is_empty());
    }

    // ===========================================
    // Cancellation Tests
    // ===========================================

    #[tokio::test]
    async fn cancel_before_dispatch_removes_op() {
        let (coordinator, gateway, _, store) = setup().await;
        gateway.set_offline(true);
        let conversation = ConversationId::new();
        let msg = send_text(&coordinator, conversation, "hi").await;

        coordinator.cancel_send(&msg.local_id).await.unwrap();

        assert!(store.list_pending_ops(None).await.unwrap().is_empty());
        let stored = store.get_by_local_id(&msg.local_id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Failed);
    }

    #[tokio::test]
    async fn cancel_mid_flight_discards_ack() {
        let (coordinator, gateway, _, store) = setup().await;
        gateway.set_send_delay(Duration::from_millis(100));
        let conversation = ConversationId::new();

        let sender = coordinator.clone();
        let handle = tokio::spawn(async move {
            sender.send(conversation, MessageKind::Text, text("hi")).await
        });

        // Let the gateway call get in flight, then cancel.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let msgs = store.query_conversation(&conversation, 10, None).await.unwrap();
        assert_eq!(msgs.len(), 1);
        coordinator.cancel_send(&msgs[0].local_id).await.unwrap();

        let returned = handle.await.unwrap().unwrap();
        assert_eq!(returned.status, DeliveryStatus::Failed);
        assert!(returned.server_id.is_none(), "the ack must be discarded");

        let stored = store.get_by_local_id(&msgs[0].local_id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Failed);
        assert!(stored.server_id.is_none());
        assert!(store.list_pending_ops(None).await.unwrap().is_empty());
    }

    // ===========================================
    // End-to-End Scenario
    // ===========================================

    #[tokio::test]
    async fn offline_hi_reconnect_ack_then_read() {
        let (coordinator, gateway, clock, store) = setup().await;
        let conversation = ConversationId::new();

        // Compose "hi" while offline: visible immediately, then failed.
        gateway.set_offline(true);
        let m1 = send_text(&coordinator, conversation, "hi").await;
        let visible = store.query_conversation(&conversation, 10, None).await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].status, DeliveryStatus::Failed);

        // Connectivity returns; the retry pass delivers it.
        gateway.set_offline(false);
        clock.advance(Duration::from_secs(10));
        coordinator.process_due(coordinator.now_millis()).await.unwrap();

        let confirmed = store.get_by_local_id(&m1.local_id).await.unwrap().unwrap();
        assert_eq!(confirmed.status, DeliveryStatus::Sent);
        let server_id = confirmed.server_id.clone().unwrap();

        // The recipient reads it; the push stream tells us.
        coordinator
            .apply_event(ServerEvent::StatusUpdate {
                server_id,
                status: RemoteStatus::Read,
            })
            .await
            .unwrap();

        let final_state = store.get_by_local_id(&m1.local_id).await.unwrap().unwrap();
        assert_eq!(final_state.status, DeliveryStatus::Read);
        let all = store.query_conversation(&conversation, 10, None).await.unwrap();
        assert_eq!(all.len(), 1, "one send, one row, start to finish");
    }
}
