//! Mock gateway for testing.
//!
//! Records every call, supports queued per-call results, an offline mode
//! that forces network errors, and a queueable push-event stream.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use chat_sync_types::{MessageDraft, ReadTarget, SendAck, ServerEvent, ServerId};

use super::{Gateway, TransportError};

/// Mock gateway for testing.
///
/// Clones share state, so a test can hold one handle for assertions while
/// the coordinator owns another. Unless a result is queued, requests
/// succeed: sends are auto-acked with sequential server identifiers
/// (`srv-1`, `srv-2`, ...) echoing the draft's `temp_id`.
#[derive(Debug, Default)]
pub struct MockGateway {
    inner: Arc<Mutex<MockGatewayInner>>,
}

#[derive(Debug, Default)]
struct MockGatewayInner {
    offline: bool,
    next_server_seq: u64,
    send_delay: Option<Duration>,
    sent_drafts: Vec<MessageDraft>,
    deleted: Vec<ServerId>,
    read_marks: Vec<ReadTarget>,
    recalled: Vec<ServerId>,
    send_results: VecDeque<Result<SendAck, TransportError>>,
    delete_results: VecDeque<Result<(), TransportError>>,
    read_results: VecDeque<Result<(), TransportError>>,
    recall_results: VecDeque<Result<(), TransportError>>,
    events: VecDeque<ServerEvent>,
    event_stream_error: Option<TransportError>,
}

impl MockGateway {
    /// Create a new mock gateway (online, auto-acking).
    pub fn new() -> Self {
        Self::default()
    }

    /// Force all requests to fail with a network error until re-enabled.
    pub fn set_offline(&self, offline: bool) {
        self.inner.lock().unwrap().offline = offline;
    }

    /// Delay each send before responding (for in-flight race tests).
    pub fn set_send_delay(&self, delay: Duration) {
        self.inner.lock().unwrap().send_delay = Some(delay);
    }

    /// Queue the result of the next `send_message` call.
    pub fn queue_send_result(&self, result: Result<SendAck, TransportError>) {
        self.inner.lock().unwrap().send_results.push_back(result);
    }

    /// Queue the result of the next `delete_message` call.
    pub fn queue_delete_result(&self, result: Result<(), TransportError>) {
        self.inner.lock().unwrap().delete_results.push_back(result);
    }

    /// Queue the result of the next `mark_read` call.
    pub fn queue_read_result(&self, result: Result<(), TransportError>) {
        self.inner.lock().unwrap().read_results.push_back(result);
    }

    /// Queue the result of the next `recall_message` call.
    pub fn queue_recall_result(&self, result: Result<(), TransportError>) {
        self.inner.lock().unwrap().recall_results.push_back(result);
    }

    /// Queue a frame for the push stream.
    pub fn queue_event(&self, event: ServerEvent) {
        self.inner.lock().unwrap().events.push_back(event);
    }

    /// Make the push stream terminate with `error` once its queue drains.
    pub fn close_event_stream(&self, error: TransportError) {
        self.inner.lock().unwrap().event_stream_error = Some(error);
    }

    /// All drafts submitted via `send_message`, in call order.
    pub fn sent_drafts(&self) -> Vec<MessageDraft> {
        self.inner.lock().unwrap().sent_drafts.clone()
    }

    /// All server identifiers passed to `delete_message`.
    pub fn deleted(&self) -> Vec<ServerId> {
        self.inner.lock().unwrap().deleted.clone()
    }

    /// All targets passed to `mark_read`.
    pub fn read_marks(&self) -> Vec<ReadTarget> {
        self.inner.lock().unwrap().read_marks.clone()
    }

    /// All server identifiers passed to `recall_message`.
    pub fn recalled(&self) -> Vec<ServerId> {
        self.inner.lock().unwrap().recalled.clone()
    }

    /// Total number of requests made (send, delete, read, recall).
    pub fn request_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.sent_drafts.len() + inner.deleted.len() + inner.read_marks.len() + inner.recalled.len()
    }
}

impl Clone for MockGateway {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn offline_err() -> TransportError {
    TransportError::Network("offline".to_string())
}

#[async_trait]
impl Gateway for MockGateway {
    async fn send_message(&self, draft: &MessageDraft) -> Result<SendAck, TransportError> {
        let delay = self.inner.lock().unwrap().send_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.inner.lock().unwrap();
        inner.sent_drafts.push(draft.clone());

        if inner.offline {
            return Err(offline_err());
        }
        if let Some(result) = inner.send_results.pop_front() {
            return result;
        }

        inner.next_server_seq += 1;
        Ok(SendAck {
            server_id: ServerId::new(format!("srv-{}", inner.next_server_seq)),
            temp_id: draft.temp_id,
            created_at: draft.created_at,
        })
    }

    async fn delete_message(&self, server_id: &ServerId) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.deleted.push(server_id.clone());

        if inner.offline {
            return Err(offline_err());
        }
        inner.delete_results.pop_front().unwrap_or(Ok(()))
    }

    async fn mark_read(&self, target: &ReadTarget) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.read_marks.push(target.clone());

        if inner.offline {
            return Err(offline_err());
        }
        inner.read_results.pop_front().unwrap_or(Ok(()))
    }

    async fn recall_message(&self, server_id: &ServerId) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.recalled.push(server_id.clone());

        if inner.offline {
            return Err(offline_err());
        }
        inner.recall_results.pop_front().unwrap_or(Ok(()))
    }

    async fn next_event(&self) -> Result<ServerEvent, TransportError> {
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(event) = inner.events.pop_front() {
                    return Ok(event);
                }
                if let Some(error) = inner.event_stream_error.take() {
                    return Err(error);
                }
            }
            // Queue is empty: poll until a test queues more or closes it.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
