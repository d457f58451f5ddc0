//! # sync-client
//!
//! The offline-first sync coordinator for chat-sync.
//!
//! This crate ties the pure logic in `chat-sync-core` to the persistence in
//! `chat-sync-store` and a pluggable [`Gateway`] transport:
//!
//! - **Optimistic sends**: a message is durable and visible locally before
//!   the first network attempt, and survives crashes and connectivity loss
//!   as a queued operation.
//! - **Retry driver**: queued operations replay with exponential backoff,
//!   FIFO per conversation, conversations in parallel.
//! - **Push reconciliation**: server events merge into local state
//!   idempotently, so at-least-once delivery never duplicates a message.
//! - **Recall/edit policy**: checked locally before any network call.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use chat_sync_client::{SyncConfig, SyncCoordinator, MockGateway};
//! use chat_sync_store::SqliteStore;
//! use chat_sync_types::{ConversationId, MessageKind, MessagePayload, UserId};
//!
//! # async fn run() -> chat_sync_client::Result<()> {
//! let store = Arc::new(SqliteStore::open("chat.db").await?);
//! let coordinator = SyncCoordinator::new(
//!     UserId::from("alice"),
//!     store,
//!     MockGateway::new(),
//!     SyncConfig::default(),
//! );
//!
//! let msg = coordinator
//!     .send(ConversationId::new(), MessageKind::Text, MessagePayload::text("hi"))
//!     .await?;
//! println!("sent: {} ({:?})", msg.local_id, msg.status);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod clock;
mod config;
mod coordinator;
mod driver;
mod error;
mod events;
mod gateway;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SyncConfig;
pub use coordinator::SyncCoordinator;
pub use driver::{spawn_event_loop, spawn_retry_driver};
pub use error::{Result, SyncError};
pub use events::SyncEvent;
pub use gateway::{Gateway, MockGateway, TransportError};
