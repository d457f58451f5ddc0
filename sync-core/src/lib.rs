//! # sync-core
//!
//! Pure logic for chat-sync (no I/O, instant tests).
//!
//! This crate implements the delivery state machine, the recall/edit policy,
//! the retry backoff schedule, and optimistic-record reconciliation without
//! any network or disk I/O, enabling fast unit tests.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects. This enables:
//! - Instant unit tests (no mocks, no async)
//! - Deterministic behavior (same input → same output)
//! - Easy reasoning about state transitions
//!
//! The actual I/O (network, disk) is performed by `sync-client`, which calls
//! into these functions around its storage and transport boundaries.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod delivery;
pub mod policy;
pub mod reconcile;

pub use backoff::RetrySchedule;
pub use delivery::{apply_remote, begin_retry, mark_failed, mark_sent, TransitionError};
pub use policy::{PolicyViolation, RecallPolicy, DEFAULT_RECALL_WINDOW};
pub use reconcile::{merge_ack, merge_remote, Merged};
