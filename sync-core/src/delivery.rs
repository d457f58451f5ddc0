//! Delivery state machine - NO I/O, just status transitions.
//!
//! Two classes of transition exist:
//!
//! - **Local** transitions (`mark_sent`, `mark_failed`, `begin_retry`) are
//!   driven by the coordinator's own send path. An illegal local transition
//!   is a programming error and returns [`TransitionError`].
//! - **Remote** transitions ([`apply_remote`]) are driven by server events,
//!   which arrive at-least-once and possibly out of order. A regression is a
//!   no-op, never an error - status only moves forward.

use chat_sync_types::{DeliveryStatus, RemoteStatus};
use thiserror::Error;

/// An illegal local status transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal transition: {from} -> {to}")]
pub struct TransitionError {
    /// Status before the attempted transition.
    pub from: DeliveryStatus,
    /// Status the caller attempted to reach.
    pub to: DeliveryStatus,
}

fn remote_rank(status: DeliveryStatus) -> Option<u8> {
    match status {
        DeliveryStatus::Sent => Some(1),
        DeliveryStatus::Delivered => Some(2),
        DeliveryStatus::Read => Some(3),
        // Local-only and terminal states have no remote rank.
        DeliveryStatus::Sending | DeliveryStatus::Failed | DeliveryStatus::Recalled => None,
    }
}

fn incoming_rank(remote: RemoteStatus) -> (DeliveryStatus, u8) {
    match remote {
        RemoteStatus::Sent => (DeliveryStatus::Sent, 1),
        RemoteStatus::Delivered => (DeliveryStatus::Delivered, 2),
        RemoteStatus::Read => (DeliveryStatus::Read, 3),
    }
}

/// Apply a remote status event to the current status.
///
/// Returns `Some(advanced)` when the event moves status forward, `None` when
/// it is a no-op. Remote state is authoritative once received: a `Read` event
/// arriving while the message is still `Sending` or `Failed` advances it
/// directly (read implies delivered). Nothing leaves `Recalled`, and a
/// `Delivered` event after `Read` is ignored rather than rejected.
pub fn apply_remote(current: DeliveryStatus, incoming: RemoteStatus) -> Option<DeliveryStatus> {
    if current == DeliveryStatus::Recalled {
        return None;
    }
    let (next, next_rank) = incoming_rank(incoming);
    match remote_rank(current) {
        // Optimistic local placeholder: the server's word wins outright.
        None => Some(next),
        Some(current_rank) => (next_rank > current_rank).then_some(next),
    }
}

/// Transition after a successful transport acknowledgment.
pub fn mark_sent(current: DeliveryStatus) -> Result<DeliveryStatus, TransitionError> {
    match current {
        DeliveryStatus::Sending => Ok(DeliveryStatus::Sent),
        // The ack can race a faster push event; keep the further status.
        DeliveryStatus::Sent | DeliveryStatus::Delivered | DeliveryStatus::Read => Ok(current),
        from => Err(TransitionError {
            from,
            to: DeliveryStatus::Sent,
        }),
    }
}

/// Transition after a failed transport attempt.
pub fn mark_failed(current: DeliveryStatus) -> Result<DeliveryStatus, TransitionError> {
    match current {
        DeliveryStatus::Sending | DeliveryStatus::Failed => Ok(DeliveryStatus::Failed),
        from => Err(TransitionError {
            from,
            to: DeliveryStatus::Failed,
        }),
    }
}

/// Transition when a manual or scheduled retry re-dispatches the message.
pub fn begin_retry(current: DeliveryStatus) -> Result<DeliveryStatus, TransitionError> {
    match current {
        DeliveryStatus::Failed | DeliveryStatus::Sending => Ok(DeliveryStatus::Sending),
        from => Err(TransitionError {
            from,
            to: DeliveryStatus::Sending,
        }),
    }
}
