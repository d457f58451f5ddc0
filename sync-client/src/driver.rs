//! Background tasks: the retry driver and the push-event loop.
//!
//! Both are plain tokio tasks parameterised over a shared
//! [`SyncCoordinator`] clone and stopped through a `watch` channel, so an
//! application can run them for the lifetime of a session and flip the
//! shutdown flag on logout.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::coordinator::SyncCoordinator;
use crate::events::SyncEvent;
use crate::gateway::Gateway;

/// How long the event loop waits before re-polling after a transient
/// stream error.
const STREAM_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Spawn the retry driver.
///
/// Every `interval` it runs one [`process_due`](SyncCoordinator::process_due)
/// pass at the coordinator's current clock reading. Storage errors are
/// logged and the loop keeps going; the task exits when `shutdown` flips to
/// `true`.
pub fn spawn_retry_driver<G: Gateway + 'static>(
    coordinator: SyncCoordinator<G>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = coordinator.now_millis();
                    if let Err(error) = coordinator.process_due(now).await {
                        tracing::warn!(%error, "retry pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::debug!("retry driver stopping");
                        break;
                    }
                }
            }
        }
    })
}

/// Spawn the push-event loop.
///
/// Pulls frames from the gateway stream and applies each through
/// [`apply_event`](SyncCoordinator::apply_event). A retryable stream error
/// pauses briefly and re-polls; a terminal error emits
/// [`SyncEvent::EventStreamLost`] and ends the task. The task also exits
/// when `shutdown` flips to `true`.
pub fn spawn_event_loop<G: Gateway + 'static>(
    coordinator: SyncCoordinator<G>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                next = coordinator.next_gateway_event() => {
                    match next {
                        Ok(event) => {
                            if let Err(error) = coordinator.apply_event(event).await {
                                tracing::warn!(%error, "failed to apply push event");
                            }
                        }
                        Err(error) if error.is_retryable() => {
                            tracing::debug!(%error, "push stream hiccup; re-polling");
                            tokio::time::sleep(STREAM_RETRY_DELAY).await;
                        }
                        Err(error) => {
                            tracing::warn!(%error, "push stream lost");
                            coordinator.emit(SyncEvent::EventStreamLost {
                                error: error.to_string(),
                            });
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::debug!("event loop stopping");
                        break;
                    }
                }
            }
        }
    })
}
