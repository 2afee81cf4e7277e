//! Subscriber registry and non-blocking fan-out.
//!
//! Delivery never blocks the room actor: each subscriber gets a bounded
//! channel and a full buffer drops the event for that subscriber only. The
//! client reconciles by resubscribing with its last seen seq.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::engine::{EventRecord, GameState};
use crate::projection::{project_event, Viewer};

struct Subscriber {
    viewer: Viewer,
    tx: mpsc::Sender<EventRecord>,
}

/// One live subscription. Dropping the receiver ends delivery; the session
/// should still call `unsubscribe` on teardown to free the slot eagerly.
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<EventRecord>,
}

/// The set of sessions watching one room.
#[derive(Default)]
pub struct SubscriberSet {
    inner: Mutex<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
}

impl SubscriberSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, viewer: Viewer, capacity: usize) -> Subscription {
        let (tx, rx) = mpsc::channel(capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .lock()
            .expect("subscriber lock")
            .insert(id, Subscriber { viewer, tx });
        Subscription { id, rx }
    }

    pub fn remove(&self, id: u64) {
        self.inner.lock().expect("subscriber lock").remove(&id);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("subscriber lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Project and deliver a batch to every subscriber. Dead channels are
    /// pruned; full ones drop the event and keep the subscription.
    pub fn broadcast(&self, events: &[EventRecord], post_state: &GameState) {
        let mut subscribers = self.inner.lock().expect("subscriber lock");
        let mut dead: Vec<u64> = Vec::new();
        for (id, subscriber) in subscribers.iter() {
            for event in events {
                let Some(visible) = project_event(event, post_state, &subscriber.viewer) else {
                    continue;
                };
                match subscriber.tx.try_send(visible) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(
                            subscriber = id,
                            seq = event.seq,
                            "subscriber buffer full, dropping event"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        dead.push(*id);
                        break;
                    }
                }
            }
        }
        for id in dead {
            debug!(subscriber = id, "pruning closed subscriber");
            subscribers.remove(&id);
        }
    }
}
