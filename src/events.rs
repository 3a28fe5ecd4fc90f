//! Passenger event notification.
//!
//! Accepted crossings are published in-cycle, after the ledger has applied them, to
//! two kinds of subscriber:
//! - callbacks, invoked synchronously on the processing thread
//! - bounded `crossbeam_channel` receivers, fed with `try_send` so a slow reader can
//!   never stall the processing loop
//!
//! Each subscriber is isolated: an error or panic in one is logged and does not
//! prevent delivery to the others.

use anyhow::Result;
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::{BoundingBox, CrossingKind, IdentityId, TrackId};

/// One accepted passenger crossing, as seen by subscribers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PassengerEvent {
    pub kind: CrossingKind,
    pub timestamp: DateTime<Utc>,
    pub track: TrackId,
    /// Matched identity; `None` for unvalidated events.
    pub identity: Option<IdentityId>,
    pub validated: bool,
    pub bbox: BoundingBox,
    pub confidence: f32,
    /// Authoritative count after this event was applied.
    pub passenger_count: u32,
    /// Id of the ledger event recording this crossing.
    pub trip_event_id: String,
}

pub type EventCallback = Box<dyn Fn(&PassengerEvent) -> Result<()> + Send>;

enum Subscriber {
    Callback(EventCallback),
    Channel(Sender<PassengerEvent>),
}

#[derive(Default)]
pub struct EventBus {
    subscribers: Vec<Subscriber>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_callback<F>(&mut self, callback: F)
    where
        F: Fn(&PassengerEvent) -> Result<()> + Send + 'static,
    {
        self.subscribers.push(Subscriber::Callback(Box::new(callback)));
    }

    /// Typed channel subscription. Events are dropped for this subscriber while its
    /// buffer is full; a dropped receiver unsubscribes.
    pub fn subscribe(&mut self, capacity: usize) -> Receiver<PassengerEvent> {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        self.subscribers.push(Subscriber::Channel(tx));
        rx
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Deliver to every subscriber. Returns the number of failed deliveries.
    pub fn dispatch(&mut self, event: &PassengerEvent) -> usize {
        let mut failures = 0;
        self.subscribers.retain(|subscriber| match subscriber {
            Subscriber::Callback(callback) => {
                match catch_unwind(AssertUnwindSafe(|| callback(event))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        failures += 1;
                        log::error!("event callback failed for {} event: {}", event.kind, e);
                    }
                    Err(_) => {
                        failures += 1;
                        log::error!("event callback panicked on {} event", event.kind);
                    }
                }
                true
            }
            Subscriber::Channel(tx) => match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    failures += 1;
                    log::warn!("event subscriber is full; dropping {} event", event.kind);
                    true
                }
                Err(TrySendError::Disconnected(_)) => {
                    log::info!("event subscriber disconnected; removing");
                    false
                }
            },
        });
        failures
    }
}
