//! One-second liveness ticks.
//!
//! [`TickScheduler`] owns a periodic task that bumps a counter and calls
//! every subscriber with a [`Tick`]. It reads device status through a
//! [`StatusSource`], which must only look at cached state: the scheduler never
//! touches the command bridge, so a stuck exchange cannot delay a tick.

use parking_lot::Mutex;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::shutdown::{cancelled, ShutdownBarrier};

/// What subscribers receive on every firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    /// Starts at 1 and increases by one per firing.
    pub count: u64,
    /// Link state at the time of the tick.
    pub is_open: bool,
    /// Master trigger state from the last fetched protocol.
    pub master_on: bool,
}

impl Tick {
    /// Server-sent event payload for the browser front end.
    pub fn to_event_json(&self) -> serde_json::Value {
        json!({ "state": { "tick": self.count, "state": self.is_open } })
    }
}

/// Cached device status as seen by the scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStatus {
    /// Whether the serial link is open
    pub is_open: bool,
    /// Cached system run state
    pub master_on: bool,
}

/// Cheap, non-blocking read of cached status.
pub type StatusSource = Arc<dyn Fn() -> DeviceStatus + Send + Sync>;

type Callback = Arc<dyn Fn(Tick) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    callbacks: BTreeMap<u64, Callback>,
}

/// Registration handle. Dropping it unsubscribes.
#[must_use = "dropping the subscription unregisters the callback"]
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Subscribers>>,
}

impl Subscription {
    /// Registry key of this subscription.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().callbacks.remove(&self.id);
            debug!(id = self.id, "Tick subscriber removed");
        }
    }
}

/// Owns the tick timer task and its subscribers.
pub struct TickScheduler {
    subscribers: Arc<Mutex<Subscribers>>,
    counter: Arc<AtomicU64>,
    barrier: tokio::sync::Mutex<ShutdownBarrier>,
    period: Duration,
}

impl TickScheduler {
    /// Spawn the timer. The first tick fires one `period` from now.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn start(period: Duration, status_source: StatusSource) -> Self {
        let subscribers: Arc<Mutex<Subscribers>> = Arc::default();
        let counter = Arc::new(AtomicU64::new(0));

        let mut barrier = ShutdownBarrier::new("tick");
        let mut stop = barrier.subscribe();
        let subs = subscribers.clone();
        let count = counter.clone();

        barrier.track(tokio::spawn(async move {
            let mut timer = interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancelled(&mut stop) => break,
                    _ = timer.tick() => {
                        let status = status_source();
                        let tick = Tick {
                            count: count.fetch_add(1, Ordering::SeqCst) + 1,
                            is_open: status.is_open,
                            master_on: status.master_on,
                        };
                        // Callbacks run outside the registry lock so they may unsubscribe.
                        let callbacks: Vec<Callback> =
                            subs.lock().callbacks.values().cloned().collect();
                        for callback in callbacks {
                            callback(tick);
                        }
                    }
                }
            }
            debug!("Tick timer stopped");
        }));

        Self {
            subscribers,
            counter,
            barrier: tokio::sync::Mutex::new(barrier),
            period,
        }
    }

    /// Registers `callback` for every following tick.
    pub fn subscribe(&self, callback: impl Fn(Tick) + Send + Sync + 'static) -> Subscription {
        let mut subs = self.subscribers.lock();
        let id = subs.next_id;
        subs.next_id += 1;
        subs.callbacks.insert(id, Arc::new(callback));
        Subscription {
            id,
            registry: Arc::downgrade(&self.subscribers),
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().callbacks.len()
    }

    /// Number of firings so far.
    pub fn ticks(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    /// Configured tick period.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Cancel the timer and wait for its task.
    pub async fn stop(&self, grace: Duration) {
        self.barrier.lock().await.shutdown(grace).await;
        info!(ticks = self.ticks(), "Tick scheduler stopped");
    }
}
