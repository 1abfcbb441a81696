//! Activity bus: per-run event buffers with replay and live subscription.
//!
//! Each run id owns a bounded buffer of [`ActivityEvent`]s plus the set of
//! callbacks currently listening to it. Appends are synchronous: the event
//! is buffered and handed to every subscriber before `append` returns, in
//! append order, under the run's lock. Subscribers must therefore not block
//! and must not call back into the bus for the same run. Dropping or
//! unsubscribing a [`Subscription`] from inside a callback is allowed: the
//! entry is marked dead at once and removed when the append finishes.
//!
//! A failing subscriber never affects the producer or its siblings. A
//! callback that reports [`ActivityBusError::Disconnected`] or panics is
//! dropped from the run.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::types::ActivityEvent;

/// Error type reported by subscriber callbacks
#[derive(Debug, thiserror::Error)]
pub enum ActivityBusError {
    #[error("Subscriber disconnected")]
    Disconnected,

    #[error("Subscriber failed: {0}")]
    Callback(String),
}

/// Result type for subscriber callbacks
pub type ActivityBusResult<T> = Result<T, ActivityBusError>;

/// Shared reference to ActivityBus
pub type SharedActivityBus = Arc<ActivityBus>;

type Callback = Box<dyn Fn(&ActivityEvent) -> ActivityBusResult<()> + Send + Sync>;

/// Buffer limits for the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivityBusConfig {
    /// Events kept per run; the oldest are dropped past this.
    pub max_events_per_run: usize,
    /// Idle time after which a run with no subscribers may be evicted.
    pub idle_ttl_secs: u64,
}

impl ActivityBusConfig {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }
}

impl Default for ActivityBusConfig {
    fn default() -> Self {
        Self {
            max_events_per_run: 500,
            idle_ttl_secs: 30 * 60,
        }
    }
}

struct Subscriber {
    callback: Callback,
    live: Arc<AtomicBool>,
}

impl Subscriber {
    fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }
}

struct RunLog {
    events: VecDeque<ActivityEvent>,
    subscribers: HashMap<u64, Subscriber>,
    last_access: Instant,
}

impl RunLog {
    fn new() -> Self {
        Self {
            events: VecDeque::new(),
            subscribers: HashMap::new(),
            last_access: Instant::now(),
        }
    }

    fn touch(&mut self) {
        self.last_access = Instant::now();
    }

    /// Drop entries whose subscription was released while the lock was held.
    fn prune(&mut self) {
        self.subscribers.retain(|_, sub| sub.is_live());
    }
}

type SharedRunLog = Arc<Mutex<RunLog>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Disposer returned by [`ActivityBus::subscribe`]. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    target: Option<SubscriptionTarget>,
}

struct SubscriptionTarget {
    log: Weak<Mutex<RunLog>>,
    id: u64,
    live: Arc<AtomicBool>,
}

impl Subscription {
    fn inert() -> Self {
        Self { target: None }
    }

    /// Whether this subscription is still registered with a run.
    pub fn is_active(&self) -> bool {
        let Some(target) = self.target.as_ref() else {
            return false;
        };
        if !target.live.load(Ordering::Acquire) {
            return false;
        }
        match target.log.upgrade() {
            Some(log) => {
                let active = lock(&log).subscribers.contains_key(&target.id);
                active
            }
            None => false,
        }
    }

    /// Stop delivery now. Idempotent.
    ///
    /// If the run's lock is busy (an append in progress, possibly the one
    /// running this subscriber's own callback) the entry is only marked dead
    /// and the lock holder removes it.
    pub fn unsubscribe(&mut self) {
        let Some(target) = self.target.take() else {
            return;
        };
        target.live.store(false, Ordering::Release);
        let Some(log) = target.log.upgrade() else {
            return;
        };
        let mut guard = match log.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return,
        };
        guard.subscribers.remove(&target.id);
        guard.touch();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.target.as_ref().map(|t| t.id))
            .finish()
    }
}

/// In-memory registry of run logs, keyed by run id.
pub struct ActivityBus {
    config: ActivityBusConfig,
    runs: Mutex<HashMap<String, SharedRunLog>>,
    next_subscriber: AtomicU64,
}

impl ActivityBus {
    /// Create a bus with default limits
    pub fn new() -> Self {
        Self::with_config(ActivityBusConfig::default())
    }

    pub fn with_config(config: ActivityBusConfig) -> Self {
        Self {
            config,
            runs: Mutex::new(HashMap::new()),
            next_subscriber: AtomicU64::new(1),
        }
    }

    /// Create a shared reference to this bus
    pub fn shared(self) -> SharedActivityBus {
        Arc::new(self)
    }

    pub fn config(&self) -> &ActivityBusConfig {
        &self.config
    }

    fn log_for(&self, run_id: &str, create: bool) -> Option<SharedRunLog> {
        let mut runs = lock(&self.runs);
        match runs.get(run_id) {
            Some(log) => Some(Arc::clone(log)),
            None if create => {
                let log = Arc::new(Mutex::new(RunLog::new()));
                runs.insert(run_id.to_string(), Arc::clone(&log));
                Some(log)
            }
            None => None,
        }
    }

    /// Buffer `event` for `run_id` and deliver it to current subscribers.
    pub fn append(&self, run_id: &str, event: ActivityEvent) {
        if run_id.is_empty() {
            return;
        }
        let Some(log) = self.log_for(run_id, true) else {
            return;
        };
        let mut log = lock(&log);

        log.events.push_back(event);
        while log.events.len() > self.config.max_events_per_run.max(1) {
            log.events.pop_front();
        }
        log.touch();

        let Some(event) = log.events.back().cloned() else {
            return;
        };
        let mut dropped = Vec::new();
        for (id, sub) in log.subscribers.iter() {
            if !sub.is_live() {
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| (sub.callback)(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(ActivityBusError::Disconnected)) => dropped.push(*id),
                Ok(Err(err)) => debug!(run_id, subscriber = id, error = %err, "subscriber failed"),
                Err(_) => {
                    warn!(run_id, subscriber = id, "subscriber panicked, removing");
                    dropped.push(*id);
                }
            }
        }
        for id in dropped {
            log.subscribers.remove(&id);
        }
        log.prune();
    }

    /// All buffered events for `run_id`, oldest first.
    pub fn snapshot(&self, run_id: &str) -> Vec<ActivityEvent> {
        if run_id.is_empty() {
            return Vec::new();
        }
        match self.log_for(run_id, false) {
            Some(log) => {
                let mut log = lock(&log);
                log.touch();
                let events = log.events.iter().cloned().collect();
                events
            }
            None => Vec::new(),
        }
    }

    /// Register `callback` for every later append to `run_id`.
    pub fn subscribe<F>(&self, run_id: &str, callback: F) -> Subscription
    where
        F: Fn(&ActivityEvent) -> ActivityBusResult<()> + Send + Sync + 'static,
    {
        self.register(run_id, Box::new(callback), false).1
    }

    /// Snapshot and subscribe under one lock, so no event is both replayed
    /// and delivered live.
    pub fn subscribe_with_snapshot<F>(&self, run_id: &str, callback: F) -> (Vec<ActivityEvent>, Subscription)
    where
        F: Fn(&ActivityEvent) -> ActivityBusResult<()> + Send + Sync + 'static,
    {
        self.register(run_id, Box::new(callback), true)
    }

    /// Subscribe through an unbounded channel. The subscription is pruned
    /// on the next append once the receiver is dropped.
    pub fn subscribe_channel(
        &self,
        run_id: &str,
    ) -> (Subscription, mpsc::UnboundedReceiver<ActivityEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(run_id, channel_sink(tx));
        (subscription, rx)
    }

    fn register(&self, run_id: &str, callback: Callback, with_snapshot: bool) -> (Vec<ActivityEvent>, Subscription) {
        if run_id.is_empty() {
            return (Vec::new(), Subscription::inert());
        }
        let Some(log) = self.log_for(run_id, true) else {
            return (Vec::new(), Subscription::inert());
        };
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let live = Arc::new(AtomicBool::new(true));
        let snapshot = {
            let mut guard = lock(&log);
            guard.subscribers.insert(
                id,
                Subscriber {
                    callback,
                    live: Arc::clone(&live),
                },
            );
            guard.touch();
            if with_snapshot {
                guard.events.iter().cloned().collect()
            } else {
                Vec::new()
            }
        };
        debug!(run_id, subscriber = id, "subscribed");
        (
            snapshot,
            Subscription {
                target: Some(SubscriptionTarget {
                    log: Arc::downgrade(&log),
                    id,
                    live,
                }),
            },
        )
    }

    /// Evict runs with no subscribers that have been idle past the TTL.
    /// Returns the number of runs removed.
    pub fn cleanup_expired(&self) -> usize {
        let ttl = self.config.idle_ttl();
        let now = Instant::now();
        let mut runs = lock(&self.runs);
        let before = runs.len();
        runs.retain(|_, log| {
            // Held elsewhere means an append or snapshot is in flight.
            if Arc::strong_count(log) > 1 {
                return true;
            }
            let mut log = lock(log);
            log.prune();
            !(log.subscribers.is_empty() && now.saturating_duration_since(log.last_access) > ttl)
        });
        let removed = before - runs.len();
        if removed > 0 {
            debug!(removed, remaining = runs.len(), "evicted idle runs");
        }
        removed
    }

    /// Drop every run and subscriber. Channel subscribers see their stream end.
    pub fn shutdown(&self) {
        let drained: Vec<SharedRunLog> = lock(&self.runs).drain().map(|(_, log)| log).collect();
        let count = drained.len();
        for log in drained {
            lock(&log).subscribers.clear();
        }
        info!(runs = count, "activity bus shut down");
    }

    pub fn run_count(&self) -> usize {
        lock(&self.runs).len()
    }

    pub fn subscriber_count(&self, run_id: &str) -> usize {
        match self.log_for(run_id, false) {
            Some(log) => {
                let count = lock(&log).subscribers.values().filter(|s| s.is_live()).count();
                count
            }
            None => 0,
        }
    }
}

impl Default for ActivityBus {
    fn default() -> Self {
        Self::new()
    }
}

fn channel_sink(
    tx: mpsc::UnboundedSender<ActivityEvent>,
) -> impl Fn(&ActivityEvent) -> ActivityBusResult<()> + Send + Sync + 'static {
    move |event| {
        tx.send(event.clone())
            .map_err(|_| ActivityBusError::Disconnected)
    }
}

/// Channel variant of [`ActivityBus::subscribe_with_snapshot`].
pub fn subscribe_channel_with_snapshot(
    bus: &ActivityBus,
    run_id: &str,
) -> (Vec<ActivityEvent>, Subscription, mpsc::UnboundedReceiver<ActivityEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (snapshot, subscription) = bus.subscribe_with_snapshot(run_id, channel_sink(tx));
    (snapshot, subscription, rx)
}
