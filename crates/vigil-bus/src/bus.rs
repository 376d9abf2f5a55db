//! The event bus
//!
//! `publish` is synchronous and never waits on subscribers: it appends the
//! event to the bounded history and sends it on each matching subscriber's
//! own broadcast channel. Each subscriber has its own delivery task, so a
//! slow handler only ever delays itself.
//!
//! A subscriber that falls `subscriber_queue` events behind loses the
//! oldest ones; the delivery task sees `Lagged(n)` and counts the drop.
//! Publishers are never blocked.

use crate::event::{Event, EventFilter};
use dashmap::DashMap;
use futures::FutureExt;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vigil_core::BusSection;

// ---------------------------------------------------------------------------
// Handler trait
// ---------------------------------------------------------------------------

/// Implement this to receive events.
///
/// Delivery is at-least-once per live subscriber, so handlers must tolerate
/// seeing an event more than once.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str {
        "handler"
    }

    async fn handle(&self, event: &Event);
}

/// Adapter so plain closures can subscribe.
struct FnHandler<F> {
    name: String,
    f: F,
}

#[async_trait::async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&Event) + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &Event) {
        (self.f)(event)
    }
}

// ---------------------------------------------------------------------------
// Config, stats, handles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Per-subscriber backlog; the channel rounds it up to a power of two.
    pub subscriber_queue: usize,
    pub history_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self::from(&BusSection::default())
    }
}

impl From<&BusSection> for BusConfig {
    fn from(section: &BusSection) -> Self {
        Self {
            subscriber_queue: section.subscriber_queue.max(1),
            history_capacity: section.history_capacity.max(1),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub handler_panics: u64,
    pub subscribers: usize,
    pub history_len: usize,
}

/// Returned by `subscribe`; pass to `unsubscribe` to cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    handler_panics: AtomicU64,
    /// Signalled whenever a delivery task finishes with an event.
    progress: Notify,
}

struct Subscriber {
    name: String,
    filter: EventFilter,
    tx: broadcast::Sender<Event>,
    /// Events sent but not yet handled or dropped.
    pending: AtomicU64,
    cancel: CancellationToken,
}

impl Subscriber {
    fn send(&self, event: Event) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(event).is_err() {
            // Receiver already gone: the delivery task has stopped.
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn settle(&self, n: u64) {
        self.pending.fetch_sub(n, Ordering::AcqRel);
    }

    fn is_idle(&self) -> bool {
        self.pending.load(Ordering::Acquire) == 0
    }
}

struct BusInner {
    config: BusConfig,
    subscribers: DashMap<u64, Arc<Subscriber>>,
    next_id: AtomicU64,
    history: Mutex<VecDeque<Event>>,
    counters: Arc<Counters>,
    shutdown: CancellationToken,
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Cheap to clone; clones share subscribers, history and counters.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                history: Mutex::new(VecDeque::with_capacity(config.history_capacity.min(1_024))),
                config,
                subscribers: DashMap::new(),
                next_id: AtomicU64::new(1),
                counters: Arc::new(Counters::default()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Publish an event. Never blocks on subscribers.
    pub fn publish(&self, event: Event) {
        let inner = &self.inner;
        inner.counters.published.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Publishing {} event {} from {}",
            event.kind().as_str(),
            event.id,
            event.publisher
        );

        for entry in inner.subscribers.iter() {
            let subscriber = entry.value();
            if subscriber.filter.matches(&event) && !subscriber.cancel.is_cancelled() {
                subscriber.send(event.clone());
            }
        }

        let mut history = self.lock_history();
        if history.len() >= inner.config.history_capacity {
            history.pop_front();
        }
        history.push_back(event);
    }

    /// Register a handler for events matching `filter`.
    ///
    /// # Panics
    ///
    /// Spawns the delivery task on the current tokio runtime, so this panics
    /// when called outside one.
    pub fn subscribe(
        &self,
        filter: impl Into<EventFilter>,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = broadcast::channel(self.inner.config.subscriber_queue);
        let subscriber = Arc::new(Subscriber {
            name: handler.name().to_string(),
            filter: filter.into(),
            tx,
            pending: AtomicU64::new(0),
            cancel: self.inner.shutdown.child_token(),
        });
        self.inner.subscribers.insert(id, subscriber.clone());
        info!("Subscriber '{}' registered (id {})", subscriber.name, id);

        let counters = self.inner.counters.clone();
        tokio::spawn(deliver(subscriber, rx, handler, counters));
        SubscriptionHandle { id }
    }

    /// Register a plain closure.
    pub fn subscribe_fn<F>(
        &self,
        name: impl Into<String>,
        filter: impl Into<EventFilter>,
        f: F,
    ) -> SubscriptionHandle
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribe(
            filter,
            Arc::new(FnHandler {
                name: name.into(),
                f,
            }),
        )
    }

    /// Cancel a subscription. Undelivered events for it are discarded.
    /// Returns false if the handle was already cancelled.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        match self.inner.subscribers.remove(&handle.id) {
            Some((_, subscriber)) => {
                subscriber.cancel.cancel();
                info!("Subscriber '{}' removed (id {})", subscriber.name, handle.id);
                true
            }
            None => false,
        }
    }

    /// Retained events, oldest first.
    pub fn history(&self) -> Vec<Event> {
        self.lock_history().iter().cloned().collect()
    }

    /// Retained events matching `filter`, oldest first.
    pub fn replay(&self, filter: &EventFilter) -> Vec<Event> {
        self.lock_history()
            .iter()
            .filter(|event| filter.matches(event))
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> BusStats {
        let counters = &self.inner.counters;
        BusStats {
            published: counters.published.load(Ordering::Relaxed),
            delivered: counters.delivered.load(Ordering::Relaxed),
            dropped: counters.dropped.load(Ordering::Relaxed),
            handler_panics: counters.handler_panics.load(Ordering::Relaxed),
            subscribers: self.inner.subscribers.len(),
            history_len: self.lock_history().len(),
        }
    }

    /// Wait until every live subscriber has handled (or dropped) everything
    /// sent to it, or `timeout` passes. Returns whether the bus went idle.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let progressed = self.inner.counters.progress.notified();
            if self.is_idle() {
                return true;
            }
            if tokio::time::timeout_at(deadline, progressed).await.is_err() {
                return self.is_idle();
            }
        }
    }

    fn is_idle(&self) -> bool {
        self.inner
            .subscribers
            .iter()
            .all(|entry| entry.value().is_idle())
    }

    /// Stop every delivery task. Publishing still records history.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.subscribers.clear();
        info!("Event bus shut down");
    }

    fn lock_history(&self) -> MutexGuard<'_, VecDeque<Event>> {
        self.inner
            .history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Delivery loop for one subscriber.
async fn deliver(
    subscriber: Arc<Subscriber>,
    mut rx: broadcast::Receiver<Event>,
    handler: Arc<dyn EventHandler>,
    counters: Arc<Counters>,
) {
    loop {
        let event = tokio::select! {
            _ = subscriber.cancel.cancelled() => break,
            received = rx.recv() => match received {
                Ok(event) => event,
                Err(RecvError::Lagged(n)) => {
                    counters.dropped.fetch_add(n, Ordering::Relaxed);
                    subscriber.settle(n);
                    counters.progress.notify_waiters();
                    warn!("Subscriber '{}' lagged, dropped {} events", subscriber.name, n);
                    continue;
                }
                Err(RecvError::Closed) => break,
            },
        };

        let outcome = AssertUnwindSafe(handler.handle(&event)).catch_unwind().await;
        match outcome {
            Ok(()) => {
                counters.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                counters.handler_panics.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Subscriber '{}' panicked handling {} event {}",
                    subscriber.name,
                    event.kind().as_str(),
                    event.id
                );
            }
        }
        subscriber.settle(1);
        counters.progress.notify_waiters();
    }
    debug!("Delivery task for '{}' stopped", subscriber.name);
}
