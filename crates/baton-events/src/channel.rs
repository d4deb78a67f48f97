//! Event channel with bounded-concurrency dispatch
//!
//! Publishing never blocks: events are appended to a FIFO queue and at most
//! `max_in_flight` of them dispatch at once, each on its own tokio task.
//! An event is held back while an earlier event with the same
//! (type, source) pair is still dispatching, which keeps per-source order
//! for every subscriber.

use async_trait::async_trait;
use baton_core::config::EventsConfig;
use baton_core::{SharedClock, SharedIds, SystemClock, UuidIds};
use futures::FutureExt;
use std::collections::{HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::event::{Event, EventPayload, EventType, SystemError};
use crate::filter::EventFilter;

/// Component name used on `system.error` events raised by the channel itself
pub const CHANNEL_COMPONENT: &str = "event_channel";

/// Receives events from the channel
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

/// Adapter turning a synchronous closure into an [`EventHandler`]
pub struct FnHandler<F>(F);

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
{
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        (self.0)(event)
    }
}

/// Wrap a closure as a shareable handler
pub fn handler_fn<F>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

/// Snapshot of channel counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStats {
    pub queued: usize,
    pub in_flight: usize,
    pub published: u64,
    pub delivered: u64,
    pub handler_failures: u64,
    pub subscriptions: usize,
}

struct SubscriptionEntry {
    id: u64,
    event_type: Option<EventType>,
    filter: Option<EventFilter>,
    handler: Arc<dyn EventHandler>,
}

impl SubscriptionEntry {
    fn accepts(&self, event: &Event) -> bool {
        self.event_type.map_or(true, |t| t == event.event_type())
            && self.filter.as_ref().map_or(true, |f| f.matches(event))
    }
}

type DispatchKey = (EventType, String);

fn dispatch_key(event: &Event) -> DispatchKey {
    (event.event_type(), event.source.clone())
}

#[derive(Default)]
struct DispatchState {
    queue: VecDeque<Event>,
    in_flight: usize,
    active: HashSet<DispatchKey>,
}

struct Inner {
    max_in_flight: usize,
    clock: SharedClock,
    ids: SharedIds,
    subscriptions: RwLock<Vec<Arc<SubscriptionEntry>>>,
    dispatch: Mutex<DispatchState>,
    idle: Notify,
    next_subscription: AtomicU64,
    published: AtomicU64,
    delivered: AtomicU64,
    failures: AtomicU64,
}

impl Inner {
    fn lock_dispatch(&self) -> MutexGuard<'_, DispatchState> {
        self.dispatch.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_idle(&self) -> bool {
        let state = self.lock_dispatch();
        state.in_flight == 0 && state.queue.is_empty()
    }

    fn publish_payload(self: &Arc<Self>, source: &str, payload: EventPayload) -> String {
        let event = Event::new(self.ids.next_id("evt"), source, self.clock.now(), payload);
        self.enqueue(event)
    }

    fn enqueue(self: &Arc<Self>, event: Event) -> String {
        let event = event.routed();
        let id = event.id.clone();
        debug!(
            event_type = %event.event_type(),
            event_id = %id,
            source = %event.source,
            "Event published"
        );

        self.published.fetch_add(1, Ordering::Relaxed);
        self.lock_dispatch().queue.push_back(event);
        self.pump();
        id
    }

    /// Start as many queued events as free slots and ordering allow
    fn pump(self: &Arc<Self>) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("No tokio runtime available; events stay queued until the next publish");
                return;
            }
        };

        let ready = {
            let mut state = self.lock_dispatch();
            let mut ready = Vec::new();
            let mut idx = 0;
            while state.in_flight < self.max_in_flight && idx < state.queue.len() {
                let key = dispatch_key(&state.queue[idx]);
                if state.active.contains(&key) {
                    idx += 1;
                    continue;
                }
                if let Some(event) = state.queue.remove(idx) {
                    state.active.insert(key);
                    state.in_flight += 1;
                    ready.push(event);
                }
            }
            ready
        };

        for event in ready {
            let inner = Arc::clone(self);
            handle.spawn(async move {
                inner.deliver(&event).await;
                inner.finish(&event);
            });
        }
    }

    fn finish(self: &Arc<Self>, event: &Event) {
        let idle = {
            let mut state = self.lock_dispatch();
            state.in_flight = state.in_flight.saturating_sub(1);
            state.active.remove(&dispatch_key(event));
            state.in_flight == 0 && state.queue.is_empty()
        };

        if idle {
            self.idle.notify_waiters();
        } else {
            self.pump();
        }
    }

    async fn deliver(self: &Arc<Self>, event: &Event) {
        let subscribers: Vec<Arc<SubscriptionEntry>> = self
            .subscriptions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|s| s.accepts(event))
            .cloned()
            .collect();

        for sub in subscribers {
            let outcome = AssertUnwindSafe(sub.handler.handle(event))
                .catch_unwind()
                .await;

            let failure = match outcome {
                Ok(Ok(())) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                Ok(Err(e)) => format!("{:#}", e),
                Err(panic) => panic_message(panic.as_ref()),
            };

            self.failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                event_type = %event.event_type(),
                event_id = %event.id,
                subscription = sub.id,
                error = %failure,
                "Event handler failed"
            );

            // A failing system.error handler must not feed itself
            if event.event_type() != EventType::SystemError {
                let error = SystemError {
                    error: format!(
                        "handler {} failed on {}: {}",
                        sub.id,
                        event.event_type(),
                        failure
                    ),
                    component: CHANNEL_COMPONENT.to_string(),
                    task_id: event.task_id().map(String::from),
                    agent_id: event.agent_id().map(String::from),
                };
                self.publish_payload(CHANNEL_COMPONENT, EventPayload::SystemError(error));
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", s)
    } else {
        "handler panicked".to_string()
    }
}

/// Handle returned by `subscribe`; dropping it keeps the subscription alive
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    channel: Weak<Inner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remove the subscription. Returns false if it was already gone.
    pub fn unsubscribe(self) -> bool {
        let Some(inner) = self.channel.upgrade() else {
            return false;
        };
        let mut subs = inner.subscriptions.write().unwrap_or_else(|e| e.into_inner());
        let before = subs.len();
        subs.retain(|s| s.id != self.id);
        before != subs.len()
    }
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventChannel")
            .field("max_in_flight", &self.max_in_flight)
            .finish_non_exhaustive()
    }
}

/// Typed publish/subscribe bus shared by every Baton component
///
/// Cloning is cheap; clones share subscriptions and the dispatch queue.
#[derive(Clone, Debug)]
pub struct EventChannel {
    inner: Arc<Inner>,
}

impl EventChannel {
    pub fn new(config: &EventsConfig, clock: SharedClock, ids: SharedIds) -> Self {
        Self {
            inner: Arc::new(Inner {
                max_in_flight: config.max_in_flight.max(1),
                clock,
                ids,
                subscriptions: RwLock::new(Vec::new()),
                dispatch: Mutex::new(DispatchState::default()),
                idle: Notify::new(),
                next_subscription: AtomicU64::new(1),
                published: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                failures: AtomicU64::new(0),
            }),
        }
    }

    /// Publish a payload, stamping id and timestamp. Returns the event id.
    ///
    /// Must be called from within a tokio runtime for dispatch to start.
    pub fn publish(&self, source: &str, payload: EventPayload) -> String {
        self.inner.publish_payload(source, payload)
    }

    /// Publish a fully built event
    pub fn publish_event(&self, event: Event) -> String {
        self.inner.enqueue(event)
    }

    /// Subscribe to one event type
    pub fn subscribe(
        &self,
        event_type: EventType,
        handler: Arc<dyn EventHandler>,
        filter: Option<EventFilter>,
    ) -> Subscription {
        self.add_subscription(Some(event_type), handler, filter)
    }

    /// Subscribe to every event type
    pub fn subscribe_all(
        &self,
        handler: Arc<dyn EventHandler>,
        filter: Option<EventFilter>,
    ) -> Subscription {
        self.add_subscription(None, handler, filter)
    }

    fn add_subscription(
        &self,
        event_type: Option<EventType>,
        handler: Arc<dyn EventHandler>,
        filter: Option<EventFilter>,
    ) -> Subscription {
        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(SubscriptionEntry {
                id,
                event_type,
                filter,
                handler,
            }));

        debug!(subscription = id, event_type = ?event_type, "Subscribed");
        Subscription {
            id,
            channel: Arc::downgrade(&self.inner),
        }
    }

    /// Resolve once nothing is queued or dispatching
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.is_idle() {
                return;
            }
            notified.await;
        }
    }

    pub fn stats(&self) -> ChannelStats {
        let (queued, in_flight) = {
            let state = self.inner.lock_dispatch();
            (state.queue.len(), state.in_flight)
        };
        ChannelStats {
            queued,
            in_flight,
            published: self.inner.published.load(Ordering::Relaxed),
            delivered: self.inner.delivered.load(Ordering::Relaxed),
            handler_failures: self.inner.failures.load(Ordering::Relaxed),
            subscriptions: self
                .inner
                .subscriptions
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .len(),
        }
    }

    pub fn clock(&self) -> &SharedClock {
        &self.inner.clock
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new(&EventsConfig::default(), SystemClock::shared(), UuidIds::shared())
    }
}
