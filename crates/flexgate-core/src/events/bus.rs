//! In-process event bus with bounded history.
//!
//! Handlers run synchronously inside [`EventBus::emit`], in registration
//! order. A failing or panicking handler is logged and skipped; it never
//! prevents later handlers from running and never reaches the producer.

use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use serde::Serialize;

use crate::events::{Event, EventPayload, EventSelector, EventType};

/// Default history capacity
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// Number of events reported in [`BusStats::recent_events`].
const RECENT_EVENTS_WINDOW: usize = 10;

/// Error a handler may return.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Subscriber callback.
pub type EventHandler = Arc<dyn Fn(&Event) -> Result<(), HandlerError> + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    selector: EventSelector,
    handler: EventHandler,
}

struct BusInner {
    subscriptions: RwLock<Vec<Subscription>>,
    history: Mutex<VecDeque<Event>>,
    capacity: usize,
    next_subscription: AtomicU64,
}

/// Snapshot of bus activity.
#[derive(Debug, Clone, Serialize)]
pub struct BusStats {
    /// Events currently held in history.
    pub total_events: usize,
    /// History breakdown by event type.
    pub events_by_type: HashMap<EventType, usize>,
    /// Most recent events, oldest first.
    pub recent_events: Vec<Event>,
}

/// Event bus for gateway operational events
///
/// Cloning is cheap and yields a handle to the same bus, so one instance can
/// be constructed at startup and handed to every producer.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a new event bus with default history capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    /// Create a new event bus with custom history capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(BusInner {
                subscriptions: RwLock::new(Vec::new()),
                history: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_HISTORY_CAPACITY))),
                capacity,
                next_subscription: AtomicU64::new(1),
            }),
        }
    }

    /// Register a handler for one event type or for every event.
    ///
    /// Registration is additive: subscribing the same closure twice runs it twice.
    pub fn subscribe<F>(&self, selector: impl Into<EventSelector>, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        let subscription = Subscription {
            id,
            selector: selector.into(),
            handler: Arc::new(handler),
        };
        self.inner
            .subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(subscription);
        id
    }

    /// Remove a handler. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self
            .inner
            .subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        subscriptions.len() != before
    }

    /// Emit an event to all matching subscribers and return its id.
    ///
    /// Never fails and never blocks on I/O.
    pub fn emit(&self, payload: EventPayload) -> String {
        let event = Event::new(payload);
        let event_id = event.id.clone();

        {
            let mut history = self.history_guard();
            if history.len() >= self.inner.capacity {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        // Handlers run outside the lock so they may subscribe or emit themselves
        let handlers: Vec<EventHandler> = self
            .inner
            .subscriptions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|s| s.selector.matches(event.event_type))
            .map(|s| s.handler.clone())
            .collect();

        tracing::trace!(
            event_id = %event.id,
            event_type = %event.event_type,
            handlers = handlers.len(),
            "Dispatching event"
        );

        for handler in handlers {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(
                        event_id = %event.id,
                        event_type = %event.event_type,
                        error = %e,
                        "Event handler failed"
                    );
                }
                Err(_) => {
                    tracing::error!(
                        event_id = %event.id,
                        event_type = %event.event_type,
                        "Event handler panicked"
                    );
                }
            }
        }

        event_id
    }

    /// Return up to `limit` most recent events, oldest first.
    pub fn history(&self, limit: usize, event_type: Option<EventType>) -> Vec<Event> {
        let history = self.history_guard();
        let mut selected: Vec<Event> = history
            .iter()
            .rev()
            .filter(|e| event_type.map_or(true, |t| e.event_type == t))
            .take(limit)
            .cloned()
            .collect();
        selected.reverse();
        selected
    }

    /// Summarize the events currently in history.
    pub fn stats(&self) -> BusStats {
        let history = self.history_guard();
        let mut events_by_type = HashMap::new();
        for event in history.iter() {
            *events_by_type.entry(event.event_type).or_insert(0) += 1;
        }
        let skip = history.len().saturating_sub(RECENT_EVENTS_WINDOW);

        BusStats {
            total_events: history.len(),
            events_by_type,
            recent_events: history.iter().skip(skip).cloned().collect(),
        }
    }

    /// Drop all recorded events. Subscriptions are untouched.
    pub fn clear_history(&self) {
        self.history_guard().clear();
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscriptions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// History capacity
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    fn history_guard(&self) -> MutexGuard<'_, VecDeque<Event>> {
        self.inner.history.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{CircuitBreakerEvent, ConfigChangedEvent, RateLimitEvent};
    use std::sync::atomic::AtomicUsize;

    fn opened() -> EventPayload {
        EventPayload::CircuitBreakerOpened(CircuitBreakerEvent::new("circuit-breaker", "orders"))
    }

    fn exceeded() -> EventPayload {
        EventPayload::RateLimitExceeded(RateLimitEvent::new("rate-limiter", "client-a", 10, 11))
    }

    #[test]
    fn test_emit_reaches_type_and_wildcard_subscribers() {
        let bus = EventBus::new();
        let typed = Arc::new(AtomicUsize::new(0));
        let wildcard = Arc::new(AtomicUsize::new(0));

        let t = typed.clone();
        bus.subscribe(EventType::CircuitBreakerOpened, move |_| {
            t.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let w = wildcard.clone();
        bus.subscribe(EventSelector::All, move |_| {
            w.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.emit(opened());
        bus.emit(exceeded());

        assert_eq!(typed.load(Ordering::SeqCst), 1);
        assert_eq!(wildcard.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for label in ["first", "second", "third"] {
            let order = order.clone();
            let selector = if label == "second" {
                EventSelector::All
            } else {
                EventSelector::Type(EventType::CircuitBreakerOpened)
            };
            bus.subscribe(selector, move |_| {
                order.lock().unwrap().push(label);
                Ok(())
            });
        }

        bus.emit(opened());
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_failing_handlers_are_isolated() {
        let bus = EventBus::new();
        let reached = Arc::new(AtomicUsize::new(0));

        bus.subscribe(EventSelector::All, |_| Err("broken consumer".into()));
        bus.subscribe(EventSelector::All, |_| panic!("consumer exploded"));
        let r = reached.clone();
        bus.subscribe(EventSelector::All, move |_| {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let id = bus.emit(opened());

        assert!(!id.is_empty());
        assert_eq!(reached.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_duplicate_subscriptions_are_not_deduplicated() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = {
            let calls = calls.clone();
            move |_: &Event| -> Result<(), HandlerError> {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        };

        bus.subscribe(EventSelector::All, handler.clone());
        bus.subscribe(EventSelector::All, handler);
        bus.emit(opened());

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let id = bus.subscribe(EventSelector::All, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.emit(opened());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_history_is_bounded_and_ordered() {
        let bus = EventBus::with_capacity(3);
        let ids: Vec<String> = (0..5).map(|_| bus.emit(opened())).collect();

        let history = bus.history(10, None);
        assert_eq!(history.len(), 3);
        let kept: Vec<&str> = history.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(kept, vec![ids[2].as_str(), ids[3].as_str(), ids[4].as_str()]);
    }

    #[test]
    fn test_history_limit_and_filter() {
        let bus = EventBus::new();
        bus.emit(opened());
        let last_exceeded = {
            bus.emit(exceeded());
            bus.emit(exceeded())
        };
        bus.emit(opened());

        let filtered = bus.history(1, Some(EventType::RateLimitExceeded));
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].id, last_exceeded);

        let latest_two = bus.history(2, None);
        assert_eq!(latest_two[1].event_type, EventType::CircuitBreakerOpened);
        assert_eq!(latest_two[0].event_type, EventType::RateLimitExceeded);
    }

    #[test]
    fn test_stats_and_clear_history() {
        let bus = EventBus::new();
        bus.subscribe(EventSelector::All, |_| Ok(()));
        for _ in 0..12 {
            bus.emit(exceeded());
        }
        bus.emit(EventPayload::ConfigChanged(ConfigChangedEvent::new(
            "config-loader",
            vec!["routes".to_string()],
        )));

        let stats = bus.stats();
        assert_eq!(stats.total_events, 13);
        assert_eq!(stats.events_by_type[&EventType::RateLimitExceeded], 12);
        assert_eq!(stats.events_by_type[&EventType::ConfigChanged], 1);
        assert_eq!(stats.recent_events.len(), 10);
        assert_eq!(
            stats.recent_events.last().unwrap().event_type,
            EventType::ConfigChanged
        );

        bus.clear_history();
        assert_eq!(bus.stats().total_events, 0);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn test_clones_share_state() {
        let bus = EventBus::new();
        let producer = bus.clone();
        producer.emit(opened());
        assert_eq!(bus.history(10, None).len(), 1);
    }
}
