//! Event system for gateway operational events
//!
//! This module provides:
//! - Event types and per-type payloads (circuit breaker, rate limit, proxy, health, config)
//! - Event bus for in-process pub/sub with bounded history

mod bus;
mod event;

pub use bus::{
    BusStats, EventBus, EventHandler, HandlerError, SubscriptionId, DEFAULT_HISTORY_CAPACITY,
};
pub use event::{
    CircuitBreakerEvent, ConfigChangedEvent, Event, EventMeta, EventPayload, EventSelector,
    EventType, HealthCheckEvent, ProxyRequestEvent, RateLimitEvent, WILDCARD,
};
