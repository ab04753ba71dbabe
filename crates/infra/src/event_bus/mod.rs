//! Notification transports backed by external infrastructure.
//!
//! The bus abstraction and the in-memory transport live in
//! `courseforge-events`; this module adds Redis pub/sub.

#[cfg(feature = "redis")]
pub mod redis_pubsub;

#[cfg(feature = "redis")]
pub use redis_pubsub::{RedisBusError, RedisNotificationBus};
