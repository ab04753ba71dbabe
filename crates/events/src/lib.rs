//! Lifecycle notifications and their pub/sub transport.
//!
//! State changes are committed to the store first; notifications are
//! published afterwards, best-effort and at-least-once.

pub mod bus;
pub mod channel;
pub mod in_memory_bus;
pub mod notification;
pub mod notifier;

pub use bus::{EventBus, Subscription};
pub use channel::{thread_channel, user_channel};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use notification::{EventKind, Notification};
pub use notifier::{BusNotifier, Notifier};
