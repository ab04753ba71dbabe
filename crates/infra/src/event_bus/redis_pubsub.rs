//! Redis pub/sub transport for notifications (feature `redis`).
//!
//! Each notification is published on `{prefix}{channel_id}` as JSON; a
//! subscription pattern-subscribes to `{prefix}*`. Pub/sub is not durable:
//! a notification sent while nobody listens is lost, and clients repair the
//! gap by polling the job row.

use std::sync::mpsc;
use std::thread;

use redis::Commands;
use tracing::{debug, warn};

use courseforge_events::{EventBus, Notification, Subscription};

#[derive(Debug, thiserror::Error)]
pub enum RedisBusError {
    #[error("redis: {0}")]
    Redis(String),
    #[error("serialize: {0}")]
    Serialize(String),
}

/// Notification bus over Redis pub/sub.
#[derive(Debug, Clone)]
pub struct RedisNotificationBus {
    client: redis::Client,
    prefix: String,
}

impl RedisNotificationBus {
    pub const DEFAULT_PREFIX: &'static str = "courseforge:";

    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, RedisBusError> {
        Self::with_prefix(redis_url, Self::DEFAULT_PREFIX)
    }

    pub fn with_prefix(redis_url: impl AsRef<str>, prefix: impl Into<String>) -> Result<Self, RedisBusError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(|e| RedisBusError::Redis(e.to_string()))?;
        Ok(Self {
            client,
            prefix: prefix.into(),
        })
    }

    pub fn redis_channel(&self, channel_id: &str) -> String {
        format!("{}{}", self.prefix, channel_id)
    }
}

impl EventBus<Notification> for RedisNotificationBus {
    type Error = RedisBusError;

    fn publish(&self, message: Notification) -> Result<(), Self::Error> {
        let payload = serde_json::to_string(&message).map_err(|e| RedisBusError::Serialize(e.to_string()))?;

        let mut conn = self
            .client
            .get_connection()
            .map_err(|e| RedisBusError::Redis(e.to_string()))?;

        let receivers: i64 = conn
            .publish(self.redis_channel(message.channel_id()), payload)
            .map_err(|e| RedisBusError::Redis(e.to_string()))?;
        debug!(channel = message.channel_id(), receivers, "notification sent to redis");
        Ok(())
    }

    fn subscribe(&self) -> Subscription<Notification> {
        let (tx, rx) = mpsc::channel();

        let client = self.client.clone();
        let pattern = format!("{}*", self.prefix);

        // Blocking pub/sub reader; ends when the subscription is dropped.
        thread::spawn(move || {
            let mut conn = match client.get_connection() {
                Ok(c) => c,
                Err(err) => {
                    warn!(error = %err, "redis subscription could not connect");
                    return;
                }
            };

            let mut pubsub = conn.as_pubsub();
            if let Err(err) = pubsub.psubscribe(&pattern) {
                warn!(error = %err, pattern = %pattern, "redis psubscribe failed");
                return;
            }

            loop {
                let msg = match pubsub.get_message() {
                    Ok(m) => m,
                    Err(err) => {
                        warn!(error = %err, "redis subscription closed");
                        return;
                    }
                };

                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(_) => continue,
                };

                let notification: Notification = match serde_json::from_str(&payload) {
                    Ok(n) => n,
                    Err(err) => {
                        debug!(error = %err, "skipping undecodable notification");
                        continue;
                    }
                };

                if tx.send(notification).is_err() {
                    return;
                }
            }
        });

        Subscription::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use courseforge_core::UserId;
    use courseforge_events::{EventKind, user_channel};

    use super::*;

    #[test]
    fn channels_are_prefixed() {
        let bus = RedisNotificationBus::with_prefix("redis://127.0.0.1/", "cf:").unwrap();
        let owner = UserId::new();
        assert_eq!(bus.redis_channel(&user_channel(owner)), format!("cf:{}", user_channel(owner)));
    }

    #[test]
    #[ignore = "requires REDIS_URL"]
    fn publish_reaches_subscribers() {
        let url = std::env::var("REDIS_URL").unwrap();
        let bus = RedisNotificationBus::new(url).unwrap();
        let sub = bus.subscribe();
        std::thread::sleep(std::time::Duration::from_millis(200));

        bus.publish(Notification::new("user:1", EventKind::JobDone, serde_json::json!({ "id": "j" })))
            .unwrap();
        let got = sub.recv_timeout(std::time::Duration::from_secs(2)).unwrap();
        assert_eq!(got.kind(), EventKind::JobDone);
        assert_eq!(got.channel_id(), "user:1");
    }
}
