use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification rejected: {0}")]
    Rejected(String),
    #[error("notification transport unavailable: {0}")]
    Unavailable(String),
}

/// Outbound notification transport. Fire-and-forget: at-most-once delivery is
/// acceptable and a failure never fails the booking operation that caused it.
#[async_trait]
pub trait NotificationGateway: Send + Sync {
    async fn send(
        &self,
        user_id: &str,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<(), NotifyError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub user_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
}

/// In-process gateway: one broadcast channel per user.
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<Notification>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a user's notifications, creating the channel on first use.
    pub fn subscribe(&self, user_id: &str) -> broadcast::Receiver<Notification> {
        self.channels
            .entry(user_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }
}

#[async_trait]
impl NotificationGateway for NotifyHub {
    /// No-op if nobody is listening.
    async fn send(
        &self,
        user_id: &str,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<(), NotifyError> {
        if let Some(sender) = self.channels.get(user_id) {
            let _ = sender.send(Notification {
                user_id: user_id.to_string(),
                event_type: event_type.to_string(),
                payload,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe("patient-1");

        hub.send("patient-1", "booking_accepted", json!({ "serial": 4 }))
            .await
            .unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type, "booking_accepted");
        assert_eq!(received.payload["serial"], 4);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        tokio_test::assert_ok!(hub.send("nobody", "booking_rejected", json!({})).await);
    }

    #[tokio::test]
    async fn users_are_isolated() {
        let hub = NotifyHub::new();
        let mut a = hub.subscribe("a");
        let _b = hub.subscribe("b");

        hub.send("b", "booking_completed", json!({})).await.unwrap();
        assert!(a.try_recv().is_err());
    }
}
