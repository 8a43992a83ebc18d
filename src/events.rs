//! Event Dispatcher: fans out request-status changes to WebSocket
//! subscribers as JSON-RPC-shaped notifications.
//!
//! Grounded in the `broadcast::Sender<TxState>` fan-out used by the
//! `web3-proxy`-style app in the retrieval pack: one `tokio::sync::broadcast`
//! channel per topic, cheap to clone into every open connection, late
//! subscribers simply miss history rather than blocking producers.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;

use dashmap::DashMap;

const CHANNEL_CAPACITY: usize = 1024;

/// Fixed channel all terminal ORDER-type status updates publish to
/// (spec.md §6). The WebSocket subscribe handler validates requested
/// channel names against `CHANNELS` before subscribing.
pub const ORDER_CHANNEL: &str = "ORDER";

pub const CHANNELS: &[&str] = &[ORDER_CHANNEL];

/// A JSON-RPC 2.0 subscription notification, the shape every WebSocket
/// client receives regardless of which channel it came from.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub jsonrpc: &'static str,
    pub method: &'static str,
    pub params: NotificationParams,
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationParams {
    pub channel: String,
    pub data: Value,
}

impl Notification {
    fn new(channel: impl Into<String>, data: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            method: "subscription",
            params: NotificationParams {
                channel: channel.into(),
                data,
            },
        }
    }
}

/// Per-channel fan-out. Channels are created lazily on first subscribe or
/// first publish, whichever comes first.
pub struct EventDispatcher {
    channels: DashMap<String, broadcast::Sender<Notification>>,
}

impl EventDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            channels: DashMap::new(),
        })
    }

    /// Subscribes to `channel`, creating it if this is the first subscriber.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<Notification> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// `on_event(channel, event)`: publishes `event` to every current
    /// subscriber of `channel`. A channel with no subscribers yet quietly
    /// drops the event rather than buffering it.
    pub fn on_event(&self, channel: &str, event: impl Serialize) {
        let data = match serde_json::to_value(&event) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(%channel, error = %err, "event failed to serialize, dropping");
                return;
            }
        };
        let notification = Notification::new(channel, data);
        if let Some(sender) = self.channels.get(channel) {
            // SendError just means zero receivers are currently attached.
            let _ = sender.send(notification);
        }
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let dispatcher = EventDispatcher::new();
        let mut rx = dispatcher.subscribe(ORDER_CHANNEL);
        dispatcher.on_event(ORDER_CHANNEL, json!({"status": "SUCCEEDED"}));
        let notification = rx.recv().await.unwrap();
        assert_eq!(notification.params.channel, ORDER_CHANNEL);
        assert_eq!(notification.params.data["status"], "SUCCEEDED");
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let dispatcher = EventDispatcher::new();
        dispatcher.on_event("nobody.listening", json!({"x": 1}));
    }
}
