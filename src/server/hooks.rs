//! Callbacks fired by the relay as topics and clients come and go.

/// Observer of relay activity. Every method defaults to doing nothing.
pub trait RelayHooks: Send + Sync {
    /// The first client connected to a topic.
    fn on_topic_activated(&self, _topic: &str) {}

    /// The last client disconnected from a topic.
    fn on_topic_deactivated(&self, _topic: &str) {}

    /// A client connected (`+1`) or disconnected (`-1`).
    fn on_client_presence_changed(&self, _topic: &str, _client_id: &str, _delta: i8) {}

    /// A payload is about to be forwarded. `to` is empty for a broadcast.
    fn on_message(&self, _topic: &str, _from: &str, _to: &str, _remainder: &str) {}
}

/// Hooks that log every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHooks;

impl RelayHooks for LoggingHooks {
    fn on_topic_activated(&self, topic: &str) {
        tracing::info!(topic, "Topic activated");
    }

    fn on_topic_deactivated(&self, topic: &str) {
        tracing::info!(topic, "Topic deactivated");
    }

    fn on_client_presence_changed(&self, topic: &str, client_id: &str, delta: i8) {
        tracing::info!(topic, client_id, delta, "Client presence changed");
    }

    fn on_message(&self, topic: &str, from: &str, to: &str, remainder: &str) {
        tracing::debug!(topic, from, to, bytes = remainder.len(), "Forwarding message");
    }
}
