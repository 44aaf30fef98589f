use std::sync::{Arc, RwLock};

use tracing::warn;

use super::client::MqttMessage;

/// MQTT topic filter match with `+` (single level) and `#` (rest, last
/// position only) wildcards.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_parts = pattern.split('/');
    let mut topic_parts = topic.split('/');

    loop {
        match (pattern_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return pattern_parts.next().is_none(),
            (Some("+"), Some(_)) => continue,
            (Some(p), Some(t)) if p == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

type Handler = Arc<dyn Fn(&MqttMessage) -> Result<(), String> + Send + Sync>;

struct Subscription {
    id: u64,
    pattern: String,
    handler: Handler,
}

/// Dispatches inbound messages to every handler whose pattern matches.
/// Handler errors are isolated: one failing handler never stops the others.
#[derive(Clone, Default)]
pub struct TopicRouter {
    subscriptions: Arc<RwLock<Vec<Subscription>>>,
    next_id: Arc<std::sync::atomic::AtomicU64>,
}

impl TopicRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; the returned id unregisters it again. Explicit
    /// lifecycle keeps reconnections from leaking handlers.
    pub fn register<F>(&self, pattern: impl Into<String>, handler: F) -> u64
    where
        F: Fn(&MqttMessage) -> Result<(), String> + Send + Sync + 'static,
    {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.subscriptions
            .write()
            .expect("router poisoned")
            .push(Subscription {
                id,
                pattern: pattern.into(),
                handler: Arc::new(handler),
            });
        id
    }

    pub fn unregister(&self, id: u64) {
        self.subscriptions
            .write()
            .expect("router poisoned")
            .retain(|s| s.id != id);
    }

    /// All patterns currently registered (used for broker resubscription).
    pub fn patterns(&self) -> Vec<String> {
        self.subscriptions
            .read()
            .expect("router poisoned")
            .iter()
            .map(|s| s.pattern.clone())
            .collect()
    }

    /// Invoke every matching handler. Returns how many matched.
    pub fn dispatch(&self, message: &MqttMessage) -> usize {
        let handlers: Vec<(String, Handler)> = {
            let subs = self.subscriptions.read().expect("router poisoned");
            subs.iter()
                .filter(|s| topic_matches(&s.pattern, &message.topic))
                .map(|s| (s.pattern.clone(), s.handler.clone()))
                .collect()
        };

        for (pattern, handler) in &handlers {
            if let Err(e) = handler(message) {
                warn!(pattern = %pattern, topic = %message.topic, error = %e, "MQTT handler failed");
            }
        }
        handlers.len()
    }
}
