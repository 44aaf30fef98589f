mod client;
mod publisher;
mod queue;
mod router;

pub use client::{MqttClient, MqttMessage, MqttPublisherClient, MqttSettings};
pub use publisher::QueuedPublisher;
pub use queue::{PublishQueue, QueuedPublish};
pub use router::{TopicRouter, topic_matches};
