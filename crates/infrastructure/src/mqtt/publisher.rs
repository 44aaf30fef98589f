use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rumqttc::QoS;
use tracing::{info, warn};

use super::client::MqttPublisherClient;
use super::queue::{PublishQueue, QueuedPublish};

const FLUSH_INTERVAL: Duration = Duration::from_secs(2);

/// Store-and-forward publisher over the raw broker link.
///
/// While the link is down, queued publishes land in a bounded FIFO (oldest
/// dropped on overflow). A background flusher drains the queue in order
/// whenever the link is back; a failed flush puts the message back at the
/// head and stops the pass.
#[derive(Clone)]
pub struct QueuedPublisher {
    client: Arc<dyn MqttPublisherClient>,
    queue: Arc<PublishQueue>,
}

impl QueuedPublisher {
    pub fn new(client: Arc<dyn MqttPublisherClient>, queue_capacity: usize) -> Self {
        let publisher = Self {
            client,
            queue: Arc::new(PublishQueue::new(queue_capacity)),
        };
        publisher.start_flusher();
        publisher
    }

    fn start_flusher(&self) {
        let client = self.client.clone();
        let queue = self.queue.clone();

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(FLUSH_INTERVAL).await;
                if !client.is_connected() || queue.is_empty() {
                    continue;
                }
                let flushed = Self::flush(&client, &queue).await;
                if flushed > 0 {
                    info!("📤 Flushed {} queued MQTT messages", flushed);
                }
            }
        });
    }

    /// Drain the queue in FIFO order; a failed publish goes back to the
    /// head and the pass stops. Returns how many messages went out.
    async fn flush(client: &Arc<dyn MqttPublisherClient>, queue: &PublishQueue) -> usize {
        let mut flushed = 0usize;
        while let Some(msg) = queue.pop_front() {
            match client
                .publish_bytes(&msg.topic, &msg.payload, QoS::AtLeastOnce, msg.retain)
                .await
            {
                Ok(()) => flushed += 1,
                Err(e) => {
                    warn!("flusher paused: MQTT publish failed: {}", e);
                    queue.push_front(msg);
                    break;
                }
            }
        }
        flushed
    }

    /// One immediate flush pass (also used by tests and shutdown drain).
    pub async fn flush_pending(&self) -> usize {
        Self::flush(&self.client, &self.queue).await
    }

    /// Queued publish: buffered while disconnected, flushed FIFO on
    /// reconnect.
    pub async fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<()> {
        if !self.client.is_connected() {
            if self.queue.push_back(QueuedPublish {
                topic: topic.to_string(),
                payload: payload.to_vec(),
                retain,
            }) {
                warn!("MQTT queue full, dropped oldest message");
            }
            return Ok(());
        }

        if let Err(e) = self
            .client
            .publish_bytes(topic, payload, QoS::AtLeastOnce, retain)
            .await
        {
            warn!("MQTT publish failed ({}), queueing", e);
            self.queue.push_back(QueuedPublish {
                topic: topic.to_string(),
                payload: payload.to_vec(),
                retain,
            });
        }
        Ok(())
    }

    /// Unqueued publish for telemetry that has an alternative channel.
    pub async fn publish_unqueued(&self, topic: &str, payload: &[u8], retain: bool) -> Result<()> {
        self.client
            .publish_bytes(topic, payload, QoS::AtMostOnce, retain)
            .await
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    /// Best-effort drain before shutdown, bounded by `grace`.
    pub async fn drain(&self, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        while !self.queue.is_empty() && tokio::time::Instant::now() < deadline {
            if !self.client.is_connected() {
                break;
            }
            self.flush_pending().await;
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}
