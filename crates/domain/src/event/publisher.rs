use async_trait::async_trait;

use super::AgentEvent;

/// Outbound event seam: MQTT publishers, the anomaly feed, and test sinks
/// implement this.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(
        &self,
        event: AgentEvent,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}
