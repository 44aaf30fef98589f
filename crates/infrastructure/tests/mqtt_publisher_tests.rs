use anyhow::{Result, anyhow};
use async_trait::async_trait;
use infrastructure::mqtt::{MqttPublisherClient, QueuedPublisher};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;
use tokio::time::sleep;

// 1. Mock Client
#[derive(Clone)]
struct MockMqttClient {
    pub published_messages: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    pub connected: Arc<AtomicBool>,
    pub should_fail_publish: Arc<AtomicBool>,
}

impl MockMqttClient {
    fn new() -> Self {
        Self {
            published_messages: Arc::new(Mutex::new(Vec::new())),
            connected: Arc::new(AtomicBool::new(true)),
            should_fail_publish: Arc::new(AtomicBool::new(false)),
        }
    }

    fn topics(&self) -> Vec<String> {
        self.published_messages
            .lock()
            .unwrap()
            .iter()
            .map(|(topic, _)| topic.clone())
            .collect()
    }
}

#[async_trait]
impl MqttPublisherClient for MockMqttClient {
    async fn publish_bytes(
        &self,
        topic: &str,
        payload: &[u8],
        _qos: rumqttc::QoS,
        _retain: bool,
    ) -> Result<()> {
        if self.should_fail_publish.load(Ordering::Relaxed) {
            return Err(anyhow!("Simulated Publish Failure"));
        }

        self.published_messages
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.to_vec()));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

// 2. The Tests
#[tokio::test]
async fn test_offline_buffering_and_recovery() {
    let mock_client = MockMqttClient::new();
    let client_arc: Arc<dyn MqttPublisherClient> = Arc::new(mock_client.clone());
    let publisher = QueuedPublisher::new(client_arc, 100);

    // Scenario 1: Online
    // ------------------
    publisher
        .publish("iot/device/u1/sensor/temp", b"10.0", false)
        .await
        .unwrap();
    {
        let msgs = mock_client.published_messages.lock().unwrap();
        assert_eq!(msgs.len(), 1, "Should publish immediately when online");
    }

    // Scenario 2: Go Offline
    // ----------------------
    mock_client.connected.store(false, Ordering::Relaxed);

    publisher
        .publish("iot/device/u1/sensor/temp", b"20.0", false)
        .await
        .unwrap();
    publisher
        .publish("iot/device/u1/sensor/flow", b"3.5", false)
        .await
        .unwrap();

    // Check it did NOT publish
    {
        let msgs = mock_client.published_messages.lock().unwrap();
        assert_eq!(msgs.len(), 1, "Should NOT publish when offline");
    }
    assert_eq!(publisher.queued_len(), 2, "Should have 2 buffered messages");

    // Scenario 3: Recovery
    // --------------------
    mock_client.connected.store(true, Ordering::Relaxed);

    // Wait for the flusher (loops every 2s)
    sleep(Duration::from_secs(3)).await;

    assert_eq!(publisher.queued_len(), 0, "Queue should be empty after flush");
    {
        let msgs = mock_client.published_messages.lock().unwrap();
        assert_eq!(msgs.len(), 3, "Should have received buffered messages");
        // FIFO: temp=20.0 went in before flow=3.5
        assert_eq!(msgs[1].0, "iot/device/u1/sensor/temp");
        assert_eq!(msgs[1].1, b"20.0");
        assert_eq!(msgs[2].0, "iot/device/u1/sensor/flow");
    }
}

#[tokio::test]
async fn test_failed_flush_requeues_at_head() {
    let mock_client = MockMqttClient::new();
    let client_arc: Arc<dyn MqttPublisherClient> = Arc::new(mock_client.clone());
    let publisher = QueuedPublisher::new(client_arc, 100);

    // Buffer three messages while offline.
    mock_client.connected.store(false, Ordering::Relaxed);
    for n in 1..=3 {
        publisher
            .publish(&format!("t/{n}"), &[n as u8], false)
            .await
            .unwrap();
    }

    // Link is back but the broker rejects publishes: nothing may be lost
    // or reordered.
    mock_client.connected.store(true, Ordering::Relaxed);
    mock_client.should_fail_publish.store(true, Ordering::Relaxed);
    assert_eq!(publisher.flush_pending().await, 0);
    assert_eq!(publisher.queued_len(), 3, "failed flush keeps the queue");

    // Broker recovers: everything goes out in the original order.
    mock_client.should_fail_publish.store(false, Ordering::Relaxed);
    assert_eq!(publisher.flush_pending().await, 3);
    assert_eq!(mock_client.topics(), vec!["t/1", "t/2", "t/3"]);
}

#[tokio::test]
async fn test_queue_overflow_drops_oldest() {
    let mock_client = MockMqttClient::new();
    let client_arc: Arc<dyn MqttPublisherClient> = Arc::new(mock_client.clone());
    let publisher = QueuedPublisher::new(client_arc, 3);

    mock_client.connected.store(false, Ordering::Relaxed);
    for n in 1..=5 {
        publisher
            .publish(&format!("t/{n}"), &[n as u8], false)
            .await
            .unwrap();
    }
    assert_eq!(publisher.queued_len(), 3);

    mock_client.connected.store(true, Ordering::Relaxed);
    publisher.flush_pending().await;

    // 1 and 2 were dropped; the newest three survived in order.
    assert_eq!(mock_client.topics(), vec!["t/3", "t/4", "t/5"]);
}

#[tokio::test]
async fn test_publish_failure_while_connected_buffers() {
    let mock_client = MockMqttClient::new();
    let client_arc: Arc<dyn MqttPublisherClient> = Arc::new(mock_client.clone());
    let publisher = QueuedPublisher::new(client_arc, 100);

    // Connected, but the publish itself fails (e.g. send timeout).
    mock_client.should_fail_publish.store(true, Ordering::Relaxed);
    publisher.publish("t/1", b"x", false).await.unwrap();
    assert_eq!(publisher.queued_len(), 1, "failed publish is buffered");

    mock_client.should_fail_publish.store(false, Ordering::Relaxed);
    assert_eq!(publisher.flush_pending().await, 1);
    assert_eq!(mock_client.topics(), vec!["t/1"]);
}

#[tokio::test]
async fn test_unqueued_publish_is_never_buffered() {
    let mock_client = MockMqttClient::new();
    let client_arc: Arc<dyn MqttPublisherClient> = Arc::new(mock_client.clone());
    let publisher = QueuedPublisher::new(client_arc, 100);

    mock_client.should_fail_publish.store(true, Ordering::Relaxed);
    assert!(
        publisher.publish_unqueued("t/1", b"x", false).await.is_err(),
        "unqueued publish surfaces the failure"
    );
    assert_eq!(publisher.queued_len(), 0, "and never lands in the queue");
}
