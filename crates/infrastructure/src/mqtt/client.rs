use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use anyhow::{Result, anyhow};
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS, TlsConfiguration, Transport};
use tokio::sync::broadcast;
use tokio::task;
use tracing::{debug, error, info, warn};

use super::publisher::QueuedPublisher;
use super::router::TopicRouter;

const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retained: bool,
}

/// Raw publish seam over the broker link. The store-and-forward publisher
/// and the test suites program against this instead of the concrete client.
#[async_trait::async_trait]
pub trait MqttPublisherClient: Send + Sync {
    async fn publish_bytes(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<()>;
    fn is_connected(&self) -> bool;
}

/// Connection settings for the broker link.
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub broker_url: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ca_cert_pem: Option<String>,
    pub queue_capacity: usize,
    pub last_will: Option<(String, Vec<u8>)>,
}

/// The bare broker link: one rumqttc handle plus the connected flag kept
/// current by the event-loop task.
struct MqttLink {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl MqttPublisherClient for MqttLink {
    async fn publish_bytes(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<()> {
        self.client
            .publish(topic, qos, retain, payload.to_vec())
            .await
            .map_err(|e| anyhow!("failed to publish MQTT message: {e}"))?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

/// Process-wide MQTT client with queue-on-disconnect semantics.
///
/// The owned event-loop task keeps the connection alive with exponential
/// backoff (1 s base, 30 s cap) and resubscribes on every ConnAck. Queued
/// publishes go through the shared [`QueuedPublisher`]; unqueued publishes
/// are best effort for telemetry that has an alternative channel.
#[derive(Clone)]
pub struct MqttClient {
    client: AsyncClient,
    tx: broadcast::Sender<MqttMessage>,
    link: Arc<MqttLink>,
    publisher: QueuedPublisher,
    router: TopicRouter,
    subscriptions: Arc<std::sync::RwLock<Vec<String>>>,
}

fn parse_broker_url(url: &str) -> Result<(String, u16, bool)> {
    let (tls, rest) = if let Some(rest) = url.strip_prefix("mqtts://") {
        (true, rest)
    } else if let Some(rest) = url.strip_prefix("ssl://") {
        (true, rest)
    } else if let Some(rest) = url.strip_prefix("mqtt://") {
        (false, rest)
    } else if let Some(rest) = url.strip_prefix("tcp://") {
        (false, rest)
    } else {
        (false, url)
    };

    let mut parts = rest.splitn(2, ':');
    let host = parts
        .next()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| anyhow!("broker URL missing host: {url}"))?;
    let port = match parts.next() {
        Some(p) => p
            .trim_end_matches('/')
            .parse()
            .map_err(|_| anyhow!("broker URL has invalid port: {url}"))?,
        None => {
            if tls {
                8883
            } else {
                1883
            }
        }
    };
    Ok((host.to_string(), port, tls))
}

impl MqttClient {
    pub async fn new(settings: MqttSettings) -> Result<Self> {
        let (host, port, tls) = parse_broker_url(&settings.broker_url)?;

        let mut mqttoptions = MqttOptions::new(&settings.client_id, host, port);
        mqttoptions.set_keep_alive(Duration::from_secs(20));
        mqttoptions.set_clean_session(false); // Persistent session for commands

        if let (Some(user), Some(pass)) = (&settings.username, &settings.password) {
            mqttoptions.set_credentials(user, pass);
        }

        if tls {
            let ca = settings
                .ca_cert_pem
                .as_ref()
                .map(|pem| pem.as_bytes().to_vec())
                .unwrap_or_default();
            mqttoptions.set_transport(Transport::Tls(TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth: None,
            }));
        }

        if let Some((topic, payload)) = &settings.last_will {
            mqttoptions.set_last_will(LastWill::new(
                topic.clone(),
                payload.clone(),
                QoS::AtLeastOnce,
                true,
            ));
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 100);
        let (tx, _) = broadcast::channel(250);
        let tx_clone = tx.clone();
        let connected = Arc::new(AtomicBool::new(false));
        let connected_clone = connected.clone();
        let router = TopicRouter::new();
        let router_clone = router.clone();

        let subscriptions = Arc::new(std::sync::RwLock::new(Vec::new()));
        let subscriptions_clone = subscriptions.clone();
        let client_clone = client.clone();

        // Event loop task: serializes reconnect attempts - the next attempt
        // is only scheduled after the current poll fails.
        task::spawn(async move {
            let mut backoff = RECONNECT_BASE;
            loop {
                match eventloop.poll().await {
                    Ok(notification) => {
                        backoff = RECONNECT_BASE;
                        match notification {
                            Event::Incoming(Packet::Publish(publish)) => {
                                let msg = MqttMessage {
                                    topic: publish.topic,
                                    payload: publish.payload.to_vec(),
                                    retained: publish.retain,
                                };
                                router_clone.dispatch(&msg);
                                // Broadcast errors just mean nobody is
                                // listening yet.
                                let _ = tx_clone.send(msg);
                            }
                            Event::Incoming(Packet::ConnAck(_)) => {
                                info!("MQTT connected");
                                connected_clone.store(true, Ordering::Relaxed);

                                // Re-subscribe to all topics
                                let mut subs =
                                    subscriptions_clone.read().expect("subs poisoned").clone();
                                subs.extend(router_clone.patterns());
                                subs.sort();
                                subs.dedup();
                                if !subs.is_empty() {
                                    debug!("re-subscribing to {} topics", subs.len());
                                    for topic in subs {
                                        if let Err(e) =
                                            client_clone.subscribe(&topic, QoS::AtLeastOnce).await
                                        {
                                            error!("failed to re-subscribe to {}: {}", topic, e);
                                        }
                                    }
                                }
                            }
                            Event::Outgoing(rumqttc::Outgoing::Disconnect) => {
                                connected_clone.store(false, Ordering::Relaxed);
                            }
                            _ => {}
                        }
                    }
                    Err(e) => {
                        warn!(error = ?e, backoff_secs = backoff.as_secs(), "MQTT connection error");
                        connected_clone.store(false, Ordering::Relaxed);
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(RECONNECT_CAP);
                    }
                }
            }
        });

        let link = Arc::new(MqttLink { client: client.clone(), connected });
        let publisher = QueuedPublisher::new(
            link.clone() as Arc<dyn MqttPublisherClient>,
            settings.queue_capacity,
        );

        Ok(Self {
            client,
            tx,
            link,
            publisher,
            router,
            subscriptions,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    pub fn queued_len(&self) -> usize {
        self.publisher.queued_len()
    }

    pub fn router(&self) -> &TopicRouter {
        &self.router
    }

    pub fn subscribe_messages(&self) -> broadcast::Receiver<MqttMessage> {
        self.tx.subscribe()
    }

    /// Queued publish: buffered while disconnected, flushed FIFO on
    /// reconnect.
    pub async fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<()> {
        self.publisher.publish(topic, payload, retain).await
    }

    /// Unqueued publish for telemetry that has an alternative channel.
    pub async fn publish_unqueued(&self, topic: &str, payload: &[u8], retain: bool) -> Result<()> {
        self.publisher.publish_unqueued(topic, payload, retain).await
    }

    pub async fn subscribe(&self, topic: &str) -> Result<()> {
        {
            let mut subs = self.subscriptions.write().expect("subs poisoned");
            if !subs.contains(&topic.to_string()) {
                subs.push(topic.to_string());
            }
        }

        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| anyhow!("failed to subscribe to topic {topic}: {e}"))?;
        Ok(())
    }

    /// Best-effort drain before shutdown, bounded by `grace`.
    pub async fn drain(&self, grace: Duration) {
        self.publisher.drain(grace).await;
    }
}

#[async_trait::async_trait]
impl MqttPublisherClient for MqttClient {
    async fn publish_bytes(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<()> {
        self.link.publish_bytes(topic, payload, qos, retain).await
    }

    fn is_connected(&self) -> bool {
        self.link.is_connected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_broker_url() {
        assert_eq!(
            parse_broker_url("mqtts://broker:8883").unwrap(),
            ("broker".to_string(), 8883, true)
        );
        assert_eq!(
            parse_broker_url("mqtt://broker").unwrap(),
            ("broker".to_string(), 1883, false)
        );
        assert_eq!(
            parse_broker_url("broker:1884").unwrap(),
            ("broker".to_string(), 1884, false)
        );
        assert_eq!(
            parse_broker_url("mqtts://broker").unwrap(),
            ("broker".to_string(), 8883, true)
        );
        assert!(parse_broker_url("mqtt://").is_err());
        assert!(parse_broker_url("mqtt://broker:x").is_err());
    }
}
