use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::sync::Mutex as TokioMutex;
use tokio_modbus::Exception;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tokio_serial::SerialStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use domain::sensor::QualityCode;

use super::config::{ModbusTransport, RegisterType};

const RECONNECT_BASE: Duration = Duration::from_secs(5);
const RECONNECT_CAP: Duration = Duration::from_secs(60);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

// Global registry for shared channels: devices on the same serial port or
// TCP endpoint must go through one serialized connection.
static SHARED_CHANNELS: std::sync::OnceLock<Mutex<HashMap<String, Weak<ModbusChannel>>>> =
    std::sync::OnceLock::new();

fn shared_channels() -> &'static Mutex<HashMap<String, Weak<ModbusChannel>>> {
    SHARED_CHANNELS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Channel-level read failure.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelError {
    /// Channel is down and the reconnect backoff has not elapsed yet.
    NotConnected,
    /// The external timeout fired; the connection is dropped because a late
    /// response would corrupt the next exchange's framing.
    Timeout,
    /// The device answered with a Modbus exception; the channel stays up.
    Exception(Exception),
    /// Fatal transport error; the channel is dropped and a reconnect is
    /// scheduled.
    Transport(String),
}

impl ChannelError {
    pub fn quality_code(&self) -> QualityCode {
        match self {
            Self::NotConnected => QualityCode::DeviceOffline,
            Self::Timeout => QualityCode::Timeout,
            Self::Exception(Exception::IllegalDataAddress) => QualityCode::IllegalAddress,
            Self::Exception(Exception::IllegalFunction) => QualityCode::IllegalFunction,
            Self::Exception(Exception::Acknowledge | Exception::ServerDeviceBusy) => {
                QualityCode::DeviceBusy
            }
            Self::Exception(_) => QualityCode::TransportError,
            Self::Transport(_) => QualityCode::DeviceOffline,
        }
    }

    /// ACKNOWLEDGE (5) and DEVICE_BUSY (6) warrant a short retry.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            Self::Exception(Exception::Acknowledge | Exception::ServerDeviceBusy)
        )
    }
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConnected => write!(f, "channel not connected"),
            Self::Timeout => write!(f, "request timed out"),
            Self::Exception(e) => write!(f, "modbus exception: {e}"),
            Self::Transport(e) => write!(f, "transport error: {e}"),
        }
    }
}

struct ReconnectState {
    backoff: Duration,
    next_attempt: Option<Instant>,
}

/// One physical Modbus channel (serial port or TCP endpoint).
///
/// The underlying client is frame-based and cannot service concurrent
/// requests; every read goes through the fair Tokio mutex, which makes wire
/// access strictly FIFO. Every read is additionally wrapped in an external
/// timeout because a faulted line can hang a request forever.
pub struct ModbusChannel {
    key: String,
    transport: ModbusTransport,
    timeout: Duration,
    context: TokioMutex<Option<Context>>,
    reconnect: Mutex<ReconnectState>,
}

impl ModbusChannel {
    fn new(transport: ModbusTransport, timeout: Duration) -> Self {
        Self {
            key: transport.channel_key(),
            transport,
            timeout,
            context: TokioMutex::new(None),
            reconnect: Mutex::new(ReconnectState {
                backoff: RECONNECT_BASE,
                next_attempt: None,
            }),
        }
    }

    /// Get or create the shared channel for a transport.
    pub fn shared(transport: ModbusTransport, timeout: Duration) -> Arc<Self> {
        let key = transport.channel_key();
        let mut map = shared_channels().lock().expect("registry poisoned");
        if let Some(existing) = map.get(&key).and_then(Weak::upgrade) {
            return existing;
        }
        let channel = Arc::new(Self::new(transport, timeout));
        map.insert(key, Arc::downgrade(&channel));
        channel
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn is_connected(&self) -> bool {
        self.context.lock().await.is_some()
    }

    fn schedule_reconnect(&self) {
        let mut state = self.reconnect.lock().expect("reconnect poisoned");
        state.next_attempt = Some(Instant::now() + state.backoff);
        let delay = state.backoff;
        state.backoff = (state.backoff * 2).min(RECONNECT_CAP);
        debug!(channel = %self.key, delay_secs = delay.as_secs(), "scheduled reconnect");
    }

    fn reconnect_due(&self) -> bool {
        let state = self.reconnect.lock().expect("reconnect poisoned");
        state.next_attempt.is_none_or(|at| Instant::now() >= at)
    }

    fn mark_connected(&self) {
        let mut state = self.reconnect.lock().expect("reconnect poisoned");
        state.backoff = RECONNECT_BASE;
        state.next_attempt = None;
    }

    async fn open_context(&self) -> Result<Context, ChannelError> {
        match &self.transport {
            ModbusTransport::Serial {
                port, baud_rate, ..
            } => {
                let builder = tokio_serial::new(port, *baud_rate)
                    .data_bits(
                        self.transport
                            .to_data_bits()
                            .map_err(|e| ChannelError::Transport(e.to_string()))?,
                    )
                    .parity(
                        self.transport
                            .to_parity()
                            .map_err(|e| ChannelError::Transport(e.to_string()))?,
                    )
                    .stop_bits(
                        self.transport
                            .to_stop_bits()
                            .map_err(|e| ChannelError::Transport(e.to_string()))?,
                    )
                    .timeout(self.timeout);

                let stream = SerialStream::open(&builder).map_err(|e| {
                    ChannelError::Transport(format!("failed to open serial port {port}: {e}"))
                })?;
                Ok(tokio_modbus::client::rtu::attach_slave(stream, Slave(1)))
            }
            ModbusTransport::Tcp { host, port } => {
                let addr = tokio::net::lookup_host((host.as_str(), *port))
                    .await
                    .map_err(|e| ChannelError::Transport(format!("resolve {host}: {e}")))?
                    .next()
                    .ok_or_else(|| {
                        ChannelError::Transport(format!("no address for {host}:{port}"))
                    })?;

                let connect = tokio_modbus::client::tcp::connect(addr);
                match tokio::time::timeout(self.timeout, connect).await {
                    Ok(Ok(ctx)) => Ok(ctx),
                    Ok(Err(e)) => Err(ChannelError::Transport(format!("connect {addr}: {e}"))),
                    Err(_) => Err(ChannelError::Timeout),
                }
            }
        }
    }

    /// Read a register block. All requests on this channel are serialized
    /// through the context mutex; the lock is held across the wire exchange
    /// on purpose.
    pub async fn read_registers(
        &self,
        slave_id: u8,
        register_type: RegisterType,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, ChannelError> {
        let mut guard = self.context.lock().await;

        if guard.is_none() {
            if !self.reconnect_due() {
                return Err(ChannelError::NotConnected);
            }
            match self.open_context().await {
                Ok(ctx) => {
                    info!(channel = %self.key, "Modbus channel connected");
                    self.mark_connected();
                    *guard = Some(ctx);
                }
                Err(e) => {
                    warn!(channel = %self.key, error = %e, "Modbus connect failed");
                    self.schedule_reconnect();
                    return Err(e);
                }
            }
        }

        let ctx = guard.as_mut().expect("context just ensured");
        ctx.set_slave(Slave(slave_id));

        let read_future = async {
            match register_type {
                RegisterType::Holding => ctx.read_holding_registers(address, count).await,
                RegisterType::Input => ctx.read_input_registers(address, count).await,
                RegisterType::Coil => ctx
                    .read_coils(address, count)
                    .await
                    .map(|r| r.map(bools_to_words)),
                RegisterType::Discrete => ctx
                    .read_discrete_inputs(address, count)
                    .await
                    .map(|r| r.map(bools_to_words)),
            }
        };

        match tokio::time::timeout(self.timeout, read_future).await {
            Ok(Ok(Ok(words))) => Ok(words),
            Ok(Ok(Err(exception))) => Err(ChannelError::Exception(exception)),
            Ok(Err(e)) => {
                warn!(channel = %self.key, error = %e, "Modbus transport error, dropping channel");
                *guard = None;
                self.schedule_reconnect();
                Err(ChannelError::Transport(e.to_string()))
            }
            Err(_) => {
                warn!(channel = %self.key, timeout_ms = self.timeout.as_millis() as u64,
                      "Modbus request timed out, dropping channel");
                *guard = None;
                self.schedule_reconnect();
                Err(ChannelError::Timeout)
            }
        }
    }

    /// Periodic keep-alive read that stops idle TCP connections from being
    /// dropped by gateways and firewalls. Exception responses still prove
    /// the link is alive.
    pub fn spawn_keepalive(self: &Arc<Self>, slave_id: u8, cancel: CancellationToken) {
        if !self.transport.is_tcp() {
            return;
        }
        let channel = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(KEEPALIVE_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                if !channel.is_connected().await {
                    continue;
                }
                match channel
                    .read_registers(slave_id, RegisterType::Holding, 0, 1)
                    .await
                {
                    Ok(_) | Err(ChannelError::Exception(_)) => {}
                    Err(e) => {
                        debug!(channel = %channel.key, error = %e, "keep-alive read failed");
                    }
                }
            }
        });
    }
}

fn bools_to_words(bits: Vec<bool>) -> Vec<u16> {
    bits.into_iter().map(u16::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_code_mapping() {
        assert_eq!(
            ChannelError::NotConnected.quality_code(),
            QualityCode::DeviceOffline
        );
        assert_eq!(ChannelError::Timeout.quality_code(), QualityCode::Timeout);
        assert_eq!(
            ChannelError::Exception(Exception::ServerDeviceBusy).quality_code(),
            QualityCode::DeviceBusy
        );
        assert_eq!(
            ChannelError::Exception(Exception::IllegalDataAddress).quality_code(),
            QualityCode::IllegalAddress
        );
        assert_eq!(
            ChannelError::Transport("EPIPE".into()).quality_code(),
            QualityCode::DeviceOffline
        );
    }

    #[test]
    fn test_busy_classification() {
        assert!(ChannelError::Exception(Exception::Acknowledge).is_busy());
        assert!(ChannelError::Exception(Exception::ServerDeviceBusy).is_busy());
        assert!(!ChannelError::Exception(Exception::IllegalFunction).is_busy());
        assert!(!ChannelError::Timeout.is_busy());
    }

    #[test]
    fn test_shared_channel_registry_dedups() {
        let transport = ModbusTransport::Tcp {
            host: "Registry-Test-Host".into(),
            port: 1502,
        };
        let a = ModbusChannel::shared(transport.clone(), Duration::from_secs(1));
        let b = ModbusChannel::shared(transport, Duration::from_secs(1));
        assert!(Arc::ptr_eq(&a, &b));
    }
}
