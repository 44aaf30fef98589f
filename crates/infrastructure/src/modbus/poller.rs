use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use domain::sensor::{QualityCode, SensorFrame};

use super::batch::{ReadBlock, plan_blocks};
use super::channel::{ChannelError, ModbusChannel};
use super::config::{ModbusDeviceConfig, RegisterConfig, RegisterType};
use super::decode::decode_value;

const BUSY_RETRIES: u32 = 3;
const BUSY_RETRY_DELAY: Duration = Duration::from_millis(100);
const HISTORY_LEN: usize = 100;

/// Rolled-up link quality over the last 100 poll attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommunicationQuality {
    Good,
    Degraded,
    Poor,
    Offline,
}

impl CommunicationQuality {
    pub fn from_ratio(ratio: f64) -> Self {
        if ratio >= 0.95 {
            Self::Good
        } else if ratio >= 0.75 {
            Self::Degraded
        } else if ratio > 0.0 {
            Self::Poor
        } else {
            Self::Offline
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Good => "good",
            Self::Degraded => "degraded",
            Self::Poor => "poor",
            Self::Offline => "offline",
        }
    }
}

/// Polls one field device: batched reads over the shared channel, busy
/// retries, and BAD-frame emission with symbolic quality codes.
pub struct ModbusDevicePoller {
    config: ModbusDeviceConfig,
    channel: Arc<ModbusChannel>,
    blocks: Vec<ReadBlock>,
    history: VecDeque<bool>,
}

impl ModbusDevicePoller {
    pub fn new(config: ModbusDeviceConfig, channel: Arc<ModbusChannel>) -> Self {
        let blocks = plan_blocks(&config.registers);
        debug!(
            device = %config.name,
            registers = config.registers.len(),
            blocks = blocks.len(),
            "planned register blocks"
        );
        Self {
            config,
            channel,
            blocks,
            history: VecDeque::with_capacity(HISTORY_LEN),
        }
    }

    pub fn device_name(&self) -> &str {
        &self.config.name
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.poll_interval_ms)
    }

    pub fn channel(&self) -> &Arc<ModbusChannel> {
        &self.channel
    }

    fn record(&mut self, success: bool) {
        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(success);
    }

    pub fn success_ratio(&self) -> f64 {
        if self.history.is_empty() {
            return 0.0;
        }
        let ok = self.history.iter().filter(|s| **s).count();
        ok as f64 / self.history.len() as f64
    }

    pub async fn communication_quality(&self) -> CommunicationQuality {
        if !self.channel.is_connected().await {
            return CommunicationQuality::Offline;
        }
        CommunicationQuality::from_ratio(self.success_ratio())
    }

    async fn read_with_retry(
        &self,
        register_type: RegisterType,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, ChannelError> {
        let mut attempt = 0;
        loop {
            match self
                .channel
                .read_registers(self.config.slave_id, register_type, address, count)
                .await
            {
                Err(e) if e.is_busy() && attempt < BUSY_RETRIES => {
                    attempt += 1;
                    debug!(
                        device = %self.config.name,
                        address,
                        attempt,
                        "device busy, retrying"
                    );
                    tokio::time::sleep(BUSY_RETRY_DELAY).await;
                }
                other => return other,
            }
        }
    }

    fn frame_for(&self, register: &RegisterConfig, words: &[u16]) -> SensorFrame {
        match decode_value(words, register.data_type, register.word_order) {
            Some(raw) => SensorFrame::good(
                &self.config.name,
                &register.name,
                raw * register.scale + register.offset,
                &register.unit,
            ),
            None => SensorFrame::bad(
                &self.config.name,
                &register.name,
                &register.unit,
                QualityCode::TransportError,
            ),
        }
    }

    /// Read every configured register once and emit one batch of frames.
    pub async fn poll_once(&mut self) -> Vec<SensorFrame> {
        let mut frames = Vec::with_capacity(self.config.registers.len());

        // Clone the plan so `record` can borrow self mutably inside the loop.
        let blocks = self.blocks.clone();

        for block in &blocks {
            match self
                .read_with_retry(block.register_type, block.start, block.count)
                .await
            {
                Ok(words) => {
                    for register in &block.registers {
                        match block.slice(&words, register) {
                            Some(slice) => {
                                let frame = self.frame_for(register, slice);
                                self.record(frame.quality.is_usable());
                                frames.push(frame);
                            }
                            None => {
                                self.record(false);
                                frames.push(SensorFrame::bad(
                                    &self.config.name,
                                    &register.name,
                                    &register.unit,
                                    QualityCode::TransportError,
                                ));
                            }
                        }
                    }
                }
                Err(e @ ChannelError::Exception(_)) if block.registers.len() == 1 => {
                    let register = &block.registers[0];
                    self.record(false);
                    frames.push(SensorFrame::bad(
                        &self.config.name,
                        &register.name,
                        &register.unit,
                        e.quality_code(),
                    ));
                }
                Err(e @ ChannelError::Exception(_)) => {
                    // A batch may straddle an unmapped gap register; fall
                    // back to reading each member individually.
                    debug!(
                        device = %self.config.name,
                        start = block.start,
                        error = %e,
                        "batch read failed, falling back to single reads"
                    );
                    for register in &block.registers {
                        let frame = match self
                            .read_with_retry(
                                register.register_type,
                                register.address,
                                register.span(),
                            )
                            .await
                        {
                            Ok(words) => self.frame_for(register, &words),
                            Err(e) => SensorFrame::bad(
                                &self.config.name,
                                &register.name,
                                &register.unit,
                                e.quality_code(),
                            ),
                        };
                        self.record(frame.quality.is_usable());
                        frames.push(frame);
                    }
                }
                Err(e) => {
                    // Channel-level failure: one BAD frame per register in
                    // the block, no fallback.
                    warn!(
                        device = %self.config.name,
                        start = block.start,
                        error = %e,
                        "block read failed"
                    );
                    let code = e.quality_code();
                    for register in &block.registers {
                        self.record(false);
                        frames.push(SensorFrame::bad(
                            &self.config.name,
                            &register.name,
                            &register.unit,
                            code,
                        ));
                    }
                }
            }
        }

        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_thresholds() {
        assert_eq!(
            CommunicationQuality::from_ratio(1.0),
            CommunicationQuality::Good
        );
        assert_eq!(
            CommunicationQuality::from_ratio(0.95),
            CommunicationQuality::Good
        );
        assert_eq!(
            CommunicationQuality::from_ratio(0.80),
            CommunicationQuality::Degraded
        );
        assert_eq!(
            CommunicationQuality::from_ratio(0.5),
            CommunicationQuality::Poor
        );
        assert_eq!(
            CommunicationQuality::from_ratio(0.0),
            CommunicationQuality::Offline
        );
    }

    #[test]
    fn test_history_is_bounded() {
        let config = ModbusDeviceConfig {
            name: "dev".into(),
            transport: super::super::config::ModbusTransport::Tcp {
                host: "h".into(),
                port: 502,
            },
            slave_id: 1,
            poll_interval_ms: 1000,
            timeout_ms: 1000,
            registers: vec![],
        };
        let channel = ModbusChannel::shared(config.transport.clone(), Duration::from_secs(1));
        let mut poller = ModbusDevicePoller::new(config, channel);

        for _ in 0..250 {
            poller.record(true);
        }
        poller.record(false);
        assert_eq!(poller.history.len(), HISTORY_LEN);
        assert!(poller.success_ratio() < 1.0);
    }
}
