use serde::{Deserialize, Serialize};

use domain::DomainError;

use super::decode::WordOrder;

/// Modbus register table kinds (function-code families).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegisterType {
    Holding,
    Input,
    Coil,
    Discrete,
}

impl Default for RegisterType {
    fn default() -> Self {
        Self::Holding
    }
}

/// How to interpret the raw register words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    U16,
    I16,
    U32,
    I32,
    F32,
}

impl DataType {
    /// Registers occupied on the wire.
    pub fn register_count(&self) -> u16 {
        match self {
            Self::U16 | Self::I16 => 1,
            Self::U32 | Self::I32 | Self::F32 => 2,
        }
    }
}

impl Default for DataType {
    fn default() -> Self {
        Self::U16
    }
}

/// One register to acquire from a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterConfig {
    pub name: String,
    pub address: u16,
    #[serde(default)]
    pub register_type: RegisterType,
    #[serde(default)]
    pub data_type: DataType,
    #[serde(default)]
    pub word_order: WordOrder,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub unit: String,
}

fn default_scale() -> f64 {
    1.0
}

impl RegisterConfig {
    pub fn span(&self) -> u16 {
        match self.register_type {
            RegisterType::Coil | RegisterType::Discrete => 1,
            _ => self.data_type.register_count(),
        }
    }
}

/// Physical channel settings; one channel may be shared by several devices.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ModbusTransport {
    Serial {
        port: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        #[serde(default = "default_data_bits")]
        data_bits: u8,
        #[serde(default = "default_parity")]
        parity: String,
        #[serde(default = "default_stop_bits")]
        stop_bits: u8,
    },
    Tcp {
        host: String,
        #[serde(default = "default_tcp_port")]
        port: u16,
    },
}

fn default_baud_rate() -> u32 {
    9600
}
fn default_data_bits() -> u8 {
    8
}
fn default_parity() -> String {
    "None".to_string()
}
fn default_stop_bits() -> u8 {
    1
}
fn default_tcp_port() -> u16 {
    502
}

impl ModbusTransport {
    /// Case-insensitive key identifying the shared physical channel.
    pub fn channel_key(&self) -> String {
        match self {
            Self::Serial { port, .. } => format!("serial:{}", port.to_lowercase()),
            Self::Tcp { host, port } => format!("tcp:{}:{}", host.to_lowercase(), port),
        }
    }

    pub fn is_tcp(&self) -> bool {
        matches!(self, Self::Tcp { .. })
    }

    pub fn to_parity(&self) -> Result<tokio_serial::Parity, DomainError> {
        let Self::Serial { parity, .. } = self else {
            return Ok(tokio_serial::Parity::None);
        };
        match parity.to_lowercase().as_str() {
            "n" | "none" => Ok(tokio_serial::Parity::None),
            "o" | "odd" => Ok(tokio_serial::Parity::Odd),
            "e" | "even" => Ok(tokio_serial::Parity::Even),
            _ => Err(DomainError::InvalidConfiguration(format!(
                "Invalid parity: {parity}"
            ))),
        }
    }

    pub fn to_stop_bits(&self) -> Result<tokio_serial::StopBits, DomainError> {
        let Self::Serial { stop_bits, .. } = self else {
            return Ok(tokio_serial::StopBits::One);
        };
        match stop_bits {
            1 => Ok(tokio_serial::StopBits::One),
            2 => Ok(tokio_serial::StopBits::Two),
            _ => Err(DomainError::InvalidConfiguration(format!(
                "Invalid stop bits: {stop_bits}"
            ))),
        }
    }

    pub fn to_data_bits(&self) -> Result<tokio_serial::DataBits, DomainError> {
        let Self::Serial { data_bits, .. } = self else {
            return Ok(tokio_serial::DataBits::Eight);
        };
        match data_bits {
            5 => Ok(tokio_serial::DataBits::Five),
            6 => Ok(tokio_serial::DataBits::Six),
            7 => Ok(tokio_serial::DataBits::Seven),
            8 => Ok(tokio_serial::DataBits::Eight),
            _ => Err(DomainError::InvalidConfiguration(format!(
                "Invalid data bits: {data_bits}"
            ))),
        }
    }
}

/// One field device polled over a (possibly shared) channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusDeviceConfig {
    pub name: String,
    #[serde(flatten)]
    pub transport: ModbusTransport,
    pub slave_id: u8,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub registers: Vec<RegisterConfig>,
}

fn default_poll_interval_ms() -> u64 {
    5000
}
fn default_timeout_ms() -> u64 {
    1000
}

impl ModbusDeviceConfig {
    /// Parse a device entry from the target state's `config.sensors` list.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, DomainError> {
        serde_json::from_value(value.clone()).map_err(|e| {
            DomainError::InvalidConfiguration(format!("Invalid Modbus device config: {e}"))
        })
    }
}
