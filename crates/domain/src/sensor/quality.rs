use serde::{Deserialize, Serialize};

/// Sensor value quality indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Quality {
    /// Value is valid and trustworthy
    Good,
    /// Value is invalid; a quality code names the root cause
    Bad,
    /// Value quality is uncertain
    Uncertain,
}

impl Quality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Good => "GOOD",
            Self::Bad => "BAD",
            Self::Uncertain => "UNCERTAIN",
        }
    }

    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Good)
    }
}

impl Default for Quality {
    fn default() -> Self {
        Self::Uncertain
    }
}

/// Symbolic root cause carried by BAD frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QualityCode {
    DeviceOffline,
    Timeout,
    IllegalAddress,
    IllegalFunction,
    DeviceBusy,
    TransportError,
    ChannelClosed,
}

impl QualityCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeviceOffline => "DEVICE_OFFLINE",
            Self::Timeout => "TIMEOUT",
            Self::IllegalAddress => "ILLEGAL_ADDRESS",
            Self::IllegalFunction => "ILLEGAL_FUNCTION",
            Self::DeviceBusy => "DEVICE_BUSY",
            Self::TransportError => "TRANSPORT_ERROR",
            Self::ChannelClosed => "CHANNEL_CLOSED",
        }
    }
}
