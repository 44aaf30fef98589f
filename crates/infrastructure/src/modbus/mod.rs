mod batch;
mod channel;
mod config;
mod decode;
mod poller;

pub use batch::{ReadBlock, plan_blocks};
pub use channel::{ChannelError, ModbusChannel};
pub use config::{DataType, ModbusDeviceConfig, ModbusTransport, RegisterConfig, RegisterType};
pub use decode::{WordOrder, decode_value};
pub use poller::{CommunicationQuality, ModbusDevicePoller};
