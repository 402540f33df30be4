//! ELM327 OBD-II Link Layer
//!
//! This crate talks to ELM327-compatible adapters over a serial port or a
//! Bluetooth LE GATT link. Both transports implement [`Transport`] and clean
//! replies identically, so a [`Commander`] can drive either one.

mod bluetooth;
mod command;
mod commander;
mod error;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
mod protocol;
mod response;
mod serial;
mod transport;

pub use bluetooth::{
    default_adapter, AdvertisementStream, BleAdapter, BleError, BluetoothConfig,
    BluetoothTransport, GattLink, GattProfile, PeripheralLink, DEFAULT_DISCOVERY_WINDOW_MS,
};
pub use command::CommandCode;
pub use commander::Commander;
pub use error::{CloseError, ConnectError, ExchangeError};
pub use protocol::{init_sequence, ObdProtocol};
pub use response::{clean_response, Response, PROMPT};
pub use serial::{PortOpener, SerialConfig, SerialTransport, SystemPortOpener, INIT_COMMAND_DELAY};
pub use transport::{ConnectionState, Transport, TransportKind, DEFAULT_EXCHANGE_TIMEOUT_MS};
