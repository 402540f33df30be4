//! OBD-II Link Error Types

use crate::command::CommandCode;
use thiserror::Error;

/// Errors raised while establishing a link to the adapter
#[derive(Debug, Clone, Error)]
pub enum ConnectError {
    /// No device with the configured address answered the scan
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// The port or radio could not be opened (missing device, permissions)
    #[error("Failed to open {target}: {reason}")]
    Open { target: String, reason: String },

    /// An initialization command failed
    #[error("Handshake failed on {command}: {source}")]
    Handshake {
        command: CommandCode,
        #[source]
        source: ExchangeError,
    },

    /// Link establishment did not finish in time
    #[error("Connect timed out after {0}ms")]
    Timeout(u64),

    /// Bluetooth stack error (adapter, link, GATT discovery)
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),

    /// `connect()` called on a link that is already up
    #[error("Transport already connected")]
    AlreadyConnected,

    /// `connect()` called after `close()`
    #[error("Transport has been closed")]
    Closed,
}

/// Errors raised by a single command/response exchange
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExchangeError {
    /// The transport is not in the `Connected` state
    #[error("Transport not connected")]
    NotConnected,

    /// Writing the command failed
    #[error("Write failed: {0}")]
    Write(String),

    /// Reading the response failed or the stream ended before the prompt
    #[error("Read failed: {0}")]
    Read(String),

    /// No prompt terminator arrived within the exchange timeout
    #[error("Timeout waiting for response after {0}ms")]
    Timeout(u64),
}

/// Errors raised while releasing a link
#[derive(Debug, Clone, Error)]
pub enum CloseError {
    /// Shutting the serial stream down failed
    #[error("Serial close failed: {0}")]
    Serial(String),

    /// Disconnecting the peripheral failed
    #[error("Bluetooth disconnect failed: {0}")]
    Bluetooth(String),
}
