//! Transport Abstraction
//!
//! A transport owns one physical link to an ELM327 adapter and moves
//! through `Disconnected -> Connecting -> Connected -> Closed`.

use crate::command::CommandCode;
use crate::error::{CloseError, ConnectError, ExchangeError};
use crate::response::Response;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Default bound on a single command/response exchange
pub const DEFAULT_EXCHANGE_TIMEOUT_MS: u64 = 2000;

/// Link lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not yet connected, or the last connect attempt failed
    Disconnected,
    /// Handshake in progress
    Connecting,
    /// Ready for exchanges
    Connected,
    /// Released; cannot be reconnected
    Closed,
}

impl ConnectionState {
    /// Reject a connect attempt from a state that does not allow it
    pub(crate) fn check_connectable(self) -> Result<(), ConnectError> {
        match self {
            ConnectionState::Disconnected => Ok(()),
            ConnectionState::Connecting | ConnectionState::Connected => {
                Err(ConnectError::AlreadyConnected)
            }
            ConnectionState::Closed => Err(ConnectError::Closed),
        }
    }
}

/// Keeps a transport `Connecting` for the duration of one connect attempt.
///
/// Unless [`ConnectAttempt::complete`] is called the state falls back to
/// `Disconnected` when the attempt is dropped, including when the connect
/// future itself is dropped mid-handshake.
pub(crate) struct ConnectAttempt<'a> {
    state: &'a mut ConnectionState,
    completed: bool,
}

impl<'a> ConnectAttempt<'a> {
    /// Check `state` allows connecting and move it to `Connecting`
    pub(crate) fn begin(state: &'a mut ConnectionState) -> Result<Self, ConnectError> {
        state.check_connectable()?;
        *state = ConnectionState::Connecting;
        Ok(Self {
            state,
            completed: false,
        })
    }

    /// Mark the link `Connected`
    pub(crate) fn complete(mut self) {
        *self.state = ConnectionState::Connected;
        self.completed = true;
    }
}

impl Drop for ConnectAttempt<'_> {
    fn drop(&mut self) {
        if !self.completed {
            *self.state = ConnectionState::Disconnected;
        }
    }
}

/// Physical medium behind a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// RS-232 / USB serial adapter
    Serial,
    /// Bluetooth Low Energy GATT adapter
    Bluetooth,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Serial => f.write_str("serial"),
            TransportKind::Bluetooth => f.write_str("bluetooth"),
        }
    }
}

/// Capability contract shared by every link to an ELM327 adapter
#[async_trait]
pub trait Transport: Send {
    /// Medium used by this transport
    fn kind(&self) -> TransportKind;

    /// Current lifecycle state
    fn state(&self) -> ConnectionState;

    /// Open the link and run the variant-specific handshake
    async fn connect(&mut self) -> Result<(), ConnectError>;

    /// Release the link. Closing an unopened or closed transport is a no-op.
    async fn close(&mut self) -> Result<(), CloseError>;

    /// Send one command and return the cleaned response
    async fn exchange(&mut self, command: &CommandCode) -> Result<Response, ExchangeError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    fn kind(&self) -> TransportKind {
        (**self).kind()
    }

    fn state(&self) -> ConnectionState {
        (**self).state()
    }

    async fn connect(&mut self) -> Result<(), ConnectError> {
        (**self).connect().await
    }

    async fn close(&mut self) -> Result<(), CloseError> {
        (**self).close().await
    }

    async fn exchange(&mut self, command: &CommandCode) -> Result<Response, ExchangeError> {
        (**self).exchange(command).await
    }
}

pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
