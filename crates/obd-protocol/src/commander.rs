//! Command Execution Façade
//!
//! The [`Commander`] owns the single transport of a session. Callers share it
//! through an `Arc`; the internal mutex guarantees only one exchange is on the
//! wire at a time, since ELM327 links are strictly request/response.

use crate::command::CommandCode;
use crate::error::{CloseError, ConnectError, ExchangeError};
use crate::response::Response;
use crate::transport::{ConnectionState, Transport, TransportKind};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Executes commands over one transport
pub struct Commander {
    transport: Mutex<Box<dyn Transport>>,
    kind: TransportKind,
}

impl Commander {
    /// Bind `transport` to a new commander
    pub fn new<T: Transport + 'static>(transport: T) -> Self {
        Self::from_boxed(Box::new(transport))
    }

    /// Bind an already boxed transport
    pub fn from_boxed(transport: Box<dyn Transport>) -> Self {
        let kind = transport.kind();
        info!("Creating commander over {} transport", kind);
        Self {
            transport: Mutex::new(transport),
            kind,
        }
    }

    /// Medium of the bound transport
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Current state of the bound transport
    pub async fn state(&self) -> ConnectionState {
        self.transport.lock().await.state()
    }

    /// Connect the bound transport
    pub async fn connect(&self) -> Result<(), ConnectError> {
        self.transport.lock().await.connect().await
    }

    /// Close the bound transport
    pub async fn close(&self) -> Result<(), CloseError> {
        self.transport.lock().await.close().await
    }

    /// Execute a single command and return the transport's result unchanged
    pub async fn execute_command(&self, command: &CommandCode) -> Result<Response, ExchangeError> {
        let mut transport = self.transport.lock().await;
        debug!("Executing {}", command);
        transport.exchange(command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockPort, MockPortOpener, MockTransport};
    use crate::serial::{SerialConfig, SerialTransport};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_success_passes_through() {
        let transport = MockTransport::connected().reply(CommandCode::ENGINE_RPM, "1234 RPM");
        let commander = Commander::new(transport);

        let result = commander.execute_command(&CommandCode::ENGINE_RPM).await;

        assert_eq!(result, Ok("1234 RPM".to_string()));
    }

    #[tokio::test]
    async fn test_error_passes_through() {
        let transport = MockTransport::connected()
            .fail(CommandCode::VEHICLE_SPEED, ExchangeError::Timeout(2000));
        let commander = Commander::new(transport);

        let result = commander.execute_command(&CommandCode::VEHICLE_SPEED).await;

        assert_eq!(result, Err(ExchangeError::Timeout(2000)));
    }

    #[tokio::test]
    async fn test_not_connected_passes_through() {
        let commander = Commander::new(MockTransport::new());

        let result = commander.execute_command(&CommandCode::ENGINE_RPM).await;

        assert_eq!(result, Err(ExchangeError::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rpm_over_serial() {
        let port = MockPort::new("ATZ\rOK\r>ATE0\rOK\r>ATL0\rOK\r>ATSP0\rOK\r>41 0C 1A F8\r>");
        let transport =
            SerialTransport::with_opener(SerialConfig::default(), MockPortOpener::new(port));
        let commander = Commander::new(transport);
        commander.connect().await.unwrap();

        let response = commander.execute_command(&"010C".into()).await.unwrap();

        assert_eq!(response, "41 0C 1A F8");
        assert_eq!(commander.state().await, ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_are_serialized() {
        let transport = MockTransport::connected().latency(Duration::from_millis(50));
        let probe = transport.probe();
        let commander = Arc::new(Commander::new(transport));

        let handles: Vec<_> = [
            CommandCode::ENGINE_RPM,
            CommandCode::VEHICLE_SPEED,
            CommandCode::THROTTLE_POSITION,
            CommandCode::COOLANT_TEMPERATURE,
        ]
        .into_iter()
        .map(|pid| {
            let commander = Arc::clone(&commander);
            tokio::spawn(async move { commander.execute_command(&pid).await })
        })
        .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(probe.calls().len(), 4);
        assert_eq!(probe.overlaps(), 0);
    }

    #[tokio::test]
    async fn test_close_is_delegated() {
        let transport = MockTransport::connected();
        let probe = transport.probe();
        let commander = Commander::new(transport);

        commander.close().await.unwrap();
        commander.close().await.unwrap();

        assert_eq!(probe.closes(), 1);
        assert_eq!(commander.state().await, ConnectionState::Closed);
    }
}
