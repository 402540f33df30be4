//! Serial Transport for ELM327 Adapters
//!
//! Line protocol: each command is written followed by `\r`, and the adapter
//! answers with text terminated by the `>` prompt.

use crate::command::CommandCode;
use crate::error::{CloseError, ConnectError, ExchangeError};
use crate::protocol::{init_sequence, ObdProtocol};
use crate::response::{clean_response, Response, PROMPT};
use crate::transport::{
    millis, ConnectAttempt, ConnectionState, Transport, TransportKind, DEFAULT_EXCHANGE_TIMEOUT_MS,
};
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

/// Pause after each initialization command so the adapter can settle
pub const INIT_COMMAND_DELAY: Duration = Duration::from_millis(100);

/// Serial link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Serial port device path (e.g., "/dev/ttyUSB0" or "COM3")
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Protocol selected during initialization
    pub protocol: ObdProtocol,
    /// Bound on one command/response exchange (ms)
    pub exchange_timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            protocol: ObdProtocol::Auto,
            exchange_timeout_ms: DEFAULT_EXCHANGE_TIMEOUT_MS,
        }
    }
}

impl SerialConfig {
    /// Exchange timeout as a `Duration`
    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_millis(self.exchange_timeout_ms)
    }
}

/// Opens the byte stream a [`SerialTransport`] talks over
#[async_trait]
pub trait PortOpener: Send + Sync {
    /// Stream type produced by this opener
    type Port: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open `path` at `baud_rate`
    async fn open(&self, path: &str, baud_rate: u32) -> io::Result<Self::Port>;
}

/// Opens real serial devices through `tokio-serial`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPortOpener;

#[async_trait]
impl PortOpener for SystemPortOpener {
    type Port = SerialStream;

    async fn open(&self, path: &str, baud_rate: u32) -> io::Result<SerialStream> {
        let port = tokio_serial::new(path, baud_rate).open_native_async()?;
        Ok(port)
    }
}

/// ELM327 transport over a serial byte stream
pub struct SerialTransport<O: PortOpener = SystemPortOpener> {
    config: SerialConfig,
    opener: O,
    port: Option<BufReader<O::Port>>,
    state: ConnectionState,
    /// Adapter banner returned by `ATZ`
    identity: Option<String>,
}

impl SerialTransport<SystemPortOpener> {
    /// Create a transport for a real serial device
    pub fn new(config: SerialConfig) -> Self {
        Self::with_opener(config, SystemPortOpener)
    }
}

impl<O: PortOpener> SerialTransport<O> {
    /// Create a transport that opens its port through `opener`
    pub fn with_opener(config: SerialConfig, opener: O) -> Self {
        info!(
            "Creating serial transport for {} @ {} baud",
            config.port, config.baud_rate
        );
        Self {
            config,
            opener,
            port: None,
            state: ConnectionState::Disconnected,
            identity: None,
        }
    }

    /// Adapter identification reported during reset, once connected
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// Configuration this transport was built with
    pub fn config(&self) -> &SerialConfig {
        &self.config
    }
}

#[async_trait]
impl<O: PortOpener> Transport for SerialTransport<O> {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    async fn connect(&mut self) -> Result<(), ConnectError> {
        let attempt = ConnectAttempt::begin(&mut self.state)?;

        debug!("Opening serial port: {}", self.config.port);
        let port = self
            .opener
            .open(&self.config.port, self.config.baud_rate)
            .await
            .map_err(|e| ConnectError::Open {
                target: self.config.port.clone(),
                reason: e.to_string(),
            })?;

        let mut port = BufReader::new(port);
        let identity = match initialize(&mut port, &self.config).await {
            Ok(identity) => identity,
            Err(e) => {
                warn!("Adapter initialization on {} failed: {}", self.config.port, e);
                let _ = port.shutdown().await;
                return Err(e);
            }
        };

        self.identity = identity;
        self.port = Some(port);
        attempt.complete();
        info!(
            "Serial adapter ready on {} ({})",
            self.config.port,
            self.identity.as_deref().unwrap_or("unknown adapter")
        );
        Ok(())
    }

    async fn close(&mut self) -> Result<(), CloseError> {
        let Some(mut port) = self.port.take() else {
            return Ok(());
        };
        self.state = ConnectionState::Closed;
        info!("Closing serial port: {}", self.config.port);
        port.shutdown()
            .await
            .map_err(|e| CloseError::Serial(e.to_string()))
    }

    async fn exchange(&mut self, command: &CommandCode) -> Result<Response, ExchangeError> {
        if self.state != ConnectionState::Connected {
            return Err(ExchangeError::NotConnected);
        }
        let port = self.port.as_mut().ok_or(ExchangeError::NotConnected)?;
        transact(port, command, self.config.exchange_timeout()).await
    }
}

/// Run the init sequence, returning the adapter banner from `ATZ`
async fn initialize<P>(
    port: &mut BufReader<P>,
    config: &SerialConfig,
) -> Result<Option<String>, ConnectError>
where
    P: AsyncRead + AsyncWrite + Unpin,
{
    let timeout = config.exchange_timeout();
    let mut identity = None;

    for command in init_sequence(config.protocol) {
        let response = transact(port, &command, timeout)
            .await
            .map_err(|source| ConnectError::Handshake {
                command: command.clone(),
                source,
            })?;
        debug!("Init {} -> {:?}", command, response);

        if command == CommandCode::RESET && !response.is_empty() {
            identity = Some(response);
        }

        tokio::time::sleep(INIT_COMMAND_DELAY).await;
    }

    Ok(identity)
}

/// Drop bytes already buffered or readable without waiting.
///
/// A reply that arrives after its exchange timed out would otherwise be read
/// as the answer to the next command.
fn discard_stale<P>(port: &mut BufReader<P>) -> usize
where
    P: AsyncRead + Unpin,
{
    let mut discarded = 0;
    loop {
        let available = match port.fill_buf().now_or_never() {
            Some(Ok(buf)) => buf.len(),
            _ => break,
        };
        if available == 0 {
            break;
        }
        port.consume(available);
        discarded += available;
    }
    discarded
}

/// Write `command` and read until the prompt, bounded by `timeout`
async fn transact<P>(
    port: &mut BufReader<P>,
    command: &CommandCode,
    timeout: Duration,
) -> Result<Response, ExchangeError>
where
    P: AsyncRead + AsyncWrite + Unpin,
{
    let stale = discard_stale(port);
    if stale > 0 {
        warn!("Discarded {} stale bytes before {}", stale, command);
    }

    let exchange = async {
        port.write_all(&command.to_frame())
            .await
            .map_err(|e| ExchangeError::Write(e.to_string()))?;
        port.flush()
            .await
            .map_err(|e| ExchangeError::Write(e.to_string()))?;

        let mut raw = Vec::new();
        port.read_until(PROMPT, &mut raw)
            .await
            .map_err(|e| ExchangeError::Read(e.to_string()))?;

        if raw.last() != Some(&PROMPT) {
            return Err(ExchangeError::Read(
                "stream ended before prompt".to_string(),
            ));
        }
        Ok(raw)
    };

    let raw = tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| ExchangeError::Timeout(millis(timeout)))??;

    let response = clean_response(command, &raw);
    debug!("{} -> {:?}", command, response);
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockPort, MockPortOpener};
    use tokio::io::DuplexStream;

    const INIT_REPLIES: &str = "ATZ\rOK\r>ATE0\rOK\r>ATL0\rOK\r>ATSP0\rOK\r>";

    fn transport_with(port: MockPort) -> SerialTransport<MockPortOpener> {
        let config = SerialConfig {
            port: "COM1".to_string(),
            baud_rate: 115200,
            ..Default::default()
        };
        SerialTransport::with_opener(config, MockPortOpener::new(port))
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_runs_init_sequence() {
        let port = MockPort::new(INIT_REPLIES);
        let written = port.written();
        let opener = MockPortOpener::new(port);
        let opened = opener.opened();
        let config = SerialConfig {
            port: "COM1".to_string(),
            baud_rate: 115200,
            ..Default::default()
        };
        let mut transport = SerialTransport::with_opener(config, opener);

        let started = tokio::time::Instant::now();
        transport.connect().await.unwrap();

        assert_eq!(transport.state(), ConnectionState::Connected);
        assert_eq!(written.text(), "ATZ\rATE0\rATL0\rATSP0\r");
        assert_eq!(*opened.lock().unwrap(), vec![("COM1".to_string(), 115200)]);
        assert!(started.elapsed() >= INIT_COMMAND_DELAY * 4);
        assert_eq!(transport.identity(), Some("OK"));
    }

    #[tokio::test]
    async fn test_each_init_exchange_returns_ok() {
        let mut port = BufReader::new(MockPort::new(INIT_REPLIES));
        let timeout = Duration::from_millis(DEFAULT_EXCHANGE_TIMEOUT_MS);

        for command in init_sequence(ObdProtocol::Auto) {
            let response = transact(&mut port, &command, timeout).await.unwrap();
            assert_eq!(response, "OK");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_failure_stops_sequence() {
        // No prompt after the ATE0 reply
        let port = MockPort::new("ATZ\rOK\r>ATE0\rOK\r");
        let written = port.written();
        let mut transport = transport_with(port);

        let err = transport.connect().await.unwrap_err();

        match err {
            ConnectError::Handshake { command, .. } => assert_eq!(command, CommandCode::ECHO_OFF),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(written.text(), "ATZ\rATE0\r");
        assert_eq!(transport.state(), ConnectionState::Disconnected);
        assert!(written.is_shut_down());
    }

    #[tokio::test]
    async fn test_open_failure_leaves_disconnected() {
        let mut transport = SerialTransport::with_opener(
            SerialConfig::default(),
            MockPortOpener::failing(io::ErrorKind::PermissionDenied),
        );

        let err = transport.connect().await.unwrap_err();

        assert!(matches!(err, ConnectError::Open { .. }));
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exchange_returns_cleaned_response() {
        let port = MockPort::new(&format!("{INIT_REPLIES}41 0C 1A F8\r\r>"));
        let written = port.written();
        let mut transport = transport_with(port);
        transport.connect().await.unwrap();

        let response = transport.exchange(&CommandCode::ENGINE_RPM).await.unwrap();

        assert_eq!(response, "41 0C 1A F8");
        assert!(written.text().ends_with("ATSP0\r010C\r"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exchange_times_out_without_prompt() {
        let port = MockPort::new(INIT_REPLIES).hold_open();
        let mut transport = transport_with(port);
        transport.connect().await.unwrap();

        let err = transport.exchange(&CommandCode::VEHICLE_SPEED).await.unwrap_err();

        assert_eq!(err, ExchangeError::Timeout(DEFAULT_EXCHANGE_TIMEOUT_MS));
    }

    /// Opener handing out one end of an in-memory duplex pipe
    struct DuplexOpener(std::sync::Mutex<Option<DuplexStream>>);

    #[async_trait]
    impl PortOpener for DuplexOpener {
        type Port = DuplexStream;

        async fn open(&self, _path: &str, _baud_rate: u32) -> io::Result<DuplexStream> {
            self.0
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
        }
    }

    /// Adapter that answers `010C` only after 2.5 s
    async fn slow_rpm_adapter(stream: DuplexStream) {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\r', &mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let reply = match String::from_utf8_lossy(&line).trim() {
                "010C" => {
                    tokio::time::sleep(Duration::from_millis(2500)).await;
                    "41 0C 1A F8\r>"
                }
                "010D" => "41 0D 32\r>",
                _ => "OK\r>",
            };
            if writer.write_all(reply.as_bytes()).await.is_err() {
                break;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_reply_is_not_taken_for_the_next_one() {
        let (host, device) = tokio::io::duplex(256);
        tokio::spawn(slow_rpm_adapter(device));
        let opener = DuplexOpener(std::sync::Mutex::new(Some(host)));
        let mut transport = SerialTransport::with_opener(SerialConfig::default(), opener);
        transport.connect().await.unwrap();

        let err = transport.exchange(&CommandCode::ENGINE_RPM).await.unwrap_err();
        assert_eq!(err, ExchangeError::Timeout(DEFAULT_EXCHANGE_TIMEOUT_MS));

        // The RPM reply lands while nobody is waiting for it
        tokio::time::sleep(Duration::from_secs(1)).await;

        let response = transport.exchange(&CommandCode::VEHICLE_SPEED).await.unwrap();
        assert_eq!(response, "41 0D 32");
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_connect_leaves_disconnected() {
        // Adapter never answers ATZ
        let mut transport = transport_with(MockPort::new("").hold_open());

        let attempt = tokio::time::timeout(Duration::from_millis(500), transport.connect()).await;

        assert!(attempt.is_err());
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_exchange_requires_connection() {
        let mut transport = transport_with(MockPort::new(INIT_REPLIES));

        let err = transport.exchange(&CommandCode::ENGINE_RPM).await.unwrap_err();

        assert_eq!(err, ExchangeError::NotConnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_idempotent() {
        let mut transport = transport_with(MockPort::new(INIT_REPLIES));
        transport.close().await.unwrap();
        assert_eq!(transport.state(), ConnectionState::Disconnected);

        transport.connect().await.unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap();

        assert_eq!(transport.state(), ConnectionState::Closed);
        assert_eq!(
            transport.exchange(&CommandCode::ENGINE_RPM).await.unwrap_err(),
            ExchangeError::NotConnected
        );
        assert!(matches!(transport.connect().await, Err(ConnectError::Closed)));
    }
}
