//! In-memory test doubles
//!
//! [`MockPort`]/[`MockPortOpener`] stand in for a serial device,
//! [`MockBleAdapter`] for a Bluetooth radio, and [`MockTransport`] for a whole
//! link with scripted replies.

use crate::bluetooth::{AdvertisementStream, BleAdapter, BleError, GattLink, GattProfile};
use crate::command::CommandCode;
use crate::error::{CloseError, ConnectError, ExchangeError};
use crate::response::{Response, PROMPT};
use crate::serial::PortOpener;
use crate::transport::{ConnectionState, Transport, TransportKind};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Bytes written to a [`MockPort`], readable after the port moved into a transport
#[derive(Debug, Clone, Default)]
pub struct WrittenBytes {
    bytes: Arc<Mutex<Vec<u8>>>,
    shut_down: Arc<AtomicBool>,
}

impl WrittenBytes {
    /// Everything written so far, as text
    pub fn text(&self) -> String {
        let bytes = self.bytes.lock().unwrap_or_else(|e| e.into_inner());
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Whether the port was shut down
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

/// Serial stream that answers each written command with the next seeded reply.
///
/// The seed is split after every `>` prompt. A reply becomes readable only
/// once a command frame (`\r`) has been written, the way a real adapter only
/// talks when spoken to.
#[derive(Debug)]
pub struct MockPort {
    replies: VecDeque<Vec<u8>>,
    readable: VecDeque<u8>,
    written: WrittenBytes,
    reader: Option<Waker>,
    /// When set, an exhausted port stays pending instead of reporting EOF
    hold_open: bool,
}

impl MockPort {
    /// Port answering commands with the replies in `script`, then EOF
    pub fn new(script: &str) -> Self {
        let replies = script
            .as_bytes()
            .split_inclusive(|&b| b == PROMPT)
            .map(<[u8]>::to_vec)
            .collect();
        Self {
            replies,
            readable: VecDeque::new(),
            written: WrittenBytes::default(),
            reader: None,
            hold_open: false,
        }
    }

    /// Keep reads pending once the seeded replies are consumed
    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    /// Handle to the bytes written to this port
    pub fn written(&self) -> WrittenBytes {
        self.written.clone()
    }
}

impl AsyncRead for MockPort {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.readable.is_empty() {
            if !this.replies.is_empty() || this.hold_open {
                this.reader = Some(cx.waker().clone());
                return Poll::Pending;
            }
            return Poll::Ready(Ok(()));
        }
        let n = buf.remaining().min(this.readable.len());
        let chunk: Vec<u8> = this.readable.drain(..n).collect();
        buf.put_slice(&chunk);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MockPort {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.written
            .bytes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(data);

        for _ in data.iter().filter(|&&b| b == b'\r') {
            if let Some(reply) = this.replies.pop_front() {
                this.readable.extend(reply);
            }
        }
        if let Some(reader) = this.reader.take() {
            reader.wake();
        }
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.written.shut_down.store(true, Ordering::SeqCst);
        Poll::Ready(Ok(()))
    }
}

/// Hands out one [`MockPort`], or fails every open with a fixed error kind
#[derive(Debug)]
pub struct MockPortOpener {
    port: Mutex<Option<MockPort>>,
    failure: Option<io::ErrorKind>,
    opened: Arc<Mutex<Vec<(String, u32)>>>,
}

impl MockPortOpener {
    /// Opener yielding `port` on the first open
    pub fn new(port: MockPort) -> Self {
        Self {
            port: Mutex::new(Some(port)),
            failure: None,
            opened: Arc::default(),
        }
    }

    /// Opener whose every open fails with `kind`
    pub fn failing(kind: io::ErrorKind) -> Self {
        Self {
            port: Mutex::new(None),
            failure: Some(kind),
            opened: Arc::default(),
        }
    }

    /// `(path, baud_rate)` of every open attempt
    pub fn opened(&self) -> Arc<Mutex<Vec<(String, u32)>>> {
        Arc::clone(&self.opened)
    }
}

#[async_trait]
impl PortOpener for MockPortOpener {
    type Port = MockPort;

    async fn open(&self, path: &str, baud_rate: u32) -> io::Result<MockPort> {
        self.opened
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((path.to_string(), baud_rate));
        if let Some(kind) = self.failure {
            return Err(io::Error::new(kind, format!("cannot open {path}")));
        }
        self.port
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "port already taken"))
    }
}

/// Everything a [`MockBleAdapter`] and its links observed
#[derive(Debug, Default)]
pub struct MockBleLog {
    /// Addresses a link was opened to
    pub links_opened: Vec<String>,
    /// Payloads written to the command characteristic
    pub writes: Vec<Vec<u8>>,
    /// Whether the scan was stopped
    pub scan_stopped: bool,
    /// Whether a link was disconnected
    pub disconnected: bool,
}

#[derive(Debug, Default)]
struct MockBleShared {
    log: Arc<Mutex<MockBleLog>>,
    replies: Mutex<VecDeque<Vec<u8>>>,
}

/// Bluetooth radio that advertises a fixed set of addresses
#[derive(Debug, Clone)]
pub struct MockBleAdapter {
    advertised: Vec<String>,
    fail_discovery: bool,
    shared: Arc<MockBleShared>,
}

impl MockBleAdapter {
    /// Radio that sees `advertised` once each, then nothing more
    pub fn new<I, S>(advertised: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            advertised: advertised.into_iter().map(Into::into).collect(),
            fail_discovery: false,
            shared: Arc::default(),
        }
    }

    /// Queue a raw reply for the next read
    pub fn reply(self, raw: Vec<u8>) -> Self {
        self.shared
            .replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(raw);
        self
    }

    /// Make characteristic discovery fail on every link
    pub fn fail_discovery(mut self) -> Self {
        self.fail_discovery = true;
        self
    }

    /// Shared log of observed operations
    pub fn log(&self) -> Arc<Mutex<MockBleLog>> {
        Arc::clone(&self.shared.log)
    }

    fn record(&self, f: impl FnOnce(&mut MockBleLog)) {
        f(&mut self.shared.log.lock().unwrap_or_else(|e| e.into_inner()));
    }
}

#[async_trait]
impl BleAdapter for MockBleAdapter {
    type Link = MockGattLink;

    async fn check_radio(&self) -> Result<(), BleError> {
        Ok(())
    }

    async fn begin_scan(&self) -> Result<AdvertisementStream, BleError> {
        let seen = futures::stream::iter(self.advertised.clone());
        Ok(seen.chain(futures::stream::pending()).boxed())
    }

    async fn end_scan(&self) -> Result<(), BleError> {
        self.record(|log| log.scan_stopped = true);
        Ok(())
    }

    async fn open_link(&self, address: &str) -> Result<MockGattLink, BleError> {
        self.record(|log| log.links_opened.push(address.to_string()));
        Ok(MockGattLink {
            adapter: self.clone(),
        })
    }
}

/// Link handed out by [`MockBleAdapter`]
#[derive(Debug)]
pub struct MockGattLink {
    adapter: MockBleAdapter,
}

#[async_trait]
impl GattLink for MockGattLink {
    async fn discover(&mut self, _profile: &GattProfile) -> Result<(), BleError> {
        if self.adapter.fail_discovery {
            return Err(BleError::new("service not found"));
        }
        Ok(())
    }

    async fn write(&mut self, payload: &[u8]) -> Result<(), BleError> {
        self.adapter.record(|log| log.writes.push(payload.to_vec()));
        Ok(())
    }

    async fn read(&mut self) -> Result<Vec<u8>, BleError> {
        let next = self
            .adapter
            .shared
            .replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match next {
            Some(raw) => Ok(raw),
            None => futures::future::pending().await,
        }
    }

    async fn disconnect(&mut self) -> Result<(), BleError> {
        self.adapter.record(|log| log.disconnected = true);
        Ok(())
    }
}

/// Observations shared between a [`MockTransport`] and the test holding it
#[derive(Debug, Clone, Default)]
pub struct MockProbe {
    calls: Arc<Mutex<Vec<CommandCode>>>,
    in_flight: Arc<AtomicBool>,
    overlaps: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

impl MockProbe {
    /// Commands exchanged so far, in order
    pub fn calls(&self) -> Vec<CommandCode> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of exchanges that started while another was still running
    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    /// Number of `close()` calls that released a link
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Transport with scripted per-command replies
#[derive(Debug)]
pub struct MockTransport {
    state: ConnectionState,
    replies: HashMap<CommandCode, Result<Response, ExchangeError>>,
    connect_failure: Option<ConnectError>,
    latency: Duration,
    probe: MockProbe,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Disconnected transport answering `NO DATA` to unscripted commands
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            replies: HashMap::new(),
            connect_failure: None,
            latency: Duration::ZERO,
            probe: MockProbe::default(),
        }
    }

    /// Transport that starts out connected
    pub fn connected() -> Self {
        Self {
            state: ConnectionState::Connected,
            ..Self::new()
        }
    }

    /// Answer `command` with `response`
    pub fn reply(mut self, command: CommandCode, response: impl Into<Response>) -> Self {
        self.replies.insert(command, Ok(response.into()));
        self
    }

    /// Fail every exchange of `command` with `error`
    pub fn fail(mut self, command: CommandCode, error: ExchangeError) -> Self {
        self.replies.insert(command, Err(error));
        self
    }

    /// Make `connect()` fail with `error`
    pub fn fail_connect(mut self, error: ConnectError) -> Self {
        self.connect_failure = Some(error);
        self
    }

    /// Delay every exchange by `latency`
    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Handle for inspecting calls after the transport moved
    pub fn probe(&self) -> MockProbe {
        self.probe.clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    async fn connect(&mut self) -> Result<(), ConnectError> {
        self.state.check_connectable()?;
        if let Some(error) = self.connect_failure.clone() {
            return Err(error);
        }
        self.state = ConnectionState::Connected;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), CloseError> {
        if self.state == ConnectionState::Connected {
            self.state = ConnectionState::Closed;
            self.probe.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn exchange(&mut self, command: &CommandCode) -> Result<Response, ExchangeError> {
        if self.state != ConnectionState::Connected {
            return Err(ExchangeError::NotConnected);
        }
        self.probe
            .calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(command.clone());

        if self.probe.in_flight.swap(true, Ordering::SeqCst) {
            self.probe.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        let _guard = InFlight(&self.probe.in_flight);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        self.replies
            .get(command)
            .cloned()
            .unwrap_or_else(|| Ok("NO DATA".to_string()))
    }
}
