//! Bluetooth LE Transport for ELM327 Adapters
//!
//! The adapter exposes one GATT service with a write characteristic for
//! commands and a read/notify characteristic for replies. Replies use the
//! same `>`-terminated framing as the serial line protocol.

use crate::command::CommandCode;
use crate::error::{CloseError, ConnectError, ExchangeError};
use crate::response::{clean_response, Response, PROMPT};
use crate::transport::{
    millis, ConnectAttempt, ConnectionState, Transport, TransportKind, DEFAULT_EXCHANGE_TIMEOUT_MS,
};
use async_trait::async_trait;
use btleplug::api::bleuuid::uuid_from_u16;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, ValueNotification, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::{BoxStream, Stream};
use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default time spent looking for the configured address
pub const DEFAULT_DISCOVERY_WINDOW_MS: u64 = 10_000;

/// Error reported by the Bluetooth stack
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct BleError(pub String);

impl BleError {
    /// Create an error from a message
    pub fn new(message: impl Into<String>) -> Self {
        BleError(message.into())
    }
}

impl From<btleplug::Error> for BleError {
    fn from(err: btleplug::Error) -> Self {
        BleError(err.to_string())
    }
}

/// GATT layout used for command exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattProfile {
    /// Service holding both characteristics
    pub service: Uuid,
    /// Characteristic commands are written to
    pub write: Uuid,
    /// Characteristic replies are read from or notified on
    pub read: Uuid,
}

/// Bluetooth link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Target device address (e.g., "00:1D:A5:68:98:8B"), matched case-insensitively
    pub address: String,
    /// Service UUID
    pub service_uuid: Uuid,
    /// Write characteristic UUID
    pub write_uuid: Uuid,
    /// Read/notify characteristic UUID
    pub read_uuid: Uuid,
    /// How long to scan for the target (ms)
    pub discovery_window_ms: u64,
    /// Bound on a single link-layer connection attempt (ms)
    pub connect_timeout_ms: u64,
    /// Bound on one command/response exchange (ms)
    pub exchange_timeout_ms: u64,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        // FFF0/FFF1/FFF2 is the layout used by most ELM327 BLE clones
        Self {
            address: String::new(),
            service_uuid: uuid_from_u16(0xFFF0),
            write_uuid: uuid_from_u16(0xFFF2),
            read_uuid: uuid_from_u16(0xFFF1),
            discovery_window_ms: DEFAULT_DISCOVERY_WINDOW_MS,
            connect_timeout_ms: 10_000,
            exchange_timeout_ms: DEFAULT_EXCHANGE_TIMEOUT_MS,
        }
    }
}

impl BluetoothConfig {
    /// Configuration for `address` with default GATT layout and timings
    pub fn for_address(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    /// GATT service and characteristics to use
    pub fn profile(&self) -> GattProfile {
        GattProfile {
            service: self.service_uuid,
            write: self.write_uuid,
            read: self.read_uuid,
        }
    }
}

/// Addresses of devices seen while scanning
pub type AdvertisementStream = BoxStream<'static, String>;

/// Local radio used to find and link to the adapter
#[async_trait]
pub trait BleAdapter: Send + Sync {
    /// Link produced by a successful connection
    type Link: GattLink;

    /// Make sure the radio is present and usable
    async fn check_radio(&self) -> Result<(), BleError>;

    /// Start scanning; yields the address of every advertisement seen
    async fn begin_scan(&self) -> Result<AdvertisementStream, BleError>;

    /// Stop scanning
    async fn end_scan(&self) -> Result<(), BleError>;

    /// Establish a link-layer connection to `address`
    async fn open_link(&self, address: &str) -> Result<Self::Link, BleError>;
}

/// Connected peripheral exposing the command characteristics
#[async_trait]
pub trait GattLink: Send {
    /// Resolve the characteristics of `profile`
    async fn discover(&mut self, profile: &GattProfile) -> Result<(), BleError>;

    /// Write to the command characteristic without waiting for an acknowledgement
    async fn write(&mut self, payload: &[u8]) -> Result<(), BleError>;

    /// Read the reply from the response characteristic
    async fn read(&mut self) -> Result<Vec<u8>, BleError>;

    /// Drop the link
    async fn disconnect(&mut self) -> Result<(), BleError>;
}

/// ELM327 transport over a Bluetooth LE GATT link
pub struct BluetoothTransport<A: BleAdapter = Adapter> {
    config: BluetoothConfig,
    adapter: A,
    link: Option<A::Link>,
    state: ConnectionState,
}

impl<A: BleAdapter> BluetoothTransport<A> {
    /// Create a transport that uses `adapter` for the lifetime of the link
    pub fn new(config: BluetoothConfig, adapter: A) -> Self {
        info!("Creating Bluetooth transport for {}", config.address);
        Self {
            config,
            adapter,
            link: None,
            state: ConnectionState::Disconnected,
        }
    }

    /// Configuration this transport was built with
    pub fn config(&self) -> &BluetoothConfig {
        &self.config
    }

    async fn establish(config: &BluetoothConfig, adapter: &A) -> Result<A::Link, ConnectError> {
        adapter
            .check_radio()
            .await
            .map_err(|e| ConnectError::Open {
                target: "bluetooth adapter".to_string(),
                reason: e.to_string(),
            })?;

        let mut advertisements = adapter
            .begin_scan()
            .await
            .map_err(|e| ConnectError::Bluetooth(format!("failed to start scan: {e}")))?;
        info!(
            "Scanning for {} ({}ms window)",
            config.address, config.discovery_window_ms
        );

        let window = Duration::from_millis(config.discovery_window_ms);
        let connect_timeout = Duration::from_millis(config.connect_timeout_ms);
        let mut last_failure = None;

        let search = async {
            while let Some(address) = advertisements.next().await {
                if !address.eq_ignore_ascii_case(&config.address) {
                    continue;
                }
                debug!("Found {}, connecting", address);
                match tokio::time::timeout(connect_timeout, adapter.open_link(&address)).await {
                    Ok(Ok(link)) => return Some(link),
                    Ok(Err(e)) => {
                        warn!("Link to {} failed: {}", address, e);
                        last_failure = Some(ConnectError::Bluetooth(format!(
                            "failed to connect to {address}: {e}"
                        )));
                    }
                    Err(_) => {
                        warn!("Link to {} timed out", address);
                        last_failure = Some(ConnectError::Timeout(millis(connect_timeout)));
                    }
                }
            }
            None
        };
        let found = tokio::time::timeout(window, search).await.ok().flatten();

        if let Err(e) = adapter.end_scan().await {
            warn!("Failed to stop scan: {}", e);
        }

        let mut link = match found {
            Some(link) => link,
            None => {
                return Err(last_failure
                    .unwrap_or_else(|| ConnectError::DeviceNotFound(config.address.clone())))
            }
        };

        if let Err(e) = link.discover(&config.profile()).await {
            let _ = link.disconnect().await;
            return Err(ConnectError::Bluetooth(format!(
                "characteristic discovery failed: {e}"
            )));
        }

        Ok(link)
    }
}

#[async_trait]
impl<A: BleAdapter> Transport for BluetoothTransport<A> {
    fn kind(&self) -> TransportKind {
        TransportKind::Bluetooth
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    async fn connect(&mut self) -> Result<(), ConnectError> {
        let attempt = ConnectAttempt::begin(&mut self.state)?;

        let link = Self::establish(&self.config, &self.adapter).await?;
        self.link = Some(link);
        attempt.complete();
        info!("Bluetooth adapter ready at {}", self.config.address);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), CloseError> {
        let Some(mut link) = self.link.take() else {
            return Ok(());
        };
        self.state = ConnectionState::Closed;
        info!("Disconnecting from {}", self.config.address);
        link.disconnect()
            .await
            .map_err(|e| CloseError::Bluetooth(e.to_string()))
    }

    async fn exchange(&mut self, command: &CommandCode) -> Result<Response, ExchangeError> {
        if self.state != ConnectionState::Connected {
            return Err(ExchangeError::NotConnected);
        }
        let link = self.link.as_mut().ok_or(ExchangeError::NotConnected)?;
        let timeout = Duration::from_millis(self.config.exchange_timeout_ms);

        let exchange = async {
            link.write(&command.to_frame())
                .await
                .map_err(|e| ExchangeError::Write(e.to_string()))?;
            link.read()
                .await
                .map_err(|e| ExchangeError::Read(e.to_string()))
        };
        let raw = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| ExchangeError::Timeout(millis(timeout)))??;

        let response = clean_response(command, &raw);
        debug!("{} -> {:?}", command, response);
        Ok(response)
    }
}

/// First Bluetooth adapter reported by the system
pub async fn default_adapter() -> Result<Adapter, ConnectError> {
    let manager = Manager::new()
        .await
        .map_err(|e| ConnectError::Bluetooth(format!("manager init failed: {e}")))?;
    let adapters = manager
        .adapters()
        .await
        .map_err(|e| ConnectError::Bluetooth(format!("failed to list adapters: {e}")))?;
    adapters.into_iter().next().ok_or_else(|| ConnectError::Open {
        target: "bluetooth adapter".to_string(),
        reason: "no adapter present".to_string(),
    })
}

#[async_trait]
impl BleAdapter for Adapter {
    type Link = PeripheralLink;

    async fn check_radio(&self) -> Result<(), BleError> {
        let info = self.adapter_info().await?;
        debug!("Using Bluetooth adapter {}", info);
        Ok(())
    }

    async fn begin_scan(&self) -> Result<AdvertisementStream, BleError> {
        let events = self.events().await?;
        self.start_scan(ScanFilter::default()).await?;

        let adapter = self.clone();
        let addresses = events.filter_map(move |event| {
            let adapter = adapter.clone();
            async move {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => return None,
                };
                let peripheral = adapter.peripheral(&id).await.ok()?;
                Some(peripheral.address().to_string())
            }
        });
        Ok(addresses.boxed())
    }

    async fn end_scan(&self) -> Result<(), BleError> {
        self.stop_scan().await?;
        Ok(())
    }

    async fn open_link(&self, address: &str) -> Result<PeripheralLink, BleError> {
        let peripheral = self
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.address().to_string().eq_ignore_ascii_case(address))
            .ok_or_else(|| BleError(format!("peripheral {address} no longer visible")))?;
        peripheral.connect().await?;
        Ok(PeripheralLink::new(peripheral))
    }
}

/// `btleplug` peripheral bound to the command characteristics
pub struct PeripheralLink {
    peripheral: Peripheral,
    write_char: Option<Characteristic>,
    read_char: Option<Characteristic>,
    /// Present when the read characteristic notifies
    notifications: Option<BoxStream<'static, ValueNotification>>,
}

impl PeripheralLink {
    fn new(peripheral: Peripheral) -> Self {
        Self {
            peripheral,
            write_char: None,
            read_char: None,
            notifications: None,
        }
    }
}

#[async_trait]
impl GattLink for PeripheralLink {
    async fn discover(&mut self, profile: &GattProfile) -> Result<(), BleError> {
        self.peripheral.discover_services().await?;

        let characteristics = self.peripheral.characteristics();
        let find = |uuid: Uuid| {
            characteristics
                .iter()
                .find(|c| c.service_uuid == profile.service && c.uuid == uuid)
                .cloned()
                .ok_or_else(|| BleError(format!("characteristic {uuid} not found")))
        };
        let write_char = find(profile.write)?;
        let read_char = find(profile.read)?;

        if read_char
            .properties
            .intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE)
        {
            self.peripheral.subscribe(&read_char).await?;
            self.notifications = Some(self.peripheral.notifications().await?);
        }

        self.write_char = Some(write_char);
        self.read_char = Some(read_char);
        Ok(())
    }

    async fn write(&mut self, payload: &[u8]) -> Result<(), BleError> {
        let write_char = self
            .write_char
            .as_ref()
            .ok_or_else(|| BleError::new("write characteristic not discovered"))?;
        if let Some(notifications) = self.notifications.as_mut() {
            let stale = discard_pending(notifications);
            if stale > 0 {
                warn!("Discarded {} stale notification bytes", stale);
            }
        }
        self.peripheral
            .write(write_char, payload, WriteType::WithoutResponse)
            .await?;
        Ok(())
    }

    async fn read(&mut self) -> Result<Vec<u8>, BleError> {
        let read_char = self
            .read_char
            .as_ref()
            .ok_or_else(|| BleError::new("read characteristic not discovered"))?;

        let Some(notifications) = self.notifications.as_mut() else {
            return Ok(self.peripheral.read(read_char).await?);
        };

        collect_reply(notifications, read_char.uuid).await
    }

    async fn disconnect(&mut self) -> Result<(), BleError> {
        self.notifications = None;
        self.peripheral.disconnect().await?;
        Ok(())
    }
}

/// Drop notifications already queued without waiting, returning the bytes dropped
fn discard_pending<S>(notifications: &mut S) -> usize
where
    S: Stream<Item = ValueNotification> + Unpin,
{
    let mut discarded = 0;
    while let Some(Some(notification)) = notifications.next().now_or_never() {
        discarded += notification.value.len();
    }
    discarded
}

/// Accumulate chunks notified on `uuid` up to and including the prompt.
///
/// Long replies arrive split over several notifications. Anything after the
/// prompt in the final chunk is dropped.
async fn collect_reply<S>(notifications: &mut S, uuid: Uuid) -> Result<Vec<u8>, BleError>
where
    S: Stream<Item = ValueNotification> + Unpin,
{
    let mut raw = Vec::new();
    while let Some(notification) = notifications.next().await {
        if notification.uuid != uuid {
            continue;
        }
        raw.extend_from_slice(&notification.value);
        if let Some(end) = raw.iter().position(|&b| b == PROMPT) {
            raw.truncate(end + 1);
            return Ok(raw);
        }
    }
    Err(BleError::new("notification stream ended"))
}
