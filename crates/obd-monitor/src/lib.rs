//! ELM327 Live Monitor
//!
//! Wires a configured transport into a [`Commander`], connects it, and polls
//! the configured PIDs until the shutdown token fires.

pub mod config;
pub mod sink;

pub use config::{ConfigError, MonitorConfig};
pub use sink::LogSink;

use anyhow::Context;
use obd_protocol::{
    default_adapter, BluetoothTransport, CommandCode, Commander, ConnectError, SerialTransport,
    Transport, TransportKind,
};
use obd_scheduler::{PidSink, PollingConfig, PollingEngine};
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Initialize logging at `level`
pub fn init_logging(level: &str) -> anyhow::Result<()> {
    let level = Level::from_str(level)
        .with_context(|| format!("unknown log level '{level}'"))?;
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")
}

/// Build the transport selected by `config`
pub async fn build_transport(config: &MonitorConfig) -> Result<Box<dyn Transport>, ConnectError> {
    let transport: Box<dyn Transport> = match config.transport {
        TransportKind::Serial => Box::new(SerialTransport::new(config.serial.clone())),
        TransportKind::Bluetooth => {
            let adapter = default_adapter().await?;
            Box::new(BluetoothTransport::new(config.bluetooth.clone(), adapter))
        }
    };
    Ok(transport)
}

/// Connect, poll `pids` until `shutdown` fires, then close the link.
///
/// A connect failure aborts before any polling starts.
pub async fn monitor(
    commander: Arc<Commander>,
    pids: Vec<CommandCode>,
    polling: PollingConfig,
    sink: Arc<dyn PidSink>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    info!("Connecting over {} transport", commander.kind());
    tokio::select! {
        () = shutdown.cancelled() => {
            info!("Shutdown requested before the link came up");
            return Ok(());
        }
        result = commander.connect() => {
            result.context("failed to connect to the adapter")?;
        }
    }
    info!("Adapter connected");

    let engine = PollingEngine::start(
        Arc::clone(&commander),
        pids,
        polling,
        sink,
        shutdown.clone(),
    );
    match engine {
        Ok(engine) => engine.wait().await,
        Err(e) => {
            close_link(&commander).await;
            return Err(e).context("failed to start polling");
        }
    }

    close_link(&commander).await;
    Ok(())
}

async fn close_link(commander: &Commander) {
    match commander.close().await {
        Ok(()) => info!("Link closed"),
        Err(e) => warn!("Failed to close link: {}", e),
    }
}

/// Run the monitor described by `config` until `shutdown` fires
pub async fn run(config: MonitorConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    let transport = build_transport(&config)
        .await
        .context("failed to create transport")?;
    let commander = Arc::new(Commander::from_boxed(transport));
    let polling = config.polling();

    monitor(commander, config.pids, polling, Arc::new(LogSink), shutdown).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_protocol::mock::{MockPort, MockPortOpener, MockTransport};
    use obd_protocol::{ConnectionState, SerialConfig};
    use obd_scheduler::ChannelSink;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_skips_polling() {
        let transport = MockTransport::new().fail_connect(ConnectError::DeviceNotFound(
            "00:1D:A5:68:98:8B".to_string(),
        ));
        let probe = transport.probe();
        let commander = Arc::new(Commander::new(transport));
        let (sink, mut rx) = ChannelSink::channel();

        let result = monitor(
            Arc::clone(&commander),
            vec![CommandCode::ENGINE_RPM],
            PollingConfig::default(),
            Arc::new(sink),
            CancellationToken::new(),
        )
        .await;

        assert!(result.is_err());
        assert!(probe.calls().is_empty());
        assert!(rx.recv().await.is_none());
        assert_eq!(commander.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_until_shutdown_then_closes() {
        let transport = MockTransport::new().reply(CommandCode::ENGINE_RPM, "41 0C 1A F8");
        let probe = transport.probe();
        let commander = Arc::new(Commander::new(transport));
        let (sink, mut rx) = ChannelSink::channel();
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(monitor(
            Arc::clone(&commander),
            vec![CommandCode::ENGINE_RPM],
            PollingConfig::default(),
            Arc::new(sink),
            shutdown.clone(),
        ));

        let update = rx.recv().await.unwrap();
        assert_eq!(update.text, "Data: 41 0C 1A F8");

        shutdown.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(probe.closes(), 1);
        assert_eq!(commander.state().await, ConnectionState::Closed);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_before_connect_is_clean() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let (sink, _rx) = ChannelSink::channel();

        let result = monitor(
            Arc::new(Commander::new(MockTransport::new())),
            vec![CommandCode::ENGINE_RPM],
            PollingConfig::default(),
            Arc::new(sink),
            shutdown,
        )
        .await;

        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_handshake_leaves_link_reusable() {
        // Adapter that never answers the reset
        let port = MockPort::new("").hold_open();
        let transport =
            SerialTransport::with_opener(SerialConfig::default(), MockPortOpener::new(port));
        let commander = Arc::new(Commander::new(transport));
        let (sink, _rx) = ChannelSink::channel();
        let shutdown = CancellationToken::new();

        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });
        let result = monitor(
            Arc::clone(&commander),
            vec![CommandCode::ENGINE_RPM],
            PollingConfig::default(),
            Arc::new(sink),
            shutdown,
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(commander.state().await, ConnectionState::Disconnected);
    }
}
