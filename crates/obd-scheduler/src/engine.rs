//! Polling Engine Implementation

use crate::sink::PidSink;
use obd_protocol::{CommandCode, Commander};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default time between two polls of the same PID
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;

/// Errors raised when starting the engine
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    /// Nothing to monitor
    #[error("No PIDs to monitor")]
    NoPids,

    /// A zero interval would spin
    #[error("Polling interval must be greater than zero")]
    ZeroInterval,
}

/// Configuration for the polling engine
#[derive(Debug, Clone)]
pub struct PollingConfig {
    /// Time between two polls of the same PID
    pub interval: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }
}

/// Owns one polling task per monitored PID
pub struct PollingEngine {
    tasks: Vec<(CommandCode, JoinHandle<()>)>,
    /// Child of the token passed to `start`
    cancel: CancellationToken,
}

impl PollingEngine {
    /// Spawn one polling task per distinct PID.
    ///
    /// Tasks stop when `cancel` (or the engine itself) is cancelled. The first
    /// poll of every PID happens one interval after start.
    pub fn start<I>(
        commander: Arc<Commander>,
        pids: I,
        config: PollingConfig,
        sink: Arc<dyn PidSink>,
        cancel: CancellationToken,
    ) -> Result<Self, SchedulerError>
    where
        I: IntoIterator<Item = CommandCode>,
    {
        if config.interval.is_zero() {
            return Err(SchedulerError::ZeroInterval);
        }

        let mut distinct: Vec<CommandCode> = Vec::new();
        for pid in pids {
            if distinct.contains(&pid) {
                debug!("Ignoring duplicate PID {}", pid);
                continue;
            }
            distinct.push(pid);
        }
        if distinct.is_empty() {
            return Err(SchedulerError::NoPids);
        }

        info!(
            "Starting polling engine: {} PIDs every {:?}",
            distinct.len(),
            config.interval
        );

        let cancel = cancel.child_token();
        let tasks = distinct
            .into_iter()
            .map(|pid| {
                let handle = tokio::spawn(poll_pid(
                    Arc::clone(&commander),
                    pid.clone(),
                    config.interval,
                    Arc::clone(&sink),
                    cancel.clone(),
                ));
                (pid, handle)
            })
            .collect();

        Ok(Self { tasks, cancel })
    }

    /// PIDs being polled
    pub fn pids(&self) -> impl Iterator<Item = &CommandCode> {
        self.tasks.iter().map(|(pid, _)| pid)
    }

    /// Number of running polling tasks
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Cancel every task and wait for all of them to exit
    pub async fn shutdown(mut self) {
        info!("Stopping polling engine");
        self.cancel.cancel();
        self.join_all().await;
    }

    /// Wait for the tasks to exit after the token passed to `start` fires
    pub async fn wait(mut self) {
        self.cancel.cancelled().await;
        self.join_all().await;
    }

    async fn join_all(&mut self) {
        for (pid, handle) in std::mem::take(&mut self.tasks) {
            if let Err(e) = handle.await {
                error!("Polling task for {} ended abnormally: {}", pid, e);
            }
        }
        info!("Polling engine stopped");
    }
}

impl Drop for PollingEngine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Poll `pid` every `interval` until cancelled
async fn poll_pid(
    commander: Arc<Commander>,
    pid: CommandCode,
    interval: Duration,
    sink: Arc<dyn PidSink>,
    cancel: CancellationToken,
) {
    let label = pid.to_string();
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!("Polling task for {} started", label);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        // An in-flight exchange is abandoned on cancellation
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            result = commander.execute_command(&pid) => result,
        };

        metrics::counter!("obd_poll_ticks_total", "pid" => label.clone()).increment(1);
        let text = match result {
            Ok(response) => format!("Data: {response}"),
            Err(e) => {
                warn!("PID {} query failed: {}", label, e);
                metrics::counter!("obd_poll_errors_total", "pid" => label.clone()).increment(1);
                format!("Error: {e}")
            }
        };
        sink.update(&label, text);
    }

    debug!("Polling task for {} stopped", label);
}
