//! OBD-II Polling Engine
//!
//! Runs one task per monitored PID, each on its own timer, and publishes
//! every result to a [`PidSink`]. All tasks share one cancellation token and
//! are joined on shutdown.

mod engine;
mod sink;

pub use engine::{PollingConfig, PollingEngine, SchedulerError, DEFAULT_POLL_INTERVAL_MS};
pub use sink::{ChannelSink, PidSink, PidUpdate};
