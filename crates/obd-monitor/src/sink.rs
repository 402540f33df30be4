//! Log Output Sink

use obd_protocol::CommandCode;
use obd_scheduler::PidSink;
use tracing::info;

/// Writes every PID update to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl PidSink for LogSink {
    fn update(&self, label: &str, text: String) {
        let description = CommandCode::from(label).description().unwrap_or("unknown");
        info!(pid = label, "{} ({}): {}", label, description, text);
    }
}
