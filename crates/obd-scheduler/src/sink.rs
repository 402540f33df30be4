//! Update Sinks

use tokio::sync::mpsc;
use tracing::debug;

/// Receives one update per tick per PID
pub trait PidSink: Send + Sync + 'static {
    /// Publish `text` under `label`
    fn update(&self, label: &str, text: String);
}

/// A single published update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidUpdate {
    /// PID command text
    pub label: String,
    /// `"Data: ..."` or `"Error: ..."`
    pub text: String,
}

/// Forwards updates into an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<PidUpdate>,
}

impl ChannelSink {
    /// Create a sink and the receiver draining it
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PidUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl PidSink for ChannelSink {
    fn update(&self, label: &str, text: String) {
        let update = PidUpdate {
            label: label.to_string(),
            text,
        };
        if self.tx.send(update).is_err() {
            debug!("Update for {} dropped, receiver closed", label);
        }
    }
}
