//! Operator alerts for failures that retrying cannot fix.
//!
//! Alerts are deduplicated and batched before they reach the sink: a head
//! item refused by the API, or rejected credentials, would otherwise raise
//! the same alert on every pass.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Flush once this many distinct alerts are pending.
pub const DEFAULT_MAX_BATCH: usize = 100;

/// Flush pending alerts at least this often.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// One alert.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Alert {
    /// Short destination id the alert concerns.
    pub destination: String,
    pub message: String,
}

/// Where alert batches go.
pub trait AlertSink: Send + Sync {
    fn deliver(&self, batch: &[Alert]);
}

/// Writes alerts to the log at error level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn deliver(&self, batch: &[Alert]) {
        for alert in batch {
            error!(destination = %alert.destination, message = %alert.message, "ALERT");
        }
    }
}

#[derive(Default)]
struct Pending {
    alerts: Vec<Alert>,
    seen: HashSet<Alert>,
}

/// Deduplicating, batching front for an [`AlertSink`].
pub struct AlertAggregator {
    sink: Box<dyn AlertSink>,
    max_batch: usize,
    pending: Mutex<Pending>,
}

impl std::fmt::Debug for AlertAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertAggregator")
            .field("max_batch", &self.max_batch)
            .finish_non_exhaustive()
    }
}

impl AlertAggregator {
    pub fn new(sink: Box<dyn AlertSink>) -> Self {
        Self::with_max_batch(sink, DEFAULT_MAX_BATCH)
    }

    pub fn with_max_batch(sink: Box<dyn AlertSink>, max_batch: usize) -> Self {
        AlertAggregator {
            sink,
            max_batch: max_batch.max(1),
            pending: Mutex::new(Pending::default()),
        }
    }

    /// Queues an alert. Identical alerts within one batch are kept once.
    pub fn raise(&self, destination: &str, message: impl Into<String>) {
        let alert = Alert {
            destination: destination.to_string(),
            message: message.into(),
        };

        let full = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            if !pending.seen.insert(alert.clone()) {
                debug!(destination, "Duplicate alert suppressed");
                return;
            }
            pending.alerts.push(alert);
            pending.alerts.len() >= self.max_batch
        };

        if full {
            self.flush();
        }
    }

    /// Sends everything pending. Returns the number of alerts sent.
    pub fn flush(&self) -> usize {
        let batch = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.seen.clear();
            std::mem::take(&mut pending.alerts)
        };
        if !batch.is_empty() {
            self.sink.deliver(&batch);
        }
        batch.len()
    }

    /// Flushes every `interval` until cancelled, then once more.
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.flush();
                }
            }
        }
        self.flush();
    }
}
