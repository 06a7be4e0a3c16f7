//! Delivery of queued tasks to their destinations.
//!
//! This module provides:
//! - [`Dispatcher`]: the per-destination loop that drives dequeue passes and
//!   paces retries by error class
//! - [`TaskHandler`]: decodes a task and performs the matching ticket call
//! - [`AlertAggregator`]: deduplicated, batched operator alerts
//! - [`RelayConfig`] / [`DispatcherConfig`]: environment-driven settings

pub mod alert;
pub mod config;
pub mod dispatcher;
pub mod handler;

pub use alert::{Alert, AlertAggregator, AlertSink, LogAlertSink};
pub use config::{DispatcherConfig, RelayConfig};
pub use dispatcher::{Dispatcher, PassOutcome, next_profile};
pub use handler::{Handler, HandlerError, TaskHandler};
