//! Per-destination delivery loop.
//!
//! A [`Dispatcher`] owns one queue and one handler and drives dequeue passes
//! from two triggers:
//!
//! ```text
//!  filesystem events ──► rate limiter ──┐
//!                                       ├──► dequeue pass ──► handler ──► ticket API
//!  backoff timer ───────────────────────┘         │
//!        ▲                                        │
//!        └────────── outcome picks the profile ───┘
//! ```
//!
//! The directory lock keeps the two triggers from overlapping: whichever
//! loses the race sees `LockHeld` and goes back to waiting.
//!
//! # Failure Handling
//!
//! | Outcome            | Item     | Poll cadence            | Alert |
//! |--------------------|----------|-------------------------|-------|
//! | delivered          | deleted  | reset to transient base | no    |
//! | empty / lock held  | -        | keeps growing           | no    |
//! | skip / application | deleted  | unchanged               | app   |
//! | transient          | kept     | transient profile       | no    |
//! | authentication     | kept     | authentication profile  | yes   |
//!
//! While the last pass failed, notifications don't trigger passes; only the
//! backoff timer does. New arrivals cannot overtake the failing head item
//! anyway, and retrying on every arrival would defeat the backoff.
//!
//! Outcomes of notification-triggered passes are fed to the timer, so a
//! failure seen there restarts the backoff from the base delay of its class
//! instead of waiting out a delay that grew while the queue was idle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::queue::{ChangeNotifier, DequeueError, DurableQueue, QueueError, pass_limiter, run_watch};
use crate::retry::{Backoff, BackoffProfile};
use crate::types::{DestinationId, ItemId};

use super::alert::AlertAggregator;
use super::config::DispatcherConfig;
use super::handler::{Handler, HandlerError};

/// Result of one dequeue pass, reduced to what pacing needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// Items were consumed (delivered or dropped) and the queue drained.
    Delivered(usize),

    /// Nothing to do.
    Empty,

    /// Another pass or process is consuming.
    LockHeld,

    /// No session could be obtained; the head item stays queued.
    Authentication(String),

    /// A transient or I/O failure; the head item stays queued.
    Failed(String),
}

impl PassOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, PassOutcome::Authentication(_) | PassOutcome::Failed(_))
    }
}

/// Picks the polling profile after a pass.
///
/// `was_failing` tells whether the previous pass failed too. The first
/// failure of a streak starts its profile from the base delay; later ones keep
/// walking it.
///
/// Returns `Some` when the backoff must be reset to a (possibly equal)
/// profile, `None` to keep walking the current sequence.
pub fn next_profile(
    config: &DispatcherConfig,
    current: &BackoffProfile,
    was_failing: bool,
    outcome: &PassOutcome,
) -> Option<BackoffProfile> {
    let in_auth = current.name == config.authentication.name;
    match outcome {
        PassOutcome::Delivered(_) => Some(config.transient),
        PassOutcome::Authentication(_) if !in_auth || !was_failing => Some(config.authentication),
        PassOutcome::Authentication(_) => None,
        PassOutcome::Failed(_) if in_auth || !was_failing => Some(config.transient),
        PassOutcome::Failed(_) => None,
        PassOutcome::Empty | PassOutcome::LockHeld if in_auth => Some(config.transient),
        PassOutcome::Empty | PassOutcome::LockHeld => None,
    }
}

/// Delivery loop for one destination.
pub struct Dispatcher<H> {
    destination: DestinationId,
    queue: Arc<DurableQueue>,
    handler: H,
    alerts: Arc<AlertAggregator>,
    config: DispatcherConfig,

    /// Whether the last pass failed; gates the notification trigger.
    failing: AtomicBool,

    /// Latest outcome of a notification-triggered pass, for the timer.
    notified: watch::Sender<Option<PassOutcome>>,
}

impl<H> std::fmt::Debug for Dispatcher<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("destination", &self.destination)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl<H: Handler> Dispatcher<H> {
    pub fn new(
        destination: DestinationId,
        queue: Arc<DurableQueue>,
        handler: H,
        alerts: Arc<AlertAggregator>,
        config: DispatcherConfig,
    ) -> Self {
        Dispatcher {
            destination,
            queue,
            handler,
            alerts,
            config,
            failing: AtomicBool::new(false),
            notified: watch::channel(None).0,
        }
    }

    pub fn destination(&self) -> &DestinationId {
        &self.destination
    }

    pub fn queue(&self) -> &Arc<DurableQueue> {
        &self.queue
    }

    /// Runs one dequeue pass and classifies it.
    #[instrument(skip(self, cancel), fields(destination = %self.destination.short()))]
    pub async fn pass(&self, cancel: &CancellationToken) -> PassOutcome {
        let result = self
            .queue
            .dequeue(|id, payload| self.deliver(id, payload, cancel))
            .await;

        let outcome = match result {
            Ok(consumed) => {
                info!(consumed, "Queue drained");
                PassOutcome::Delivered(consumed)
            }
            Err(DequeueError::Queue(QueueError::Empty)) => PassOutcome::Empty,
            Err(DequeueError::Queue(QueueError::LockHeld)) => {
                debug!("Queue busy");
                PassOutcome::LockHeld
            }
            Err(DequeueError::Queue(QueueError::Io(e))) => {
                error!(error = %e, "Queue I/O failed");
                PassOutcome::Failed(e.to_string())
            }
            Err(DequeueError::Handler { id, error }) if error.is_authentication() => {
                warn!(id = %id, error = %error, "Authentication failed");
                PassOutcome::Authentication(error.to_string())
            }
            Err(DequeueError::Handler { id, error }) => {
                warn!(id = %id, error = %error, "Delivery failed, item kept");
                PassOutcome::Failed(error.to_string())
            }
        };

        match &outcome {
            PassOutcome::Delivered(_) | PassOutcome::Empty => self.failing.store(false, Ordering::SeqCst),
            PassOutcome::Authentication(_) | PassOutcome::Failed(_) => self.failing.store(true, Ordering::SeqCst),
            PassOutcome::LockHeld => {}
        }
        outcome
    }

    /// Delivers one item. `Ok` deletes it from the queue, `Err` keeps it.
    async fn deliver(&self, id: ItemId, payload: Vec<u8>, cancel: &CancellationToken) -> Result<(), HandlerError> {
        let Err(error) = self.handler.handle(id, &payload, cancel).await else {
            return Ok(());
        };

        if error.needs_alert() {
            self.alerts
                .raise(self.destination.short(), format!("item {id}: {error}"));
        }

        if error.keeps_item() {
            return Err(error);
        }

        warn!(id = %id, error = %error, "Dropping undeliverable item");
        Ok(())
    }

    /// Timer-driven passes with backoff, until cancelled.
    ///
    /// An outcome reported by the notification driver interrupts the current
    /// wait: it is applied as if the timer had run the pass, and the wait
    /// restarts from the resulting delay.
    pub async fn run_poll(&self, cancel: &CancellationToken) {
        let mut backoff = Backoff::new(self.config.transient);
        let mut notified = self.notified.subscribe();
        let mut was_failing = false;
        let mut outcome = self.pass(cancel).await;

        loop {
            if let Some(profile) = next_profile(&self.config, backoff.profile(), was_failing, &outcome) {
                if profile.name != backoff.profile().name {
                    info!(
                        destination = %self.destination.short(),
                        profile = profile.name,
                        "Switching retry profile"
                    );
                }
                backoff.reset(profile);
            }
            if outcome != PassOutcome::LockHeld {
                was_failing = outcome.is_failure();
            }

            let timer_fired = tokio::select! {
                more = backoff.next(cancel) => {
                    if !more {
                        break;
                    }
                    true
                }
                Ok(()) = notified.changed() => false,
            };

            outcome = if timer_fired {
                self.pass(cancel).await
            } else {
                let latest = notified.borrow_and_update().clone();
                match latest {
                    Some(outcome) => outcome,
                    None => continue,
                }
            };
        }
    }

    /// Notification-driven passes, until cancelled or the notifier ends.
    pub async fn run_notified<N: ChangeNotifier>(&self, notifier: N, cancel: &CancellationToken) {
        let limiter = pass_limiter(self.config.watch_rate);
        run_watch(notifier, &limiter, cancel, || async {
            if self.failing.load(Ordering::SeqCst) {
                debug!(destination = %self.destination.short(), "Backing off, notification ignored");
                return;
            }
            let outcome = self.pass(cancel).await;
            self.notified.send_replace(Some(outcome));
        })
        .await;
    }

    /// Runs both triggers until cancelled, then releases the queue.
    ///
    /// Without a notifier only the timer drives passes.
    pub async fn run<N: ChangeNotifier>(self: Arc<Self>, notifier: Option<N>, cancel: CancellationToken) {
        info!(destination = %self.destination.short(), dir = %self.queue.dir().display(), "Dispatcher started");

        let watch = async {
            if let Some(notifier) = notifier {
                self.run_notified(notifier, &cancel).await;
            }
        };
        tokio::join!(self.run_poll(&cancel), watch);

        if let Err(e) = self.queue.close().await {
            warn!(destination = %self.destination.short(), error = %e, "Failed to release queue lock");
        }
        info!(destination = %self.destination.short(), "Dispatcher stopped");
    }
}
