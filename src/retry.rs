//! Exponential backoff scheduling.
//!
//! A [`Backoff`] walks the delays of one [`BackoffProfile`]. Profiles are
//! picked by error class:
//!
//! - `TRANSIENT`: 15s base, x1.5, 1h cap, never gives up (network, 5xx)
//! - `AUTHENTICATION`: 1h base, x2, 6h cap, never gives up (bad credentials)
//! - `LOGIN`: 1s base, x2, 8s cap, 3 retries within 30s (one login attempt)
//!
//! Switching class means calling [`Backoff::reset`] with the other profile, so
//! a long authentication delay never leaks into transient pacing or back.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Shape of one backoff sequence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffProfile {
    /// Name used in logs.
    pub name: &'static str,

    /// Delay before the first retry.
    pub delay: Duration,

    /// Cap for exponential growth.
    pub max_delay: Duration,

    /// Multiplier applied after each wait.
    pub factor: f64,

    /// Maximum number of waits, `None` for unbounded.
    pub max_count: Option<u32>,

    /// Maximum total time spent waiting, `None` for unbounded.
    pub max_duration: Option<Duration>,
}

impl BackoffProfile {
    /// Transient failures: network partitions, 5xx, throttling.
    pub const TRANSIENT: Self = Self {
        name: "transient",
        delay: Duration::from_secs(15),
        max_delay: Duration::from_secs(3600),
        factor: 1.5,
        max_count: None,
        max_duration: None,
    };

    /// Authentication failures. Rejected credentials need an operator, so
    /// retrying often only adds lockout risk.
    pub const AUTHENTICATION: Self = Self {
        name: "authentication",
        delay: Duration::from_secs(3600),
        max_delay: Duration::from_secs(6 * 3600),
        factor: 2.0,
        max_count: None,
        max_duration: None,
    };

    /// Retries inside a single login attempt.
    ///
    /// - 3 retries with 1s, 2s, 4s delays
    /// - Total max wait: 7 seconds, under the 30s budget
    pub const LOGIN: Self = Self {
        name: "login",
        delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(8),
        factor: 2.0,
        max_count: Some(3),
        max_duration: Some(Duration::from_secs(30)),
    };

    /// Computes the delay before retry number `attempt` (0-indexed).
    ///
    /// Grows as `delay * factor^attempt`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = self.factor.powi(attempt.min(i32::MAX as u32) as i32);
        let delay_secs = self.delay.as_secs_f64() * multiplier;
        let capped_secs = delay_secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped_secs)
    }

    fn grow(&self, current: Duration) -> Duration {
        let next = current.as_secs_f64() * self.factor;
        Duration::from_secs_f64(next.min(self.max_delay.as_secs_f64()))
    }
}

/// Source of delays, so tests can observe waits without sleeping.
pub trait Clock: Send + Sync {
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;
}

/// Real time via the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }
}

/// Position within a backoff sequence.
#[derive(Debug, Clone)]
pub struct Backoff<C: Clock = TokioClock> {
    profile: BackoffProfile,
    clock: C,
    delay: Duration,
    count: u32,
    elapsed: Duration,
}

impl Backoff<TokioClock> {
    /// Starts a sequence on the real clock.
    pub fn new(profile: BackoffProfile) -> Self {
        Self::start(profile, TokioClock)
    }
}

impl<C: Clock> Backoff<C> {
    /// Starts a sequence at the profile's initial state.
    pub fn start(profile: BackoffProfile, clock: C) -> Self {
        Backoff {
            profile,
            clock,
            delay: profile.delay,
            count: 0,
            elapsed: Duration::ZERO,
        }
    }

    /// Waits for the next delay.
    ///
    /// Returns false without waiting if the sequence is exhausted or `cancel`
    /// has fired, and false if `cancel` fires during the wait. Otherwise waits
    /// the current delay, grows it, and returns true.
    pub async fn next(&mut self, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() || self.is_exhausted() {
            return false;
        }

        let wait = self.delay;
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = self.clock.sleep(wait) => {}
        }

        self.delay = self.profile.grow(wait);
        self.count += 1;
        self.elapsed += wait;
        true
    }

    /// Restarts at the initial state of `profile`.
    pub fn reset(&mut self, profile: BackoffProfile) {
        self.profile = profile;
        self.delay = profile.delay;
        self.count = 0;
        self.elapsed = Duration::ZERO;
    }

    /// Whether no further waits are allowed.
    pub fn is_exhausted(&self) -> bool {
        self.profile.max_count.is_some_and(|max| self.count >= max)
            || self.profile.max_duration.is_some_and(|max| self.elapsed >= max)
    }

    pub fn profile(&self) -> &BackoffProfile {
        &self.profile
    }

    /// Delay the next call to `next` would wait.
    pub fn current_delay(&self) -> Duration {
        self.delay
    }

    /// Number of completed waits.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Total time waited.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }
}

/// Result of a retried operation.
#[derive(Debug)]
pub enum RetryResult<T, E> {
    /// The operation succeeded.
    Success(T),

    /// Retriable failures continued until the backoff ran out or was
    /// cancelled.
    Exhausted {
        /// The last error encountered.
        last_error: E,
        /// Number of attempts made (including the initial attempt).
        attempts: u32,
    },

    /// A failure that must not be retried.
    Permanent(E),
}

impl<T, E> RetryResult<T, E> {
    /// Converts to a Result, treating exhausted retries and permanent errors as Err.
    pub fn into_result(self) -> Result<T, E> {
        match self {
            RetryResult::Success(v) => Ok(v),
            RetryResult::Exhausted { last_error, .. } => Err(last_error),
            RetryResult::Permanent(e) => Err(e),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RetryResult::Success(_))
    }
}

/// Runs `operation` until it succeeds, fails permanently, or `backoff` is
/// exhausted.
///
/// `is_retriable` decides which errors earn another attempt.
pub async fn retry_with_backoff<T, E, C, F, Fut, R>(
    backoff: &mut Backoff<C>,
    cancel: &CancellationToken,
    is_retriable: R,
    mut operation: F,
) -> RetryResult<T, E>
where
    C: Clock,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
{
    let mut attempts = 0;

    loop {
        attempts += 1;
        match operation().await {
            Ok(value) => return RetryResult::Success(value),
            Err(e) if !is_retriable(&e) => return RetryResult::Permanent(e),
            Err(e) => {
                if !backoff.next(cancel).await {
                    return RetryResult::Exhausted {
                        last_error: e,
                        attempts,
                    };
                }
            }
        }
    }
}
