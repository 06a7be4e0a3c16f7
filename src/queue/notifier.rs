//! Low-latency wake-ups for a queue directory.
//!
//! Filesystem notifications are best-effort: events can be dropped or
//! coalesced by the OS. Callers always pair a notifier with a polling timer.

use std::future::Future;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::item;

/// Default number of notification-triggered passes per second.
pub const DEFAULT_WATCH_RATE: u32 = 1;

/// A source of "something may have arrived" signals.
pub trait ChangeNotifier: Send {
    /// Waits for the next change. Returns `None` once the source is gone.
    fn next_change(&mut self) -> impl Future<Output = Option<()>> + Send;

    /// Discards changes that are already queued. Returns how many were dropped.
    fn drain_pending(&mut self) -> usize;
}

/// Channel-backed notifier, fed by a filesystem watcher or by tests.
#[derive(Debug)]
pub struct ChannelNotifier {
    rx: mpsc::UnboundedReceiver<()>,
}

impl ChannelNotifier {
    /// Creates a notifier and the sender that signals it.
    pub fn new() -> (mpsc::UnboundedSender<()>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, ChannelNotifier { rx })
    }
}

impl ChangeNotifier for ChannelNotifier {
    async fn next_change(&mut self) -> Option<()> {
        self.rx.recv().await
    }

    fn drain_pending(&mut self) -> usize {
        let mut drained = 0;
        while self.rx.try_recv().is_ok() {
            drained += 1;
        }
        drained
    }
}

/// Notifier driven by OS filesystem events on one queue directory.
///
/// Dropping it stops the OS watch.
pub struct FsChangeNotifier {
    dir: PathBuf,
    inner: ChannelNotifier,

    // Held for its Drop; the watch ends when this does.
    _watcher: RecommendedWatcher,
}

impl std::fmt::Debug for FsChangeNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsChangeNotifier")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl FsChangeNotifier {
    /// Starts watching `dir` (non-recursive) for items becoming visible.
    pub fn watch(dir: &Path) -> notify::Result<Self> {
        let (tx, inner) = ChannelNotifier::new();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if announces_item(&event) {
                    // Receiver gone means the notifier was dropped.
                    let _ = tx.send(());
                }
            }
            Err(e) => warn!(error = %e, "Filesystem watch error"),
        })?;
        watcher.watch(dir, RecursiveMode::NonRecursive)?;

        debug!(dir = %dir.display(), "Watching queue directory");
        Ok(FsChangeNotifier {
            dir: dir.to_path_buf(),
            inner,
            _watcher: watcher,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl ChangeNotifier for FsChangeNotifier {
    fn next_change(&mut self) -> impl Future<Output = Option<()>> + Send {
        self.inner.next_change()
    }

    fn drain_pending(&mut self) -> usize {
        self.inner.drain_pending()
    }
}

/// Whether an event may have made a queue item visible.
///
/// Create covers platforms that report the final rename as a create; the
/// rename kinds cover the rest. Temp files and markers are filtered out.
fn announces_item(event: &Event) -> bool {
    let is_visible = |p: &PathBuf| {
        p.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| item::parse_visible(n).is_some())
    };
    match event.kind {
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To | RenameMode::Any)) => {
            event.paths.iter().any(is_visible)
        }
        // Paths are [from, to]; only the destination counts, so claiming an
        // item (item -> marker) does not announce it again.
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => event.paths.last().is_some_and(is_visible),
        _ => false,
    }
}

/// Builds the limiter for notification-triggered passes.
pub fn pass_limiter(per_second: u32) -> DefaultDirectRateLimiter {
    let rate = NonZeroU32::new(per_second).unwrap_or(NonZeroU32::MIN);
    RateLimiter::direct(Quota::per_second(rate))
}

/// Runs `pass` whenever the notifier reports a change, until cancelled or the
/// notifier ends.
///
/// Bursts are coalesced: after the limiter admits a pass, any notifications
/// that queued up meanwhile are drained, so one pass covers them all.
pub async fn run_watch<N, F, Fut>(
    mut notifier: N,
    limiter: &DefaultDirectRateLimiter,
    cancel: &CancellationToken,
    mut pass: F,
) where
    N: ChangeNotifier,
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            change = notifier.next_change() => {
                if change.is_none() {
                    debug!("Change source closed, stopping watch driver");
                    break;
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = limiter.until_ready() => {}
        }

        let coalesced = notifier.drain_pending();
        trace!(coalesced, "Change notification admitted");

        pass().await;
    }
}
