//! Directory-backed FIFO queue with a single active consumer.
//!
//! # Crash Safety
//!
//! - Items are written to a temp file, fsynced, then renamed into visibility,
//!   so a consumer never sees a partial payload
//! - A consumer claims an item by renaming it to its in-flight marker
//! - Success deletes the marker; failure renames it back
//! - Markers left behind by a crashed consumer are renamed back on the first
//!   lock acquisition of the next consumer process (at-least-once delivery)
//!
//! # Ordering
//!
//! Items are offered in ascending id order. A failing item stops the pass, so
//! later items are never delivered ahead of it. A head item that keeps failing
//! therefore holds back the rest of the queue until it succeeds or is dropped
//! by the handler.

use std::fmt;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tracing::{debug, info, instrument, trace, warn};

use crate::persistence::fsync::{fsync_dir, write_atomic};
use crate::types::{ItemId, ItemIdGenerator};

use super::item::{self, QueueItem, TEMP_PREFIX};
use super::lock::{DirectoryLock, FileLock};

/// Temp files older than this are debris from a crashed producer.
const STALE_TEMP_AGE: Duration = Duration::from_secs(3600);

/// Errors from queue operations that don't involve the handler.
#[derive(Debug, Error)]
pub enum QueueError {
    /// IO error on the queue directory or an item file.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Another consumer (this process or another) holds the directory lock.
    #[error("queue is locked by another consumer")]
    LockHeld,

    /// There were no visible items.
    #[error("queue is empty")]
    Empty,
}

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Error from a dequeue pass.
#[derive(Debug, Error)]
pub enum DequeueError<E> {
    /// The pass could not run or could not complete its file operations.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// The handler rejected an item; it was restored and the pass stopped.
    #[error("handler failed on item {id}: {error}")]
    Handler { id: ItemId, error: E },
}

impl<E> DequeueError<E> {
    /// Returns the queue error, if this is not a handler failure.
    pub fn as_queue_error(&self) -> Option<&QueueError> {
        match self {
            DequeueError::Queue(e) => Some(e),
            DequeueError::Handler { .. } => None,
        }
    }
}

/// Consumer-side state guarded by the in-process consumer mutex.
struct ConsumerState {
    lock: Box<dyn DirectoryLock>,
}

/// A crash-safe, single-consumer FIFO of opaque payloads in one directory.
pub struct DurableQueue {
    dir: PathBuf,
    ids: ItemIdGenerator,
    consumer: tokio::sync::Mutex<ConsumerState>,
}

impl fmt::Debug for DurableQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DurableQueue")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl DurableQueue {
    /// Opens the queue in `dir`, creating the directory if needed.
    ///
    /// Does not take the consumer lock; that happens on the first `dequeue`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let lock = FileLock::for_dir(&dir);
        Ok(Self::with_lock(dir, Box::new(lock)))
    }

    /// Opens the queue with a custom lock implementation.
    pub fn with_lock(dir: PathBuf, lock: Box<dyn DirectoryLock>) -> Self {
        DurableQueue {
            dir,
            ids: ItemIdGenerator::new(),
            consumer: tokio::sync::Mutex::new(ConsumerState { lock }),
        }
    }

    /// Returns the queue directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persists a payload as a new item and makes it visible atomically.
    ///
    /// Needs no coordination with other producers or the consumer: ids are
    /// unique by construction and visibility is a single rename.
    pub fn enqueue(&self, payload: &[u8]) -> Result<ItemId> {
        let id = self.ids.next_id();
        let visible = self.dir.join(item::file_name(id));
        let temp = self.dir.join(item::temp_file_name(id));

        write_atomic(&temp, &visible, payload)?;

        trace!(dir = %self.dir.display(), id = %id, bytes = payload.len(), "Enqueued item");
        Ok(id)
    }

    /// Runs one consumption pass.
    ///
    /// Each visible item, oldest first, is claimed, read and handed to
    /// `handler`. On `Ok` the item is deleted; on `Err` it is restored and the
    /// pass stops with [`DequeueError::Handler`].
    ///
    /// Returns the number of items consumed.
    ///
    /// # Errors
    ///
    /// - `LockHeld` immediately if another consumer is active
    /// - `Empty` if there was nothing to deliver
    /// - `Io` if the directory or an item could not be read or renamed
    ///
    /// # Cancellation
    ///
    /// If the returned future is dropped while the handler runs, the claimed
    /// item is renamed back to visible.
    #[instrument(skip(self, handler), fields(dir = %self.dir.display()))]
    pub async fn dequeue<F, Fut, E>(&self, mut handler: F) -> std::result::Result<usize, DequeueError<E>>
    where
        F: FnMut(ItemId, Vec<u8>) -> Fut,
        Fut: Future<Output = std::result::Result<(), E>>,
    {
        let mut consumer = self.consumer.try_lock().map_err(|_| QueueError::LockHeld)?;

        let fresh = !consumer.lock.is_held();
        if !consumer.lock.try_acquire().map_err(QueueError::Io)? {
            debug!("Directory lock held elsewhere");
            return Err(QueueError::LockHeld.into());
        }

        // Whoever held the lock since we last did may have crashed mid-pass.
        if fresh {
            let restored = self.recover_in_flight()?;
            if restored > 0 {
                info!(restored, "Recovered in-flight items from a previous consumer");
            }
        }

        let items = self.list_visible()?;
        if items.is_empty() {
            return Err(QueueError::Empty.into());
        }

        let mut consumed = 0;
        for queued in items {
            let Some(claim) = Claim::take(&queued)? else {
                continue;
            };

            let payload = match std::fs::read(&claim.marker) {
                Ok(payload) => payload,
                Err(e) => {
                    claim.restore()?;
                    return Err(QueueError::Io(e).into());
                }
            };

            match handler(queued.id, payload).await {
                Ok(()) => {
                    claim.complete()?;
                    consumed += 1;
                    trace!(id = %queued.id, "Item consumed");
                }
                Err(error) => {
                    claim.restore()?;
                    debug!(id = %queued.id, consumed, "Handler failed, stopping pass");
                    return Err(DequeueError::Handler {
                        id: queued.id,
                        error,
                    });
                }
            }
        }

        if consumed > 0 {
            fsync_dir(&self.dir).map_err(QueueError::Io)?;
        }

        Ok(consumed)
    }

    /// Releases the directory lock. Idempotent.
    ///
    /// Waits for a running pass to finish. The queue stays usable: a later
    /// `dequeue` takes the lock again and reconciles markers left meanwhile.
    pub async fn close(&self) -> Result<()> {
        let mut consumer = self.consumer.lock().await;
        consumer.lock.release()?;
        Ok(())
    }

    /// Number of visible items.
    pub fn len(&self) -> Result<usize> {
        Ok(self.list_visible()?.len())
    }

    /// Returns true if there are no visible items.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Visible items sorted by id (arrival order).
    fn list_visible(&self) -> Result<Vec<QueueItem>> {
        let mut items = Vec::new();

        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str()
                && let Some(id) = item::parse_visible(name)
            {
                items.push(QueueItem::new(&self.dir, id));
            }
        }

        items.sort_by_key(|i| i.id);
        Ok(items)
    }

    /// Renames leftover in-flight markers back to visible items and removes
    /// stale temp files.
    ///
    /// Only safe while holding the directory lock: no other consumer can own
    /// a marker at that point.
    fn recover_in_flight(&self) -> Result<usize> {
        let cutoff = SystemTime::now()
            .checked_sub(STALE_TEMP_AGE)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut restored = 0;
        let mut touched = false;

        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };

            if let Some(id) = item::parse_in_flight(&name) {
                let queued = QueueItem::new(&self.dir, id);
                std::fs::rename(entry.path(), &queued.path)?;
                warn!(id = %id, "Restoring item abandoned by a crashed consumer");
                restored += 1;
                touched = true;
            } else if name.starts_with(TEMP_PREFIX)
                && let Ok(metadata) = entry.metadata()
                && let Ok(modified) = metadata.modified()
                && modified < cutoff
                && std::fs::remove_file(entry.path()).is_ok()
            {
                debug!(file = %name, "Removed stale temp file");
                touched = true;
            }
        }

        if touched {
            fsync_dir(&self.dir)?;
        }

        Ok(restored)
    }
}

/// An item renamed to its in-flight marker.
///
/// Dropping an unresolved claim renames the marker back, so an abandoned pass
/// never strands an item until the next process start.
struct Claim {
    marker: PathBuf,
    visible: PathBuf,
    resolved: bool,
}

impl Claim {
    /// Renames the item to its marker. Returns `None` if it vanished.
    fn take(queued: &QueueItem) -> Result<Option<Self>> {
        let marker = queued.in_flight_path();
        match std::fs::rename(&queued.path, &marker) {
            Ok(()) => Ok(Some(Claim {
                marker,
                visible: queued.path.clone(),
                resolved: false,
            })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn complete(mut self) -> Result<()> {
        self.resolved = true;
        std::fs::remove_file(&self.marker)?;
        Ok(())
    }

    fn restore(mut self) -> Result<()> {
        self.resolved = true;
        std::fs::rename(&self.marker, &self.visible)?;
        Ok(())
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        if !self.resolved
            && let Err(e) = std::fs::rename(&self.marker, &self.visible)
        {
            warn!(
                marker = %self.marker.display(),
                error = %e,
                "Failed to restore abandoned in-flight item"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    fn payloads_in(queue: &DurableQueue) -> Vec<Vec<u8>> {
        queue
            .list_visible()
            .unwrap()
            .iter()
            .map(|i| std::fs::read(&i.path).unwrap())
            .collect()
    }

    async fn drain_all(queue: &DurableQueue) -> Vec<Vec<u8>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let result = queue
            .dequeue(move |_, payload| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(payload);
                    Ok::<_, String>(())
                }
            })
            .await;
        assert!(matches!(result, Ok(_) | Err(DequeueError::Queue(QueueError::Empty))));
        let out = seen.lock().unwrap().clone();
        out
    }

    #[test]
    fn enqueue_leaves_only_visible_item() {
        let dir = tempdir().unwrap();
        let queue = DurableQueue::open(dir.path()).unwrap();

        let id = queue.enqueue(b"payload").unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec![item::file_name(id)]);
        assert_eq!(queue.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn empty_queue_reports_empty() {
        let dir = tempdir().unwrap();
        let queue = DurableQueue::open(dir.path()).unwrap();

        let result = queue.dequeue(|_, _| async { Ok::<_, String>(()) }).await;

        assert!(matches!(result, Err(DequeueError::Queue(QueueError::Empty))));
    }

    #[tokio::test]
    async fn delivers_in_arrival_order_and_deletes() {
        let dir = tempdir().unwrap();
        let queue = DurableQueue::open(dir.path()).unwrap();
        for i in 0..20u8 {
            queue.enqueue(&[i]).unwrap();
        }

        let delivered = drain_all(&queue).await;

        let expected: Vec<Vec<u8>> = (0..20u8).map(|i| vec![i]).collect();
        assert_eq!(delivered, expected);
        assert!(queue.is_empty().unwrap());
    }

    /// A failure on B keeps B queued and stops the pass before C. This is the
    /// ordering-over-liveness trade-off: C waits for B.
    #[tokio::test]
    async fn failure_stops_pass_and_keeps_item() {
        let dir = tempdir().unwrap();
        let queue = DurableQueue::open(dir.path()).unwrap();
        queue.enqueue(b"A").unwrap();
        let b = queue.enqueue(b"B").unwrap();
        queue.enqueue(b"C").unwrap();

        let attempted = Arc::new(Mutex::new(Vec::new()));
        let log = attempted.clone();
        let result = queue
            .dequeue(move |_, payload| {
                let log = log.clone();
                async move {
                    log.lock().unwrap().push(payload.clone());
                    if payload == b"B" { Err("boom") } else { Ok(()) }
                }
            })
            .await;

        match result {
            Err(DequeueError::Handler { id, error }) => {
                assert_eq!(id, b);
                assert_eq!(error, "boom");
            }
            other => panic!("expected handler error, got {other:?}"),
        }
        assert_eq!(*attempted.lock().unwrap(), vec![b"A".to_vec(), b"B".to_vec()]);
        assert_eq!(payloads_in(&queue), vec![b"B".to_vec(), b"C".to_vec()]);

        let second = drain_all(&queue).await;
        assert_eq!(second, vec![b"B".to_vec(), b"C".to_vec()]);
        assert!(queue.is_empty().unwrap());
    }

    #[tokio::test]
    async fn crashed_marker_is_redelivered_on_first_acquisition() {
        let dir = tempdir().unwrap();
        let id = {
            let crashed = DurableQueue::open(dir.path()).unwrap();
            let id = crashed.enqueue(b"orphan").unwrap();
            let queued = QueueItem::new(dir.path(), id);
            std::fs::rename(&queued.path, queued.in_flight_path()).unwrap();
            id
        };

        let queue = DurableQueue::open(dir.path()).unwrap();
        assert!(queue.is_empty().unwrap());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let consumed = queue
            .dequeue(move |id, payload| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push((id, payload));
                    Ok::<_, String>(())
                }
            })
            .await
            .unwrap();

        assert_eq!(consumed, 1);
        assert_eq!(*seen.lock().unwrap(), vec![(id, b"orphan".to_vec())]);
    }

    #[tokio::test]
    async fn reacquired_lock_recovers_markers_left_by_another_consumer() {
        let dir = tempdir().unwrap();
        let queue = DurableQueue::open(dir.path()).unwrap();
        queue.enqueue(b"first").unwrap();
        assert_eq!(drain_all(&queue).await, vec![b"first".to_vec()]);
        queue.close().await.unwrap();

        // Another consumer takes over, claims an item and dies mid-delivery.
        let id = {
            let other = DurableQueue::open(dir.path()).unwrap();
            let mut lock = FileLock::for_dir(dir.path());
            assert!(lock.try_acquire().unwrap());
            let id = other.enqueue(b"orphan").unwrap();
            let queued = QueueItem::new(dir.path(), id);
            std::fs::rename(&queued.path, queued.in_flight_path()).unwrap();
            id
        };
        let marker = QueueItem::new(dir.path(), id).in_flight_path();
        assert!(marker.exists());

        assert_eq!(drain_all(&queue).await, vec![b"orphan".to_vec()]);
        assert!(!marker.exists());
        assert!(queue.is_empty().unwrap());
    }

    #[tokio::test]
    async fn second_consumer_gets_lock_held_immediately() {
        let dir = tempdir().unwrap();
        let first = DurableQueue::open(dir.path()).unwrap();
        let second = DurableQueue::open(dir.path()).unwrap();
        first.enqueue(b"x").unwrap();

        let _ = first.dequeue(|_, _| async { Err::<(), _>("hold") }).await;

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            second.dequeue(|_, _| async { Ok::<_, String>(()) }),
        )
        .await
        .expect("lock attempt must not block");
        assert!(matches!(result, Err(DequeueError::Queue(QueueError::LockHeld))));

        first.close().await.unwrap();
        first.close().await.unwrap();
        let consumed = second
            .dequeue(|_, _| async { Ok::<_, String>(()) })
            .await
            .unwrap();
        assert_eq!(consumed, 1);
    }

    #[tokio::test]
    async fn concurrent_pass_in_same_process_gets_lock_held() {
        let dir = tempdir().unwrap();
        let queue = Arc::new(DurableQueue::open(dir.path()).unwrap());
        queue.enqueue(b"slow").unwrap();

        let (entered_tx, entered_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let entered_tx = Arc::new(Mutex::new(Some(entered_tx)));
        let release_rx = Arc::new(tokio::sync::Mutex::new(Some(release_rx)));

        let running = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .dequeue(move |_, _| {
                        let entered_tx = entered_tx.clone();
                        let release_rx = release_rx.clone();
                        async move {
                            if let Some(tx) = entered_tx.lock().unwrap().take() {
                                let _ = tx.send(());
                            }
                            if let Some(rx) = release_rx.lock().await.take() {
                                let _ = rx.await;
                            }
                            Ok::<_, String>(())
                        }
                    })
                    .await
            })
        };

        entered_rx.await.unwrap();
        let concurrent = queue.dequeue(|_, _| async { Ok::<_, String>(()) }).await;
        assert!(matches!(concurrent, Err(DequeueError::Queue(QueueError::LockHeld))));

        release_tx.send(()).unwrap();
        assert_eq!(running.await.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn abandoned_pass_restores_claimed_item() {
        let dir = tempdir().unwrap();
        let queue = DurableQueue::open(dir.path()).unwrap();
        queue.enqueue(b"pending").unwrap();

        let pass = queue.dequeue(|_, _| std::future::pending::<std::result::Result<(), String>>());
        let timed_out = tokio::time::timeout(Duration::from_millis(50), pass).await;

        assert!(timed_out.is_err());
        assert_eq!(payloads_in(&queue), vec![b"pending".to_vec()]);
    }

    #[tokio::test]
    async fn ignores_foreign_files() {
        let dir = tempdir().unwrap();
        let queue = DurableQueue::open(dir.path()).unwrap();
        std::fs::write(dir.path().join("destination.json"), b"{}").unwrap();
        std::fs::create_dir(dir.path().join("01ARZ3NDEKTSV4RRFFQ69G5FAV.dirq-item.dat")).unwrap();

        let result = queue.dequeue(|_, _| async { Ok::<_, String>(()) }).await;

        assert!(matches!(result, Err(DequeueError::Queue(QueueError::Empty))));
        assert!(dir.path().join("destination.json").exists());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        /// Every payload is delivered exactly once, in enqueue order, even
        /// when some passes fail part-way.
        #[test]
        fn exactly_once_in_order_despite_failures(
            payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..32), 1..12),
            fail_every in 2usize..5,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let dir = tempdir().unwrap();
            let queue = DurableQueue::open(dir.path()).unwrap();
            for p in &payloads {
                queue.enqueue(p).unwrap();
            }

            let delivered = Arc::new(Mutex::new(Vec::new()));
            let calls = Arc::new(Mutex::new(0usize));
            for _ in 0..(payloads.len() * fail_every + 1) {
                let delivered = delivered.clone();
                let calls = calls.clone();
                let result = rt.block_on(queue.dequeue(move |_, payload| {
                    let delivered = delivered.clone();
                    let calls = calls.clone();
                    async move {
                        let mut n = calls.lock().unwrap();
                        *n += 1;
                        if *n % fail_every == 0 {
                            return Err(());
                        }
                        delivered.lock().unwrap().push(payload);
                        Ok(())
                    }
                }));
                if matches!(result, Err(DequeueError::Queue(QueueError::Empty))) {
                    break;
                }
            }

            prop_assert_eq!(&*delivered.lock().unwrap(), &payloads);
            prop_assert!(queue.is_empty().unwrap());
        }
    }
}
