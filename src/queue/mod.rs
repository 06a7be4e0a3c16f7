//! Filesystem-backed work queue.
//!
//! Each destination owns one directory. Producers drop items in with an atomic
//! rename; a single consumer (guarded by an advisory directory lock) drains
//! them in arrival order.
//!
//! ```text
//! <queue-dir>/
//! ├── destination.json                       # written by the relay, ignored here
//! ├── 01J...26chars.dirq-item.dat            # visible items
//! └── 01J...26chars.dirq-item.dat.y          # item being processed
//! ```

pub mod durable;
pub mod item;
pub mod lock;
pub mod notifier;

pub use durable::{DequeueError, DurableQueue, QueueError};
pub use item::QueueItem;
pub use lock::{DirectoryLock, FileLock};
pub use notifier::{ChangeNotifier, ChannelNotifier, FsChangeNotifier, pass_limiter, run_watch};
