//! Durable files outside the queues themselves.
//!
//! - [`fsync`]: atomic write-then-rename helpers shared with the queue
//! - [`token_cache`]: issued session tokens, kept across restarts

pub mod fsync;
pub mod token_cache;

pub use fsync::{fsync_dir, fsync_file, write_atomic};
pub use token_cache::{TokenCache, TokenCacheError, persist_tokens, redact_url, seed_from_cache};
