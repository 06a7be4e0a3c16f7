//! Destination registry: maps destinations to queue directories and runs one
//! dispatcher per directory.
//!
//! # Layout
//!
//! ```text
//! <queues dir>/
//! ├── tokens.json                      # token cache
//! └── <hex sha512/224 of config>/      # one queue per destination
//!     ├── destination.json             # the config the name was derived from
//!     └── *.dirq-item.dat              # queued tasks
//! ```
//!
//! Naming a queue after the hash of its config means producers and the
//! consumer agree on the directory without any shared registry, and a changed
//! config (new URL, new password) starts a fresh queue.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512_224};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::auth::{ApiError, AuthToken, Credentials, DEFAULT_REQUEST_TIMEOUT, DEFAULT_SESSION_COOKIE};
use crate::dispatch::{AlertAggregator, Dispatcher, RelayConfig, TaskHandler};
use crate::dispatch::alert::DEFAULT_FLUSH_INTERVAL;
use crate::persistence::fsync::write_atomic;
use crate::persistence::{TokenCache, persist_tokens, seed_from_cache};
use crate::queue::{DurableQueue, FsChangeNotifier, QueueError};
use crate::ticket::TicketClient;
use crate::types::{DestinationId, ItemId, Task};

/// Config file written next to each queue.
pub const DESTINATION_FILE: &str = "destination.json";

/// Errors from the destination registry.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("invalid base URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

fn default_session_cookie() -> String {
    DEFAULT_SESSION_COOKIE.to_string()
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT.as_secs()
}

/// Everything needed to reach one ticket API.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationConfig {
    /// API root; the login endpoint is `<base_url>/auth`.
    pub base_url: String,
    pub username: String,
    pub password: String,

    #[serde(default = "default_session_cookie")]
    pub session_cookie: String,

    /// Ticket field holding the upstream id, for pre-delivery checks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id_field: Option<String>,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl std::fmt::Debug for DestinationConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DestinationConfig")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("session_cookie", &self.session_cookie)
            .field("external_id_field", &self.external_id_field)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

impl DestinationConfig {
    pub fn new(base_url: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        DestinationConfig {
            base_url: base_url.into(),
            username: username.into(),
            password: password.into(),
            session_cookie: default_session_cookie(),
            external_id_field: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }

    pub fn with_external_id_field(mut self, field: impl Into<String>) -> Self {
        self.external_id_field = Some(field.into());
        self
    }

    pub fn url(&self) -> Result<Url> {
        Url::parse(&self.base_url).map_err(|e| RelayError::InvalidUrl {
            url: self.base_url.clone(),
            reason: e.to_string(),
        })
    }

    /// Builds the session holder for this destination.
    pub fn auth_token(&self) -> Result<AuthToken> {
        let timeout = Duration::from_secs(self.request_timeout_secs.max(1));
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let auth = AuthToken::new(
            client,
            self.url()?,
            Credentials::new(&self.username, &self.password),
        )?;
        Ok(auth.with_session_cookie(&self.session_cookie))
    }
}

/// Queue directory name for a destination: hex SHA-512/224 of its config JSON.
pub fn queue_name(config: &DestinationConfig) -> Result<DestinationId> {
    let json = serde_json::to_vec(config)?;
    Ok(DestinationId::new(hex::encode(Sha512_224::digest(&json))))
}

/// Enqueues tasks on behalf of producers.
///
/// Keeps one queue handle per destination so ids generated within this
/// process stay strictly ordered.
#[derive(Debug)]
pub struct Producer {
    root: PathBuf,
    queues: Mutex<HashMap<DestinationId, Arc<DurableQueue>>>,
}

impl Producer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Producer {
            root: root.into(),
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Appends `task` to the destination's queue, creating the queue and its
    /// config file on first use.
    #[instrument(skip(self, config, task), fields(kind = task.kind()))]
    pub fn enqueue_task(&self, config: &DestinationConfig, task: &Task) -> Result<ItemId> {
        let queue = self.queue_for(config)?;
        let payload = serde_json::to_vec(task)?;
        let id = queue.enqueue(&payload)?;
        debug!(id = %id, dir = %queue.dir().display(), "Task enqueued");
        Ok(id)
    }

    fn queue_for(&self, config: &DestinationConfig) -> Result<Arc<DurableQueue>> {
        let name = queue_name(config)?;
        if let Some(queue) = self.queues.lock().unwrap_or_else(|e| e.into_inner()).get(&name) {
            return Ok(queue.clone());
        }

        let dir = self.root.join(name.as_str());
        std::fs::create_dir_all(&dir)?;
        write_destination(&dir, config)?;
        let opened = Arc::new(DurableQueue::open(&dir)?);

        // A concurrent first use may have won; its handle is the one to share.
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        Ok(queues.entry(name).or_insert(opened).clone())
    }
}

/// Writes `destination.json` unless an equally sized one is already there.
fn write_destination(dir: &Path, config: &DestinationConfig) -> Result<()> {
    let bytes = serde_json::to_vec(config)?;
    let path = dir.join(DESTINATION_FILE);

    match std::fs::metadata(&path) {
        Ok(meta) if meta.len() == bytes.len() as u64 => return Ok(()),
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    info!(path = %path.display(), "Writing destination config");
    // Unique per writer: producers in other threads or processes may race here.
    let tmp = dir.join(format!(".tmp-{}-{DESTINATION_FILE}", ulid::Ulid::new()));
    write_atomic(&tmp, &path, &bytes)?;
    Ok(())
}

/// Reads a queue directory's config. `None` if there isn't one yet.
pub fn read_destination(dir: &Path) -> Result<Option<DestinationConfig>> {
    match std::fs::read(dir.join(DESTINATION_FILE)) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// The consumer side: discovers queue directories and runs their dispatchers.
pub struct Relay {
    config: RelayConfig,
    alerts: Arc<AlertAggregator>,
    tokens: Arc<TokenCache>,

    /// Destinations already handled, by directory name. Includes ones whose
    /// config was unusable, so they are reported once.
    known: HashMap<String, Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("config", &self.config)
            .field("destinations", &self.known.len())
            .finish_non_exhaustive()
    }
}

impl Relay {
    pub fn new(config: RelayConfig, alerts: Arc<AlertAggregator>) -> Self {
        let tokens = Arc::new(TokenCache::load(&config.token_cache));
        Relay {
            config,
            alerts,
            tokens,
            known: HashMap::new(),
        }
    }

    /// Number of running dispatchers.
    pub fn running(&self) -> usize {
        self.known.values().filter(|h| h.is_some()).count()
    }

    /// Starts dispatchers for queue directories not seen before.
    ///
    /// Returns how many were started.
    #[instrument(skip(self, cancel), fields(root = %self.config.queues_dir.display()))]
    pub async fn scan(&mut self, cancel: &CancellationToken) -> Result<usize> {
        let mut started = 0;

        for entry in std::fs::read_dir(&self.config.queues_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if self.known.contains_key(&name) {
                continue;
            }

            let dir = entry.path();
            match self.start(&name, &dir, cancel).await {
                Ok(Some(handle)) => {
                    self.known.insert(name, Some(handle));
                    started += 1;
                }
                Ok(None) => debug!(dir = %dir.display(), "No destination config yet"),
                Err(e) => {
                    error!(dir = %dir.display(), error = %e, "Cannot start destination");
                    self.known.insert(name, None);
                }
            }
        }

        Ok(started)
    }

    async fn start(&self, name: &str, dir: &Path, cancel: &CancellationToken) -> Result<Option<JoinHandle<()>>> {
        let Some(destination) = read_destination(dir)? else {
            return Ok(None);
        };

        let auth = Arc::new(destination.auth_token()?);
        if seed_from_cache(&self.tokens, &auth).await {
            debug!(destination = name, "Reusing cached session");
        }
        tokio::spawn(persist_tokens(self.tokens.clone(), auth.clone(), cancel.clone()));

        let queue = Arc::new(DurableQueue::open(dir)?);
        let notifier = match FsChangeNotifier::watch(dir) {
            Ok(notifier) => Some(notifier),
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Filesystem watch unavailable, polling only");
                None
            }
        };

        let handler = TaskHandler::new(TicketClient::new(auth), destination.external_id_field.clone());
        let dispatcher = Arc::new(Dispatcher::new(
            DestinationId::new(name),
            queue,
            handler,
            self.alerts.clone(),
            self.config.dispatcher,
        ));

        info!(destination = name, url = %destination.base_url, "Starting dispatcher");
        Ok(Some(tokio::spawn(dispatcher.run(notifier, cancel.clone()))))
    }

    /// Scans now and every scan interval until cancelled, then waits for all
    /// dispatchers to release their queues.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        std::fs::create_dir_all(&self.config.queues_dir)?;
        info!(
            root = %self.config.queues_dir.display(),
            scan_interval_secs = self.config.scan_interval.as_secs(),
            "Relay started"
        );

        let alerts = self.alerts.clone();
        let alert_cancel = cancel.clone();
        let flusher = tokio::spawn(async move { alerts.run(DEFAULT_FLUSH_INTERVAL, alert_cancel).await });

        // Outlives the dispatchers so tokens issued during shutdown are saved.
        let writer_cancel = CancellationToken::new();
        let writer = tokio::spawn(self.tokens.clone().run_writer(writer_cancel.clone()));

        loop {
            match self.scan(&cancel).await {
                Ok(0) => {}
                Ok(started) => info!(started, running = self.running(), "Destinations started"),
                Err(e) => error!(error = %e, "Scan failed"),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.scan_interval) => {}
            }
        }

        for (name, handle) in self.known.drain() {
            if let Some(handle) = handle
                && let Err(e) = handle.await
            {
                error!(destination = %name, error = %e, "Dispatcher task failed");
            }
        }
        writer_cancel.cancel();
        if let Err(e) = writer.await {
            error!(error = %e, "Token cache writer failed");
        }
        if let Err(e) = flusher.await {
            error!(error = %e, "Alert flusher failed");
        }

        info!("Relay stopped");
        Ok(())
    }
}
