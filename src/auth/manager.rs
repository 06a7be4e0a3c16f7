//! Lazily refreshed session for one ticket API destination.
//!
//! # Lifecycle
//!
//! ```text
//! Unset --ensure()/login--> Valid --time passes / 401--> Expired --ensure()--> Valid
//! ```
//!
//! The token lives behind an async mutex that is held across the login call,
//! so any number of concurrent callers hitting an expired token cause exactly
//! one login.

use std::time::Duration;

use reqwest::header::{CONTENT_TYPE, COOKIE};
use reqwest::{Client, Method, Url};
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::retry::{Backoff, BackoffProfile, RetryResult, retry_with_backoff};

use super::error::{ApiError, Result};
use super::token::{RawToken, Token, TokenError};

/// Cookie name carrying the session id unless the destination overrides it.
pub const DEFAULT_SESSION_COOKIE: &str = "JSESSIONID";

/// Request timeout for destinations that don't set one.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Login credentials for a destination.
#[derive(Clone, Default)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials {
            username: username.into(),
            password: password.into(),
        }
    }

    fn is_empty(&self) -> bool {
        self.username.is_empty() || self.password.is_empty()
    }
}

/// Body of an API request.
#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,

    Json(serde_json::Value),

    /// A single-file multipart upload.
    Multipart {
        field: String,
        file_name: String,
        mime_type: String,
        data: Vec<u8>,
    },
}

/// A request relative to the destination's base URL.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: RequestBody,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        ApiRequest {
            method: Method::GET,
            path: path.into(),
            query: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn post_json(path: impl Into<String>, body: serde_json::Value) -> Self {
        ApiRequest {
            method: Method::POST,
            path: path.into(),
            query: Vec::new(),
            body: RequestBody::Json(body),
        }
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }
}

/// A successful API response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl ApiResponse {
    /// Decodes the body. An unreadable body is transient: a proxy or a
    /// half-deployed server is the usual cause.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| {
            ApiError::transient(format!("unparsable response body: {e}"))
        })
    }
}

#[derive(Serialize)]
struct LoginBody<'a> {
    username: &'a str,
    password: &'a str,
}

/// Session holder and authenticated request executor for one destination.
pub struct AuthToken {
    client: Client,
    base_url: Url,
    auth_url: Url,
    credentials: Credentials,
    session_cookie: String,
    login_profile: BackoffProfile,
    state: Mutex<Option<Token>>,
    changes: watch::Sender<Option<RawToken>>,
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthToken")
            .field("base_url", &self.base_url.as_str())
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

impl AuthToken {
    /// Creates an unset token for the API under `base_url`.
    ///
    /// The login endpoint is `<base_url>/auth`.
    pub fn new(client: Client, base_url: Url, credentials: Credentials) -> Result<Self> {
        let base_url = with_trailing_slash(base_url);
        let auth_url = base_url
            .join("auth")
            .map_err(|e| ApiError::authentication(format!("invalid auth URL: {e}")))?;
        let (changes, _) = watch::channel(None);

        Ok(AuthToken {
            client,
            base_url,
            auth_url,
            credentials,
            session_cookie: DEFAULT_SESSION_COOKIE.to_string(),
            login_profile: BackoffProfile::LOGIN,
            state: Mutex::new(None),
            changes,
        })
    }

    /// Sets the cookie name carrying the session id.
    pub fn with_session_cookie(mut self, name: impl Into<String>) -> Self {
        self.session_cookie = name.into();
        self
    }

    /// Sets the retry profile used within one login.
    pub fn with_login_profile(mut self, profile: BackoffProfile) -> Self {
        self.login_profile = profile;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Receives every freshly issued token.
    pub fn subscribe(&self) -> watch::Receiver<Option<RawToken>> {
        self.changes.subscribe()
    }

    /// Installs a previously issued token, typically from the cache file.
    ///
    /// Returns false, leaving the state untouched, if the token is unusable or
    /// a valid one is already held.
    pub async fn seed(&self, raw: RawToken) -> bool {
        match Token::from_raw(raw) {
            Ok(token) if token.is_valid() => {
                let mut state = self.state.lock().await;
                if state.as_ref().is_some_and(Token::is_valid) {
                    return false;
                }
                debug!(expires_at = %token.expires_at(), "Seeded cached token");
                *state = Some(token);
                true
            }
            Ok(_) => {
                debug!("Cached token already expired");
                false
            }
            Err(e) => {
                debug!(error = %e, "Cached token unusable");
                false
            }
        }
    }

    /// Drops the current token so the next call logs in again.
    pub async fn invalidate(&self) {
        *self.state.lock().await = None;
    }

    /// Drops the current token only if it still carries `session_id`.
    ///
    /// A token issued after the rejected request went out is kept. Returns
    /// whether anything was dropped.
    pub async fn invalidate_session(&self, session_id: &str) -> bool {
        let mut state = self.state.lock().await;
        if state.as_ref().is_some_and(|t| t.session_id() == session_id) {
            *state = None;
            true
        } else {
            false
        }
    }

    /// Returns a valid token, logging in if needed.
    ///
    /// # Errors
    ///
    /// - `Authentication` if credentials are empty, the server refuses them,
    ///   or every attempt under the login profile failed
    /// - `Transient` if cancelled
    #[instrument(skip(self, cancel), fields(url = %self.auth_url))]
    pub async fn ensure(&self, cancel: &CancellationToken) -> Result<Token> {
        let mut state = tokio::select! {
            _ = cancel.cancelled() => return Err(ApiError::transient("cancelled")),
            guard = self.state.lock() => guard,
        };

        if let Some(token) = state.as_ref()
            && token.is_valid()
        {
            return Ok(token.clone());
        }

        if self.credentials.is_empty() {
            return Err(ApiError::authentication("empty username or password"));
        }

        let mut backoff = Backoff::new(self.login_profile);
        let result = retry_with_backoff(&mut backoff, cancel, ApiError::is_retriable, || {
            self.login(cancel)
        })
        .await;

        match result {
            RetryResult::Success(token) => {
                info!(expires_at = %token.expires_at(), "Logged in");
                *state = Some(token.clone());
                self.changes.send_replace(Some(token.raw().clone()));
                Ok(token)
            }
            _ if cancel.is_cancelled() => Err(ApiError::transient("cancelled")),
            RetryResult::Exhausted {
                last_error,
                attempts,
            } => {
                warn!(attempts, error = %last_error, "Login retries exhausted");
                Err(ApiError::authentication(format!(
                    "login failed after {attempts} attempts: {last_error}"
                )))
            }
            RetryResult::Permanent(e) => {
                warn!(error = %e, "Login refused");
                Err(ApiError::authentication(format!("login refused: {}", e.message)))
            }
        }
    }

    /// One login round trip. Transient errors are retried by `ensure`.
    async fn login(&self, cancel: &CancellationToken) -> Result<Token> {
        let body = LoginBody {
            username: &self.credentials.username,
            password: &self.credentials.password,
        };
        let request = self
            .client
            .post(self.auth_url.clone())
            .query(&[("grant_type", "password")])
            .header(CONTENT_TYPE, "application/json")
            .json(&body);

        let (status, bytes) = send(request, cancel).await?;
        if let Some(mut e) = ApiError::from_response(status, &bytes) {
            // A refused login is final, whatever status carried it.
            if e.is_unauthorized() || status == 403 {
                e.kind = super::error::ApiErrorKind::Application;
            }
            return Err(e);
        }

        let raw: RawToken = serde_json::from_slice(&bytes)
            .map_err(|e| ApiError::transient(format!("unparsable login response: {e}")))?;
        Token::from_raw(raw).map_err(|e| match e {
            TokenError::Refused(message) => ApiError::application(message),
            other => ApiError::transient(other.to_string()),
        })
    }

    /// Runs an authenticated request and classifies the outcome.
    ///
    /// A 401 drops the cached token before the (transient) error is returned,
    /// so the next call logs in again.
    #[instrument(skip(self, request, cancel), fields(method = %request.method, path = %request.path))]
    pub async fn execute(&self, request: ApiRequest, cancel: &CancellationToken) -> Result<ApiResponse> {
        let token = self.ensure(cancel).await?;

        let url = self
            .base_url
            .join(request.path.trim_start_matches('/'))
            .map_err(|e| ApiError::application(format!("invalid request path: {e}")))?;

        let mut builder = self
            .client
            .request(request.method, url)
            .header(COOKIE, format!("{}={}", self.session_cookie, token.session_id()))
            .bearer_auth(token.access_token());
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(&value),
            RequestBody::Multipart {
                field,
                file_name,
                mime_type,
                data,
            } => {
                let part = reqwest::multipart::Part::bytes(data)
                    .file_name(file_name)
                    .mime_str(&mime_type)
                    .map_err(|e| ApiError::application(format!("invalid MIME type: {e}")))?;
                builder.multipart(reqwest::multipart::Form::new().part(field, part))
            }
        };

        let (status, body) = send(builder, cancel).await?;
        if let Some(e) = ApiError::from_response(status, &body) {
            if e.is_unauthorized() && self.invalidate_session(token.session_id()).await {
                debug!("Session rejected, dropped token");
            }
            return Err(e);
        }

        Ok(ApiResponse { status, body })
    }
}

/// Sends a request and reads the whole body, or gives up on cancellation.
async fn send(request: reqwest::RequestBuilder, cancel: &CancellationToken) -> Result<(u16, Vec<u8>)> {
    let exchange = async {
        let response = request.send().await.map_err(ApiError::from_reqwest)?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(ApiError::from_reqwest)?;
        Ok((status, body.to_vec()))
    };

    tokio::select! {
        _ = cancel.cancelled() => Err(ApiError::transient("cancelled")),
        result = exchange => result,
    }
}

fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}
