//! Ticket API error types.
//!
//! Every failed remote call is classified for the dispatcher:
//!
//! - **Transient** errors are retried with backoff (transport failures, 5xx,
//!   408, 429, unreadable response bodies, and 401 after the cached token has
//!   been dropped)
//! - **Application** errors are never retried: the API understood the request
//!   and refused it (structured error bodies, remaining 4xx)
//! - **Authentication** errors mean no session could be obtained at all

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The kind of API error, categorized for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    /// Safe to retry with backoff.
    Transient,

    /// The request was rejected on its merits. Retrying cannot help.
    Application,

    /// Login failed or credentials are missing.
    Authentication,
}

impl ApiErrorKind {
    /// Returns true if this error is retriable.
    pub fn is_retriable(&self) -> bool {
        matches!(self, ApiErrorKind::Transient)
    }
}

/// A ticket API error with categorization for retry decisions.
#[derive(Debug, Error)]
pub struct ApiError {
    pub kind: ApiErrorKind,

    /// The HTTP status code, if a response was received.
    pub status_code: Option<u16>,

    /// A human-readable description of the error.
    pub message: String,

    /// The underlying transport error, if any.
    #[source]
    pub source: Option<reqwest::Error>,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "ticket API error (HTTP {}): {}", code, self.message),
            None => write!(f, "ticket API error: {}", self.message),
        }
    }
}

impl ApiError {
    fn new(kind: ApiErrorKind, status_code: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            kind,
            status_code,
            message: message.into(),
            source: None,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Transient, None, message)
    }

    pub fn application(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Application, None, message)
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Authentication, None, message)
    }

    /// Wraps a transport-level failure. Always transient: the request may not
    /// have reached the server.
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        let status_code = err.status().map(|s| s.as_u16());
        Self {
            kind: ApiErrorKind::Transient,
            status_code,
            message: err.to_string(),
            source: Some(err),
        }
    }

    /// Classifies a completed response. Returns `None` for a success.
    ///
    /// A structured error body is an application error even under a 2xx
    /// status; the API reports some refusals that way.
    pub fn from_response(status: u16, body: &[u8]) -> Option<Self> {
        let structured = ServerError::parse(body).and_then(|e| e.describe());

        // The status decides first: a gateway in front of the API wraps its own
        // outages (5xx) in the same error bodies the API uses for refusals.
        let kind = match status {
            401 => ApiErrorKind::Transient,
            408 | 429 => ApiErrorKind::Transient,
            code if (500..600).contains(&code) => ApiErrorKind::Transient,
            code if code >= 400 => ApiErrorKind::Application,
            _ if structured.is_some() => ApiErrorKind::Application,
            _ => return None,
        };

        let message = structured.unwrap_or_else(|| body_excerpt(body));
        Some(Self::new(kind, Some(status), message))
    }

    /// Whether the server rejected the session, so the cached token is stale.
    pub fn is_unauthorized(&self) -> bool {
        self.status_code == Some(401)
    }

    pub fn is_retriable(&self) -> bool {
        self.kind.is_retriable()
    }
}

/// Error details the API embeds in response bodies.
///
/// Two shapes occur: `{"errorCode", "error"}` from the REST layer and a
/// SOAP-style `{"fault": {"faultstring", "detail": {"errorcode"}}}` from the
/// gateway in front of it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    #[serde(rename = "errorCode", alias = "ErrorCode", default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<Fault>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    #[serde(rename = "faultstring", default)]
    pub code: String,

    #[serde(default)]
    pub detail: FaultDetail,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultDetail {
    #[serde(rename = "errorcode", default)]
    pub message: String,
}

impl ServerError {
    /// Parses a body as an error object. Non-JSON or non-object bodies give `None`.
    pub fn parse(body: &[u8]) -> Option<Self> {
        serde_json::from_slice::<ServerError>(body).ok()
    }

    /// "code: message" if the body reports an error.
    pub fn describe(&self) -> Option<String> {
        if let Some(code) = self.error_code.as_deref().filter(|c| !c.is_empty()) {
            return Some(format!("{}: {}", code, self.error.as_deref().unwrap_or_default()));
        }
        if let Some(fault) = &self.fault
            && !fault.code.is_empty()
        {
            return Some(format!("{}: {}", fault.code, fault.detail.message));
        }
        None
    }
}

/// First part of a body for error messages.
fn body_excerpt(body: &[u8]) -> String {
    const MAX: usize = 512;
    let text = String::from_utf8_lossy(body);
    match text.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.into_owned(),
    }
}

/// Result type for ticket API calls.
pub type Result<T> = std::result::Result<T, ApiError>;
