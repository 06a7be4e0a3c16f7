//! Session tokens issued by the ticket API's login endpoint.
//!
//! The login response looks like:
//!
//! ```json
//! {
//!   "JSESSIONID": "1973D50D4C576BFBAA889B8726A2FF77",
//!   "issued_at": "1658754363080",
//!   "access_token": "iugVuMjlGng4Lwgdj3LbcE3ehGIB",
//!   "expires_in": "7199",
//!   "refresh_count": "0"
//! }
//! ```
//!
//! `issued_at` is epoch milliseconds and `expires_in` is seconds, both sent as
//! strings. A refused login reuses the same shape with error fields set.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::error::ServerError;

/// A token as the server sent it. This is also the on-disk cache format.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawToken {
    #[serde(flatten)]
    pub error: ServerError,

    #[serde(rename = "JSESSIONID", default)]
    pub session_id: String,

    #[serde(default)]
    pub access_token: String,

    #[serde(default)]
    pub issued_at: String,

    #[serde(default)]
    pub expires_in: String,

    #[serde(default)]
    pub refresh_count: String,
}

/// Why a raw token could not be turned into a usable one.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    /// The server embedded an error instead of issuing a session.
    #[error("login refused: {0}")]
    Refused(String),

    #[error("missing session id")]
    MissingSession,

    #[error("parse issued_at ({0:?})")]
    IssuedAt(String),

    #[error("parse expires_in ({0:?})")]
    ExpiresIn(String),
}

/// A parsed session with its computed expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    raw: RawToken,
    expires_at: DateTime<Utc>,
}

impl Token {
    /// Validates a raw token and computes `issued_at + expires_in`.
    pub fn from_raw(raw: RawToken) -> Result<Self, TokenError> {
        if let Some(message) = raw.error.describe() {
            return Err(TokenError::Refused(message));
        }
        if raw.session_id.is_empty() {
            return Err(TokenError::MissingSession);
        }

        let issued_ms: i64 = raw
            .issued_at
            .trim()
            .parse()
            .map_err(|_| TokenError::IssuedAt(raw.issued_at.clone()))?;
        let expires_secs: i64 = raw
            .expires_in
            .trim()
            .parse()
            .map_err(|_| TokenError::ExpiresIn(raw.expires_in.clone()))?;

        let issued_at = DateTime::from_timestamp_millis(issued_ms)
            .ok_or_else(|| TokenError::IssuedAt(raw.issued_at.clone()))?;
        let lifetime = TimeDelta::try_seconds(expires_secs)
            .ok_or_else(|| TokenError::ExpiresIn(raw.expires_in.clone()))?;
        let expires_at = issued_at
            .checked_add_signed(lifetime)
            .ok_or_else(|| TokenError::ExpiresIn(raw.expires_in.clone()))?;

        Ok(Token { raw, expires_at })
    }

    /// Whether the token can be used at `now`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.raw.session_id.is_empty() && now < self.expires_at && self.raw.error.describe().is_none()
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    pub fn session_id(&self) -> &str {
        &self.raw.session_id
    }

    pub fn access_token(&self) -> &str {
        &self.raw.access_token
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn raw(&self) -> &RawToken {
        &self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOGIN_RESPONSE: &str = r#"{
        "JSESSIONID": "1973D50D4C576BFBAA889B8726A2FF77",
        "issued_at": "1658754363080",
        "access_token": "iugVuMjlGng4Lwgdj3LbcE3ehGIB",
        "expires_in": "7199",
        "refresh_count": "0"
    }"#;

    fn parse(json: &str) -> Result<Token, TokenError> {
        Token::from_raw(serde_json::from_str(json).unwrap())
    }

    #[test]
    fn parses_login_response() {
        let token = parse(LOGIN_RESPONSE).unwrap();

        assert_eq!(token.session_id(), "1973D50D4C576BFBAA889B8726A2FF77");
        assert_eq!(token.access_token(), "iugVuMjlGng4Lwgdj3LbcE3ehGIB");
        assert_eq!(token.expires_at().timestamp_millis(), 1658754363080 + 7199 * 1000);
    }

    #[test]
    fn validity_ends_at_expiry() {
        let token = parse(LOGIN_RESPONSE).unwrap();
        let expiry = token.expires_at();

        assert!(token.is_valid_at(expiry - TimeDelta::seconds(1)));
        assert!(!token.is_valid_at(expiry));
        assert!(!token.is_valid());
    }

    #[test]
    fn refused_login_is_an_error() {
        let err = parse(r#"{"errorCode":"401","error":"bad credentials"}"#).unwrap_err();
        assert_eq!(err, TokenError::Refused("401: bad credentials".to_string()));

        let err = parse(r#"{"fault":{"faultstring":"Invalid ApiKey","detail":{"errorcode":"oauth.v2.InvalidApiKey"}}}"#)
            .unwrap_err();
        assert!(matches!(err, TokenError::Refused(_)));
    }

    #[test]
    fn malformed_fields_are_rejected() {
        assert_eq!(parse(r#"{"issued_at":"1","expires_in":"1"}"#), Err(TokenError::MissingSession));
        assert!(matches!(
            parse(r#"{"JSESSIONID":"s","issued_at":"soon","expires_in":"1"}"#),
            Err(TokenError::IssuedAt(_))
        ));
        assert!(matches!(
            parse(r#"{"JSESSIONID":"s","issued_at":"1","expires_in":""}"#),
            Err(TokenError::ExpiresIn(_))
        ));
    }

    #[test]
    fn cache_format_round_trips() {
        let raw: RawToken = serde_json::from_str(LOGIN_RESPONSE).unwrap();
        let json = serde_json::to_value(&raw).unwrap();

        assert_eq!(json["JSESSIONID"], "1973D50D4C576BFBAA889B8726A2FF77");
        assert!(json.get("errorCode").is_none());
        assert_eq!(serde_json::from_value::<RawToken>(json).unwrap(), raw);
    }
}
