//! Authenticated access to the ticket API.
//!
//! This module provides:
//! - [`AuthToken`]: the per-destination session holder that logs in lazily
//!   and executes requests with the session attached
//! - [`ApiError`]: failures classified as transient, application, or
//!   authentication errors
//! - [`Token`] / [`RawToken`]: the issued session and its wire form

pub mod error;
pub mod manager;
pub mod token;

pub use error::{ApiError, ApiErrorKind, ServerError};
pub use manager::{
    ApiRequest, ApiResponse, AuthToken, Credentials, DEFAULT_REQUEST_TIMEOUT,
    DEFAULT_SESSION_COOKIE, RequestBody,
};
pub use token::{RawToken, Token, TokenError};
