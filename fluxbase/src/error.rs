//! Error taxonomy and HTTP response conversion
//!
//! Every failure surfaced to a client carries a stable machine-readable
//! `code` plus a safe human message. Internal detail never leaves the
//! process: it is logged together with the request id and replaced by a
//! generic message in the response body.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias using the service error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the service
///
/// Variants correspond to the stable error kinds of the public API.
/// Anything that does not fit a public kind is `Internal` and is reported
/// generically.
#[derive(Debug, Error)]
pub enum Error {
    /// Wrong email/password pair, or unknown account (indistinguishable)
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// Account locked out after repeated failures
    #[error("Account is temporarily locked")]
    AccountLocked,

    /// Sign-in attempted before email verification
    #[error("Email address is not verified")]
    EmailNotVerified,

    /// Sign-up with an email that already has an account
    #[error("Email address is already registered")]
    EmailTaken,

    /// Password rejected by the strength policy
    #[error("Password too weak: {0}")]
    WeakPassword(String),

    /// Token failed signature, shape or session binding checks
    #[error("Invalid token")]
    TokenInvalid,

    /// Token expired
    #[error("Token has expired")]
    TokenExpired,

    /// Token was explicitly revoked or superseded
    #[error("Token has been revoked")]
    TokenRevoked,

    /// CSRF token missing, expired or mismatched
    #[error("CSRF validation failed")]
    CsrfInvalid,

    /// Rate limit exceeded; carries seconds until the window resets
    #[error("Rate limit exceeded")]
    RateLimited { retry_after: u64 },

    /// Endpoint requires a CAPTCHA token and none was supplied
    #[error("CAPTCHA token required")]
    CaptchaRequired,

    /// CAPTCHA provider rejected the token
    #[error("CAPTCHA verification failed")]
    CaptchaInvalid,

    /// CAPTCHA token expired before verification
    #[error("CAPTCHA token expired")]
    CaptchaExpired,

    /// Score-based provider returned a score below the threshold
    #[error("CAPTCHA score too low")]
    CaptchaScoreTooLow,

    /// Authenticated but not allowed
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Service key lacks a required scope
    #[error("Insufficient scope: {0}")]
    ScopeInsufficient(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Conflicting state (duplicate key, concurrent update loser)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Malformed or invalid request input
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// AEAD open failure or malformed ciphertext
    #[error("Decryption failed")]
    CryptoInvalid,

    /// Configuration error (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database failure; message stays server-side
    #[error("Database error: {0}")]
    Database(String),

    /// Upstream collaborator (IdP, CAPTCHA provider, SMTP) failed
    #[error("External service error: {0}")]
    External(String),

    /// Anything else; message stays server-side
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable kind identifier, as exposed in the response `error` field
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidCredentials => "invalid_credentials",
            Self::AccountLocked => "account_locked",
            Self::EmailNotVerified => "email_not_verified",
            Self::EmailTaken => "email_taken",
            Self::WeakPassword(_) => "weak_password",
            Self::TokenInvalid => "token_invalid",
            Self::TokenExpired => "token_expired",
            Self::TokenRevoked => "token_revoked",
            Self::CsrfInvalid => "csrf_invalid",
            Self::RateLimited { .. } => "rate_limited",
            Self::CaptchaRequired => "captcha_required",
            Self::CaptchaInvalid => "captcha_invalid",
            Self::CaptchaExpired => "captcha_expired",
            Self::CaptchaScoreTooLow => "captcha_score_too_low",
            Self::Forbidden(_) => "forbidden",
            Self::ScopeInsufficient(_) => "scope_insufficient",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::BadRequest(_) => "bad_request",
            Self::CryptoInvalid => "crypto_invalid",
            Self::Config(_) | Self::Database(_) | Self::External(_) | Self::Internal(_) => {
                "internal"
            }
        }
    }

    /// HTTP status the kind maps to
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidCredentials
            | Self::TokenInvalid
            | Self::TokenExpired
            | Self::TokenRevoked
            | Self::CsrfInvalid => StatusCode::UNAUTHORIZED,
            Self::AccountLocked
            | Self::EmailNotVerified
            | Self::Forbidden(_)
            | Self::ScopeInsufficient(_) => StatusCode::FORBIDDEN,
            Self::EmailTaken
            | Self::WeakPassword(_)
            | Self::CaptchaRequired
            | Self::CaptchaInvalid
            | Self::CaptchaExpired
            | Self::CaptchaScoreTooLow
            | Self::BadRequest(_)
            | Self::CryptoInvalid => StatusCode::BAD_REQUEST,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::External(_) => StatusCode::BAD_GATEWAY,
            Self::Config(_) | Self::Database(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Whether the client-facing message may include the variant's text.
    ///
    /// Server-side variants always collapse to a generic message.
    fn safe_message(&self) -> String {
        match self {
            Self::Config(_) | Self::Database(_) | Self::Internal(_) => {
                "Internal server error".to_string()
            }
            Self::External(_) => "Upstream service unavailable".to_string(),
            other => other.to_string(),
        }
    }

    /// Stable uppercase code for the response body
    fn code(&self) -> &'static str {
        match self {
            Self::InvalidCredentials => "AUTH_INVALID_CREDENTIALS",
            Self::AccountLocked => "AUTH_ACCOUNT_LOCKED",
            Self::EmailNotVerified => "AUTH_EMAIL_NOT_VERIFIED",
            Self::EmailTaken => "AUTH_EMAIL_TAKEN",
            Self::WeakPassword(_) => "AUTH_WEAK_PASSWORD",
            Self::TokenInvalid => "TOKEN_INVALID",
            Self::TokenExpired => "TOKEN_EXPIRED",
            Self::TokenRevoked => "TOKEN_REVOKED",
            Self::CsrfInvalid => "CSRF_INVALID",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::CaptchaRequired => "CAPTCHA_REQUIRED",
            Self::CaptchaInvalid => "CAPTCHA_INVALID",
            Self::CaptchaExpired => "CAPTCHA_EXPIRED",
            Self::CaptchaScoreTooLow => "CAPTCHA_SCORE_TOO_LOW",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::ScopeInsufficient(_) => "SCOPE_INSUFFICIENT",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::CryptoInvalid => "CRYPTO_INVALID",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::External(_) => "EXTERNAL_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Seconds the client should wait, for rate-limited responses
    fn retry_after(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Stable error kind
    pub error: String,

    /// Safe human-readable message
    pub message: String,

    /// Stable uppercase code
    pub code: String,

    /// Seconds until retry is worthwhile (rate limiting only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl ErrorResponse {
    /// Build the response body for an error
    pub fn from_error(err: &Error) -> Self {
        Self {
            error: err.kind().to_string(),
            message: err.safe_message(),
            code: err.code().to_string(),
            retry_after: err.retry_after(),
        }
    }
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error, self.message)
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();

        // Server-side detail is logged here, never echoed
        match &self {
            Error::Config(msg) | Error::Database(msg) | Error::Internal(msg) => {
                tracing::error!(code = self.code(), "{}", msg);
            }
            Error::External(msg) => {
                tracing::warn!(code = self.code(), "{}", msg);
            }
            _ => {}
        }

        let body = ErrorResponse::from_error(&self);
        let mut response = (status, Json(body)).into_response();

        if let Error::RateLimited { retry_after } = self {
            if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Error::NotFound("row not found".to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Error::Conflict("duplicate key".to_string())
            }
            // Tag serialization failures so scope retry logic can spot them
            sqlx::Error::Database(db) if db.code().as_deref() == Some("40001") => {
                Error::Database(format!("serialization failure (40001): {}", db))
            }
            _ => Error::Database(err.to_string()),
        }
    }
}

impl From<jsonwebtoken::errors::Error> for Error {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match err.kind() {
            ErrorKind::ExpiredSignature => Error::TokenExpired,
            _ => Error::TokenInvalid,
        }
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(format!("JSON serialization failed: {}", err))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal(format!("I/O error: {}", err))
    }
}

/// True for PostgreSQL serialization failures eligible for one in-scope retry
pub fn is_serialization_failure(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("40001"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_status_mapping() {
        assert_eq!(Error::InvalidCredentials.kind(), "invalid_credentials");
        assert_eq!(Error::InvalidCredentials.status(), StatusCode::UNAUTHORIZED);

        assert_eq!(Error::AccountLocked.status(), StatusCode::FORBIDDEN);
        assert_eq!(Error::EmailTaken.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            Error::RateLimited { retry_after: 30 }.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            Error::Conflict("refresh race".into()).status(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn test_internal_detail_is_not_echoed() {
        let err = Error::Database("SELECT * FROM auth.users blew up".to_string());
        let body = ErrorResponse::from_error(&err);
        assert_eq!(body.error, "internal");
        assert_eq!(body.message, "Internal server error");
        assert!(!body.message.contains("SELECT"));
    }

    #[test]
    fn test_credential_errors_are_uniform() {
        // Unknown account and wrong password must produce identical bodies
        let a = ErrorResponse::from_error(&Error::InvalidCredentials);
        let b = ErrorResponse::from_error(&Error::InvalidCredentials);
        assert_eq!(a.error, b.error);
        assert_eq!(a.message, b.message);
    }

    #[test]
    fn test_retry_after_serialized_only_when_present() {
        let limited = ErrorResponse::from_error(&Error::RateLimited { retry_after: 42 });
        let json = serde_json::to_string(&limited).unwrap();
        assert!(json.contains("\"retry_after\":42"));

        let plain = ErrorResponse::from_error(&Error::TokenInvalid);
        let json = serde_json::to_string(&plain).unwrap();
        assert!(!json.contains("retry_after"));
    }

    #[test]
    fn test_rate_limited_response_has_retry_after_header() {
        let response = Error::RateLimited { retry_after: 7 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            &HeaderValue::from_static("7")
        );
    }

    #[test]
    fn test_jwt_error_conversion() {
        let expired = jsonwebtoken::errors::Error::from(
            jsonwebtoken::errors::ErrorKind::ExpiredSignature,
        );
        assert!(matches!(Error::from(expired), Error::TokenExpired));

        let bad = jsonwebtoken::errors::Error::from(
            jsonwebtoken::errors::ErrorKind::InvalidSignature,
        );
        assert!(matches!(Error::from(bad), Error::TokenInvalid));
    }
}
