//! Error Types
//!
//! Error hierarchy for the token lifecycle manager, split along the axis the
//! refresh coordinator cares about: transient failures are retried and never
//! kill an identity, terminal failures stop retrying immediately and move the
//! identity to the dead state.

use std::time::Duration;
use thiserror::Error;

/// Root error type for token manager operations.
#[derive(Error, Debug)]
pub enum TokenManagerError {
    #[error("transient refresh failure: {0}")]
    Transient(#[from] TransientRefreshError),

    #[error("terminal refresh failure: {0}")]
    Terminal(#[from] TerminalRefreshError),

    #[error("token load failure: {0}")]
    Load(#[from] TokenLoadError),

    #[error("token storage failure: {0}")]
    Storage(#[from] StorageError),

    #[error("unknown identity: {identity}")]
    UnknownIdentity { identity: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl TokenManagerError {
    /// Get error code for log correlation.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Transient(_) => "TOKEN_TRANSIENT",
            Self::Terminal(_) => "TOKEN_TERMINAL",
            Self::Load(_) => "TOKEN_LOAD",
            Self::Storage(_) => "TOKEN_STORAGE",
            Self::UnknownIdentity { .. } => "TOKEN_UNKNOWN_IDENTITY",
            Self::Internal { .. } => "TOKEN_INTERNAL",
        }
    }

    /// Check if the refresh coordinator may retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Check if this error means the identity can never refresh again
    /// without a new user authorization.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal(_))
    }
}

/// Refresh failure that does not invalidate the stored grant. Retried with
/// backoff; on exhaustion the identity moves to the failed state and stays
/// eligible for automatic retry.
#[derive(Error, Debug)]
pub enum TransientRefreshError {
    #[error("connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("request timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },

    #[error("provider server error (HTTP {status}): {message}")]
    ServerError { status: u16, message: String },
}

/// Refresh failure where the provider rejected the grant itself. Never
/// retried; the identity moves to the dead state and requires the manual
/// re-authorization flow.
#[derive(Error, Debug)]
pub enum TerminalRefreshError {
    #[error("refresh grant rejected: {message}")]
    InvalidGrant { message: String },

    #[error("client credentials rejected: {message}")]
    InvalidClient { message: String },

    #[error("identity {identity} is dead and requires manual re-authorization")]
    IdentityDead { identity: String },
}

/// On-disk record missing or unparsable. Surfaced immediately, never
/// silently recovered.
#[derive(Error, Debug)]
pub enum TokenLoadError {
    #[error("no token file at {path}")]
    NotFound { path: String },

    #[error("token file {path} is unreadable: {message}")]
    Io { path: String, message: String },

    #[error("token file {path} failed to parse: {message}")]
    Parse { path: String, message: String },
}

/// Failure writing the durable record. The primary file is left untouched
/// whenever one of these is returned.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("write failed for {path}: {message}")]
    WriteFailed { path: String, message: String },

    #[error("backup failed for {path}: {message}")]
    BackupFailed { path: String, message: String },
}

/// Result type for token manager operations.
pub type TokenResult<T> = Result<T, TokenManagerError>;

/// OAuth2 error response body returned by token endpoints.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct OAuth2ErrorResponse {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

/// Parse an OAuth2 error response from an HTTP body.
pub fn parse_error_response(body: &str) -> Option<OAuth2ErrorResponse> {
    serde_json::from_str(body).ok()
}

/// Classify a non-200 token endpoint response.
///
/// An explicit `invalid_grant`/`invalid_client`/`unauthorized_client` body is
/// terminal regardless of status code. Everything else is transient: rate
/// limiting and 5xx obviously so, and unknown 4xx responses deliberately so,
/// because the failed state is recoverable on a later sweep while the dead
/// state is not.
pub fn classify_refresh_failure(status: u16, body: &str) -> TokenManagerError {
    if let Some(response) = parse_error_response(body) {
        let message = response
            .error_description
            .clone()
            .unwrap_or_else(|| response.error.clone());

        match response.error.as_str() {
            "invalid_grant" => {
                return TokenManagerError::Terminal(TerminalRefreshError::InvalidGrant { message })
            }
            "invalid_client" | "unauthorized_client" => {
                return TokenManagerError::Terminal(TerminalRefreshError::InvalidClient { message })
            }
            _ => {}
        }
    }

    let error = match status {
        429 => TransientRefreshError::RateLimited {
            retry_after: Some(Duration::from_secs(60)),
        },
        _ => TransientRefreshError::ServerError {
            status,
            message: truncate_body(body),
        },
    };

    TokenManagerError::Transient(error)
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 256;
    if body.len() <= MAX {
        body.to_string()
    } else {
        let mut end = MAX;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &body[..end])
    }
}
