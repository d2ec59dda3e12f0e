// =============================================================================
// Bitunix API errors — typed so the guard can tell fatal from retryable
// =============================================================================

use reqwest::StatusCode;
use thiserror::Error;

/// Business codes that mean our credentials are unusable.
///   10003 — api-key missing or invalid
///   10004 — caller IP not on the key's whitelist
///   10007 — signature mismatch
const AUTH_CODES: &[i64] = &[10003, 10004, 10007];

/// Business codes worth retrying.
///   10001 — exchange-side network error
///   10005 — too many requests
///   10006 — request too frequent
const TRANSIENT_CODES: &[i64] = &[10001, 10005, 10006];

/// How the caller should react to an [`ApiError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Credentials rejected. Retrying will not help.
    Auth,
    /// Network trouble, rate limiting, or a 5xx. Retry with backoff.
    Transient,
    /// The exchange understood and refused the request.
    Rejected,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request to {path} failed: {source}")]
    Transport {
        path: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{path} returned HTTP {status}: {body}")]
    Status {
        path: String,
        status: StatusCode,
        body: String,
    },

    #[error("{path} returned code {code}: {msg}")]
    Business { path: String, code: i64, msg: String },

    /// A credential could not be encoded as an HTTP header value; no request
    /// was sent.
    #[error("{name} header contains characters not allowed in HTTP headers")]
    InvalidHeader { name: String },

    #[error("could not decode {path} response: {reason}")]
    Decode { path: String, reason: String },
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport { .. } | Self::Decode { .. } => ErrorKind::Transient,
            Self::InvalidHeader { .. } => ErrorKind::Auth,
            Self::Status { status, .. } => {
                if *status == StatusCode::UNAUTHORIZED || *status == StatusCode::FORBIDDEN {
                    ErrorKind::Auth
                } else if *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Rejected
                }
            }
            Self::Business { code, .. } => {
                if AUTH_CODES.contains(code) {
                    ErrorKind::Auth
                } else if TRANSIENT_CODES.contains(code) {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Rejected
                }
            }
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    pub fn decode(path: &str, reason: impl std::fmt::Display) -> Self {
        Self::Decode {
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }
}
