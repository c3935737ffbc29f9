use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use std::fmt;
use std::time::Duration;

/// Why a request was throttled.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RateLimitReason {
    /// A recent failed authentication from the same source.
    Cooldown,
    /// The per-source sliding window is full.
    Quota,
}

impl fmt::Display for RateLimitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitReason::Cooldown => f.write_str("cooldown"),
            RateLimitReason::Quota => f.write_str("quota"),
        }
    }
}

/// Failure classes of the share pipeline.
///
/// Every variant is terminal for the request that triggered it. The
/// rendered response only carries a generic message: resolved paths and
/// the step at which a path check failed are never disclosed.
#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum ShareError {
    #[error("path escapes the shared directory")]
    PathTraversal,

    #[error("access denied")]
    AccessDenied,

    #[error("not found")]
    NotFound,

    #[error("missing or invalid token")]
    Unauthorized,

    #[error("session expired")]
    SessionExpired,

    /// `retry_after` is the time until the source may be admitted again.
    #[error("rate limited ({reason})")]
    RateLimited {
        reason: RateLimitReason,
        retry_after: Duration,
    },

    #[error("cannot download a directory")]
    IsDirectory,

    #[error("internal error")]
    Internal,

    #[error("fatal: {0}")]
    Fatal(String),
}

impl ShareError {
    pub fn status(&self) -> StatusCode {
        match self {
            ShareError::PathTraversal | ShareError::AccessDenied => StatusCode::FORBIDDEN,
            ShareError::NotFound => StatusCode::NOT_FOUND,
            ShareError::Unauthorized => StatusCode::UNAUTHORIZED,
            ShareError::SessionExpired => StatusCode::GONE,
            ShareError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ShareError::IsDirectory => StatusCode::BAD_REQUEST,
            ShareError::Internal | ShareError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short machine-readable kind used in response bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            ShareError::PathTraversal => "invalid_path",
            ShareError::AccessDenied => "access_denied",
            ShareError::NotFound => "not_found",
            ShareError::Unauthorized => "unauthorized",
            ShareError::SessionExpired => "session_expired",
            ShareError::RateLimited { .. } => "rate_limited",
            ShareError::IsDirectory => "is_directory",
            ShareError::Internal | ShareError::Fatal(_) => "internal",
        }
    }

    fn public_message(&self) -> &'static str {
        match self {
            ShareError::PathTraversal | ShareError::AccessDenied => {
                "The requested path is not accessible"
            }
            ShareError::NotFound => "The requested file or directory does not exist",
            ShareError::Unauthorized => "Invalid or expired token",
            ShareError::SessionExpired => "The sharing session has ended",
            ShareError::RateLimited {
                reason: RateLimitReason::Cooldown,
                ..
            } => "Too many attempts",
            ShareError::RateLimited {
                reason: RateLimitReason::Quota,
                ..
            } => "Rate limit exceeded",
            ShareError::IsDirectory => "Cannot download a directory",
            ShareError::Internal | ShareError::Fatal(_) => "Internal server error",
        }
    }
}

impl IntoResponse for ShareError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = json!({
            "error": self.kind(),
            "message": self.public_message(),
            "code": status.as_u16(),
        });

        let mut res = (status, axum::Json(body)).into_response();
        if let ShareError::RateLimited { retry_after, .. } = self {
            res.headers_mut().insert(
                header::RETRY_AFTER,
                HeaderValue::from(retry_after_secs(retry_after)),
            );
        }
        res
    }
}

/// Whole seconds, rounded up and never zero, so a client that waits the
/// advertised time is past the limit.
fn retry_after_secs(wait: Duration) -> u64 {
    let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
    secs.max(1)
}
