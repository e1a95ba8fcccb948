//! # Error Taxonomy
//!
//! Every fallible surface in the control plane maps onto one of eight
//! kinds. Request handlers translate kinds to HTTP statuses; queue
//! handlers translate them to retry-or-abort decisions. Keeping the
//! taxonomy in one enum means those two translations cannot drift apart.
//!
//! | Kind             | HTTP | Queue behaviour            |
//! |------------------|------|----------------------------|
//! | `Validation`     | 400  | abort after re-check       |
//! | `Authentication` | 401  | retry (should not occur)   |
//! | `Authorization`  | 403  | retry (should not occur)   |
//! | `NotFound`       | 404  | abort after re-check       |
//! | `Conflict`       | 409  | abort (another worker won) |
//! | `RateLimited`    | 429  | retry                      |
//! | `Upstream`       | 502  | retry                      |
//! | `Internal`       | 500  | never retried              |

use thiserror::Error;

/// The control plane's error taxonomy.
///
/// The string payload is operator-facing context, not a machine contract.
/// Machine-readable discrimination happens on the variant and on
/// [`ApiError::code`].
#[derive(Debug, Error)]
pub enum ApiError {
    /// Input failed a schema or semantic constraint.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Bearer token missing, malformed, or failed verification.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Principal authenticated but not permitted to perform the call.
    #[error("not permitted: {0}")]
    Authorization(String),

    /// A referenced entity does not exist. Deliberately the same shape
    /// whether the entity is absent or merely not yours to see.
    #[error("not found: {0}")]
    NotFound(String),

    /// A uniqueness or precondition invariant would be violated.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A per-author quota was exceeded.
    #[error("rate limit exceeded: {0}")]
    RateLimited(String),

    /// A downstream service or federation host returned failure.
    #[error("upstream failure: {0}")]
    Upstream(String),

    /// An invariant this system owns was observed broken. Logged with
    /// structured context, never retried automatically.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// The HTTP status this kind maps to at the request boundary.
    pub fn status(&self) -> u16 {
        match self {
            ApiError::Validation(_) => 400,
            ApiError::Authentication(_) => 401,
            ApiError::Authorization(_) => 403,
            ApiError::NotFound(_) => 404,
            ApiError::Conflict(_) => 409,
            ApiError::RateLimited(_) => 429,
            ApiError::Internal(_) => 500,
            ApiError::Upstream(_) => 502,
        }
    }

    /// The kind name used in the `error` field of the JSON error body.
    pub fn kind_name(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "ValidationError",
            ApiError::Authentication(_) => "AuthenticationError",
            ApiError::Authorization(_) => "AuthorizationError",
            ApiError::NotFound(_) => "NotFoundError",
            ApiError::Conflict(_) => "ConflictError",
            ApiError::RateLimited(_) => "RateLimitError",
            ApiError::Upstream(_) => "UpstreamError",
            ApiError::Internal(_) => "InternalError",
        }
    }

    /// Symbolic error code for the JSON error body.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "InvalidRequest",
            ApiError::Authentication(_) => "AuthenticationRequired",
            ApiError::Authorization(_) => "Forbidden",
            ApiError::NotFound(_) => "NotFound",
            ApiError::Conflict(_) => "Conflict",
            ApiError::RateLimited(_) => "RateLimitExceeded",
            ApiError::Upstream(_) => "UpstreamFailure",
            ApiError::Internal(_) => "InternalServerError",
        }
    }

    /// Whether a queue handler hitting this error should let the job
    /// retry. `Validation` and `NotFound` after an authoritative re-check
    /// mean the world changed under the job — retrying cannot help.
    /// `Internal` means an invariant broke — retrying must not help.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ApiError::Validation(_)
                | ApiError::NotFound(_)
                | ApiError::Conflict(_)
                | ApiError::Internal(_)
        )
    }
}

/// Convenience alias used across the crate.
pub type ApiResult<T> = Result<T, ApiError>;

impl From<sled::Error> for ApiError {
    fn from(e: sled::Error) -> Self {
        ApiError::Internal(format!("storage error: {e}"))
    }
}

impl From<bincode::Error> for ApiError {
    fn from(e: bincode::Error) -> Self {
        ApiError::Internal(format!("codec error: {e}"))
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        // Outbound failures are upstream by definition; the queue decides
        // whether to try again.
        ApiError::Upstream(format!("http error: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_is_total() {
        let all = [
            ApiError::Validation("x".into()),
            ApiError::Authentication("x".into()),
            ApiError::Authorization("x".into()),
            ApiError::NotFound("x".into()),
            ApiError::Conflict("x".into()),
            ApiError::RateLimited("x".into()),
            ApiError::Upstream("x".into()),
            ApiError::Internal("x".into()),
        ];
        for e in &all {
            assert!((400..=599).contains(&e.status()), "{e} -> {}", e.status());
            assert!(!e.code().is_empty());
        }
    }

    #[test]
    fn retryability_matches_policy() {
        assert!(ApiError::Upstream("net".into()).is_retryable());
        assert!(ApiError::RateLimited("q".into()).is_retryable());
        assert!(!ApiError::Validation("bad".into()).is_retryable());
        assert!(!ApiError::NotFound("gone".into()).is_retryable());
        assert!(!ApiError::Internal("broken".into()).is_retryable());
    }

    #[test]
    fn not_found_shape_is_uniform() {
        // The body for "exists but not yours" and "does not exist" must be
        // indistinguishable.
        let a = ApiError::NotFound("key not found".into());
        let b = ApiError::NotFound("key not found".into());
        assert_eq!(a.status(), b.status());
        assert_eq!(a.code(), b.code());
    }
}
