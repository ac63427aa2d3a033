use crate::types::{PrincipalId, RoleId};
use thiserror::Error;

/// Loader-layer error type.
pub type LoaderError = Box<dyn std::error::Error + Send + Sync>;

/// Crate result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by this crate.
///
/// A permission that is simply absent from a principal's effective set is not
/// an error; it is reported as a denied [`EvaluationResult`](crate::EvaluationResult).
#[derive(Debug, Error)]
pub enum Error {
    /// The injected loader failed; nothing was installed.
    #[error("failed to load permissions for {user}: {source}")]
    LoadFailed {
        user: PrincipalId,
        #[source]
        source: LoaderError,
    },
    /// Internal fault while evaluating a permission (strict mode only).
    #[error("evaluation of {permission} for {user} failed: {message}")]
    EvaluationFailed {
        user: PrincipalId,
        permission: String,
        message: String,
    },
    /// Invalid identifier input.
    #[error("invalid id: {0}")]
    InvalidId(String),
    /// Invalid invalidation pattern.
    #[error("invalid pattern: {0}")]
    InvalidPattern(String),
    /// Parent-role cycle detected while resolving a principal's roles.
    #[error("role cycle detected for {user} at role {role}")]
    RoleCycleDetected { user: PrincipalId, role: RoleId },
    /// Parent-role chain exceeded the configured depth.
    #[error("role inheritance depth exceeded for {user} at role {role}; max depth {max_depth}")]
    RoleDepthExceeded {
        user: PrincipalId,
        role: RoleId,
        max_depth: usize,
    },
}

impl From<regex::Error> for Error {
    fn from(error: regex::Error) -> Self {
        Self::InvalidPattern(error.to_string())
    }
}
