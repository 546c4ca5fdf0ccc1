//! Error taxonomy (spec.md §7) and the two exceptions allowed to escape `execute`.

use std::fmt;
use thiserror::Error;

/// Machine-readable error tag carried on every standardized result (spec.md §3, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequestError,
    AuthenticationError,
    PermissionError,
    NotFoundError,
    RateLimitError,
    ApiError,
    NetworkError,
    Timeout,
    NodeStopped,
    ExecutionError,
    NotFound,
    InternalError,
}

impl ErrorType {
    /// Maps an HTTP status code to an error type (spec.md §7, original_source
    /// `_get_error_type`). Total over the status code space: anything outside
    /// the explicit mappings and the 5xx range is `internal_error` (the
    /// original's `unknown_error` has no equivalent in spec.md's taxonomy).
    pub fn from_status(status: u16) -> Self {
        match status {
            400 => ErrorType::InvalidRequestError,
            401 => ErrorType::AuthenticationError,
            403 => ErrorType::PermissionError,
            404 => ErrorType::NotFoundError,
            429 => ErrorType::RateLimitError,
            s if (500..600).contains(&s) => ErrorType::ApiError,
            _ => ErrorType::InternalError,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::InvalidRequestError => "invalid_request_error",
            ErrorType::AuthenticationError => "authentication_error",
            ErrorType::PermissionError => "permission_error",
            ErrorType::NotFoundError => "not_found_error",
            ErrorType::RateLimitError => "rate_limit_error",
            ErrorType::ApiError => "api_error",
            ErrorType::NetworkError => "network_error",
            ErrorType::Timeout => "timeout",
            ErrorType::NodeStopped => "node_stopped",
            ErrorType::ExecutionError => "execution_error",
            ErrorType::NotFound => "not_found",
            ErrorType::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when a node/graph/workflow observes a cancelled `ExecutionContext`.
///
/// Per spec.md §7 this is one of only two exception types allowed to escape
/// `execute`; everything else is caught and classified into a result.
#[derive(Debug, Error, Clone)]
#[error("execution cancelled")]
pub struct CancelledError;

/// Raised when a step/budget cap would be exceeded (spec.md §4.3).
#[derive(Debug, Error, Clone)]
#[error("budget exceeded: {0}")]
pub struct BudgetExceededError(pub String);

/// Internal control-flow error used by the kernel (session lookups, graph
/// validation, workflow registration). Never returned to a caller of
/// `Node::execute` directly — callers at that boundary get a standardized
/// result instead (see `nerve::result`).
#[derive(Debug, Error)]
pub enum NerveError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Validation(#[from] crate::validation::ValidationError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("id conflict: '{0}' already registered")]
    IdConflict(String),
    #[error(transparent)]
    Cancelled(#[from] CancelledError),
    #[error(transparent)]
    BudgetExceeded(#[from] BudgetExceededError),
    #[error("graph validation failed: {0:?}")]
    GraphInvalid(Vec<String>),
    /// A graph step exhausted its retries under an `on_error: fail` policy
    /// (spec.md §4.4 "Error policy execution"): aborts the whole graph, with
    /// the failing step's error/error_type lifted onto the graph result.
    #[error("step failed: {message}")]
    StepFailed { message: String, error_type: ErrorType },
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<crate::node::ExecError> for NerveError {
    fn from(e: crate::node::ExecError) -> Self {
        match e {
            crate::node::ExecError::Cancelled(c) => NerveError::Cancelled(c),
            crate::node::ExecError::BudgetExceeded(b) => NerveError::BudgetExceeded(b),
        }
    }
}

impl NerveError {
    /// Maps this error onto the spec's taxonomy for inclusion in a standardized result.
    pub fn error_type(&self) -> ErrorType {
        match self {
            NerveError::InvalidRequest(_) => ErrorType::InvalidRequestError,
            NerveError::Validation(_) => ErrorType::InvalidRequestError,
            NerveError::NotFound(_) => ErrorType::NotFound,
            NerveError::IdConflict(_) => ErrorType::InvalidRequestError,
            NerveError::Cancelled(_) => ErrorType::InternalError,
            NerveError::BudgetExceeded(_) => ErrorType::InternalError,
            NerveError::GraphInvalid(_) => ErrorType::ExecutionError,
            NerveError::StepFailed { error_type, .. } => *error_type,
            NerveError::Internal(_) => ErrorType::InternalError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_is_total() {
        assert_eq!(ErrorType::from_status(400), ErrorType::InvalidRequestError);
        assert_eq!(ErrorType::from_status(401), ErrorType::AuthenticationError);
        assert_eq!(ErrorType::from_status(403), ErrorType::PermissionError);
        assert_eq!(ErrorType::from_status(404), ErrorType::NotFoundError);
        assert_eq!(ErrorType::from_status(429), ErrorType::RateLimitError);
        assert_eq!(ErrorType::from_status(500), ErrorType::ApiError);
        assert_eq!(ErrorType::from_status(503), ErrorType::ApiError);
        assert_eq!(ErrorType::from_status(599), ErrorType::ApiError);
        assert_eq!(ErrorType::from_status(418), ErrorType::InternalError);
        assert_eq!(ErrorType::from_status(200), ErrorType::InternalError);
    }
}
