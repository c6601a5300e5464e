//! Shared constants for structured API errors and request outcome labels.

use std::fmt;

pub const ERROR_TYPE_API: &str = "api_error";
pub const ERROR_TYPE_TIMEOUT: &str = "timeout_error";
pub const ERROR_TYPE_INVALID_REQUEST: &str = "invalid_request_error";
pub const ERROR_TYPE_AUTHENTICATION: &str = "authentication_error";
pub const ERROR_TYPE_PERMISSION: &str = "permission_error";
pub const ERROR_TYPE_RATE_LIMIT: &str = "rate_limit_error";
pub const ERROR_TYPE_OVERLOADED: &str = "overloaded_error";
pub const ERROR_TYPE_UPSTREAM: &str = "upstream_error";

pub const OUTCOME_SUCCESS: &str = "success";
pub const OUTCOME_UPSTREAM_ERROR: &str = "upstream_error";
pub const OUTCOME_TIMEOUT: &str = "timeout";
pub const OUTCOME_CANCELLED: &str = "cancelled";
pub const OUTCOME_REJECTED: &str = "rejected";

/// Terminal outcome of a routed request, used as a metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Success,
    UpstreamError,
    Timeout,
    Cancelled,
    /// Failed before any upstream call (validation, routing).
    Rejected,
}

impl RequestOutcome {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => OUTCOME_SUCCESS,
            Self::UpstreamError => OUTCOME_UPSTREAM_ERROR,
            Self::Timeout => OUTCOME_TIMEOUT,
            Self::Cancelled => OUTCOME_CANCELLED,
            Self::Rejected => OUTCOME_REJECTED,
        }
    }
}

impl fmt::Display for RequestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
