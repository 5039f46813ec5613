//! Status codes and error type shared across the runtime

use core::fmt;

/// Result type for fallible runtime operations
pub type CoreResult<T> = Result<T, Status>;

/// The error kinds the core surfaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    /// Bad channel args, unknown stack type, malformed input
    InvalidArgument,

    /// Unresolvable filter graph, missing required components
    FailedPrecondition,

    /// Arena or allocation failure
    ResourceExhausted,

    /// User-initiated or deadline-driven call termination
    Cancelled,

    /// Peer gone, stream not started
    Unavailable,

    /// Security layer rejection
    Unauthenticated,

    /// Unexpected invariant break
    Internal,
}

impl StatusCode {
    /// Stable lowercase name, used in log lines and metadata
    pub fn as_str(self) -> &'static str {
        match self {
            StatusCode::InvalidArgument => "invalid_argument",
            StatusCode::FailedPrecondition => "failed_precondition",
            StatusCode::ResourceExhausted => "resource_exhausted",
            StatusCode::Cancelled => "cancelled",
            StatusCode::Unavailable => "unavailable",
            StatusCode::Unauthenticated => "unauthenticated",
            StatusCode::Internal => "internal",
        }
    }

    /// Inverse of [`as_str`](StatusCode::as_str)
    pub fn from_str_name(name: &str) -> Option<StatusCode> {
        Some(match name {
            "invalid_argument" => StatusCode::InvalidArgument,
            "failed_precondition" => StatusCode::FailedPrecondition,
            "resource_exhausted" => StatusCode::ResourceExhausted,
            "cancelled" => StatusCode::Cancelled,
            "unavailable" => StatusCode::Unavailable,
            "unauthenticated" => StatusCode::Unauthenticated,
            "internal" => StatusCode::Internal,
            _ => return None,
        })
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error with a status code and a human-readable message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    code: StatusCode,
    message: String,
}

impl Status {
    /// Create a status from a code and message
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Status {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Status::new(StatusCode::InvalidArgument, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Status::new(StatusCode::FailedPrecondition, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Status::new(StatusCode::ResourceExhausted, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Status::new(StatusCode::Cancelled, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Status::new(StatusCode::Unavailable, message)
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Status::new(StatusCode::Unauthenticated, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Status::new(StatusCode::Internal, message)
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for Status {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        let s = Status::cancelled("call was cancelled");
        assert_eq!(format!("{}", s), "cancelled: call was cancelled");
        assert_eq!(s.code(), StatusCode::Cancelled);
        assert_eq!(s.message(), "call was cancelled");
    }

    #[test]
    fn test_code_name_round_trip() {
        let codes = [
            StatusCode::InvalidArgument,
            StatusCode::FailedPrecondition,
            StatusCode::ResourceExhausted,
            StatusCode::Cancelled,
            StatusCode::Unavailable,
            StatusCode::Unauthenticated,
            StatusCode::Internal,
        ];
        for code in codes {
            assert_eq!(StatusCode::from_str_name(code.as_str()), Some(code));
        }
        assert_eq!(StatusCode::from_str_name("bogus"), None);
    }
}
