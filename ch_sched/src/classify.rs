//! ABOUTME: Error classification and retryability rules for handler failures
//! ABOUTME: Typed errors classify structurally; message inspection covers foreign errors

use ch_core::Error;

/// Classified failure code recorded on execution logs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Timeout,
    NetworkError,
    RateLimit,
    MemoryError,
    PermissionError,
    ValidationError,
    NotFound,
    HandlerError,
    UnknownError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "TIMEOUT",
            Self::NetworkError => "NETWORK_ERROR",
            Self::RateLimit => "RATE_LIMIT",
            Self::MemoryError => "MEMORY_ERROR",
            Self::PermissionError => "PERMISSION_ERROR",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::HandlerError => "HANDLER_ERROR",
            Self::UnknownError => "UNKNOWN_ERROR",
        }
    }
}

/// Classify a failure, preferring the typed variant over message sniffing
pub fn classify(err: &Error) -> ErrorCode {
    match err {
        Error::Timeout(_) => ErrorCode::Timeout,
        Error::Handler(_) => ErrorCode::HandlerError,
        Error::Validation(_) => ErrorCode::ValidationError,
        Error::NotFound(_) => ErrorCode::NotFound,
        other => classify_message(&other.to_string()),
    }
}

/// Ordered case-insensitive substring classification for foreign errors
pub fn classify_message(message: &str) -> ErrorCode {
    let lower = message.to_lowercase();

    if lower.contains("timeout") {
        ErrorCode::Timeout
    } else if lower.contains("network") || lower.contains("econnrefused") {
        ErrorCode::NetworkError
    } else if lower.contains("rate limit") {
        ErrorCode::RateLimit
    } else if lower.contains("memory") {
        ErrorCode::MemoryError
    } else if lower.contains("permission") || lower.contains("forbidden") {
        ErrorCode::PermissionError
    } else if lower.contains("validation") {
        ErrorCode::ValidationError
    } else if lower.contains("not found") {
        ErrorCode::NotFound
    } else if lower.contains("handler") {
        ErrorCode::HandlerError
    } else {
        ErrorCode::UnknownError
    }
}

const NON_RETRYABLE_MARKERS: [&str; 7] = [
    "validation",
    "invalid",
    "not found",
    "unauthorized",
    "forbidden",
    "no handler",
    "syntax error",
];

/// True when the failure should never be retried, regardless of budget
pub fn is_non_retryable(message: &str) -> bool {
    let lower = message.to_lowercase();
    NON_RETRYABLE_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
}
