//! Maps provider error codes to retry strategies.
//!
//! Codes follow the COUNTER/SUSHI exception numbering.

use crate::model::ErrorCode;

/// How a failed fetch should be retried.
///
/// | Strategy | Throttles endpoint? | Bound |
/// |----------|--------------------|-------|
/// | `ServiceNotAvailable` | Yes, exponential | transient ceiling |
/// | `ServiceBusy` | Yes, exponential | transient ceiling |
/// | `DataNotReady` | No | max retry count |
/// | `NoData` | No | max retry count, grace after period end |
/// | `TooManyRequests` | Yes, fixed | none |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryStrategy {
    ServiceNotAvailable,
    ServiceBusy,
    DataNotReady,
    NoData,
    TooManyRequests,
}

/// Classify a provider error code. `None` means the outcome is final.
pub fn classify(code: Option<&ErrorCode>) -> Option<RetryStrategy> {
    match code?.as_str().trim() {
        "1000" => Some(RetryStrategy::ServiceNotAvailable),
        "1010" => Some(RetryStrategy::ServiceBusy),
        // 1011: report queued for processing, 3031: usage not ready for requested dates
        "1011" | "3031" => Some(RetryStrategy::DataNotReady),
        "1020" => Some(RetryStrategy::TooManyRequests),
        "3030" => Some(RetryStrategy::NoData),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(value: &str) -> Option<RetryStrategy> {
        classify(Some(&ErrorCode::new(value)))
    }

    #[test]
    fn test_known_codes() {
        assert_eq!(code("1000"), Some(RetryStrategy::ServiceNotAvailable));
        assert_eq!(code("1010"), Some(RetryStrategy::ServiceBusy));
        assert_eq!(code("1011"), Some(RetryStrategy::DataNotReady));
        assert_eq!(code("3031"), Some(RetryStrategy::DataNotReady));
        assert_eq!(code("1020"), Some(RetryStrategy::TooManyRequests));
        assert_eq!(code("3030"), Some(RetryStrategy::NoData));
    }

    #[test]
    fn test_final_outcomes() {
        assert_eq!(classify(None), None);
        assert_eq!(code("2000"), None);
        assert_eq!(code(ErrorCode::CLIENT_ERROR), None);
        assert_eq!(code(""), None);
    }
}
