use cloudmon_common::Provider;
use std::time::Duration;

/// Errors raised while talking to a provider API or assembling its snapshot.
///
/// # Examples
///
/// ```rust
/// use cloudmon_cloud::error::CloudError;
///
/// let err = CloudError::Transient {
///     url: "https://example.test/".to_string(),
///     status: Some(503),
///     retry_after: None,
///     message: "service unavailable".to_string(),
/// };
/// assert!(err.is_retryable());
/// assert_eq!(err.status(), Some(503));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum CloudError {
    /// Timeout, connection failure, 429 or a retryable 5xx.
    #[error("transient error from {url} (status={status:?}): {message}")]
    Transient {
        url: String,
        status: Option<u16>,
        retry_after: Option<Duration>,
        message: String,
    },

    /// Non-retryable HTTP status.
    #[error("request to {url} failed: status={status}, body={body}")]
    Permanent {
        url: String,
        status: u16,
        body: String,
    },

    /// A 2xx response whose body is not the JSON the caller asked for.
    #[error("protocol violation from {url}: {message}")]
    Protocol { url: String, message: String },

    /// The retry budget ran out; wraps the last attempt's error.
    #[error("request failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<CloudError>,
    },

    /// Credentials were rejected or the token response was unusable.
    #[error("{provider} authentication failed: {message}")]
    Auth { provider: Provider, message: String },

    /// Every discovery unit of a provider failed.
    #[error("{provider} discovery failed: {message}")]
    Discovery { provider: Provider, message: String },

    /// The provider has no usable credentials.
    #[error("{0} is not configured")]
    NotConfigured(Provider),

    /// Invalid provider configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Failure building an HTTP client or request.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CloudError {
    /// HTTP status of the failure, looking through retry exhaustion.
    pub fn status(&self) -> Option<u16> {
        match self {
            CloudError::Transient { status, .. } => *status,
            CloudError::Permanent { status, .. } => Some(*status),
            CloudError::RetriesExhausted { source, .. } => source.status(),
            _ => None,
        }
    }

    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CloudError::Transient { .. })
    }

    /// Server-requested delay before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            CloudError::Transient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// A 4xx response other than 429.
    pub fn is_client_error(&self) -> bool {
        matches!(self.status(), Some(s) if (400..500).contains(&s) && s != 429)
    }

    /// 403 or 404, which some APIs use to mean "nothing to report here".
    pub fn is_forbidden_or_not_found(&self) -> bool {
        matches!(self.status(), Some(403 | 404))
    }
}

/// Convenience alias for `Result<T, CloudError>`.
pub type Result<T> = std::result::Result<T, CloudError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_report_status_through_retry_exhaustion() {
        let err = CloudError::RetriesExhausted {
            attempts: 4,
            source: Box::new(CloudError::Transient {
                url: "https://x.test/".into(),
                status: Some(502),
                retry_after: None,
                message: "bad gateway".into(),
            }),
        };
        assert_eq!(err.status(), Some(502));
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("after 4 attempts"));
    }

    #[test]
    fn should_classify_client_errors_excluding_throttling() {
        let not_found = CloudError::Permanent {
            url: "u".into(),
            status: 404,
            body: String::new(),
        };
        assert!(not_found.is_client_error());
        assert!(not_found.is_forbidden_or_not_found());

        let throttled = CloudError::Transient {
            url: "u".into(),
            status: Some(429),
            retry_after: None,
            message: String::new(),
        };
        assert!(!throttled.is_client_error());
    }
}
