use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Non-2xx response that survived the retry schedule.
    #[error("API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    /// Request hit its wall-clock deadline. Never retried.
    #[error("Request timed out")]
    Timeout,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Failed to parse response: {0}")]
    Parse(String),

    #[error("Stream error: {0}")]
    Stream(String),
}

impl ProviderError {
    /// 5xx responses and transport failures retry; timeouts surface
    /// immediately, client errors are final.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Api { status, .. } => *status >= 500,
            Self::Network(_) => true,
            Self::Timeout | Self::Parse(_) | Self::Stream(_) => false,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Network(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(
            ProviderError::Api {
                status: 503,
                message: String::new()
            }
            .is_retryable()
        );
        assert!(
            !ProviderError::Api {
                status: 401,
                message: String::new()
            }
            .is_retryable()
        );
        assert!(ProviderError::Network("reset".into()).is_retryable());
        assert!(!ProviderError::Timeout.is_retryable());
    }
}
