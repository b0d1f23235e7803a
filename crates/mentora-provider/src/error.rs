use mentora_schema::AppError;
use thiserror::Error;

/// Provider-facing error classification. Transient failures (5xx,
/// timeouts, connection errors, 429) are retried inside the gateway;
/// everything else propagates immediately.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// No credential available for the required capability.
    #[error("provider unconfigured: {0}")]
    Unconfigured(String),

    /// Remote 5xx, timeout, connection failure, or rate limit.
    #[error("provider transient failure: {0}")]
    Transient(String),

    /// Remote 4xx other than 401/403/429.
    #[error("provider rejected request (HTTP {status}): {detail}")]
    Fatal { status: u16, detail: String },
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }

    /// Classify an HTTP error status. 401/403 read as a credential
    /// problem, not a remote fault.
    pub fn from_status(status: u16, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        match status {
            401 | 403 => ProviderError::Unconfigured(format!("credential rejected: {detail}")),
            429 => ProviderError::Transient(format!("rate limited: {detail}")),
            500..=599 => ProviderError::Transient(format!("HTTP {status}: {detail}")),
            _ => ProviderError::Fatal { status, detail },
        }
    }

    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Transient("request timed out".into())
        } else if err.is_connect() {
            ProviderError::Transient(format!("connection failed: {err}"))
        } else if let Some(status) = err.status() {
            ProviderError::from_status(status.as_u16(), err.to_string())
        } else {
            ProviderError::Transient(err.to_string())
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        ProviderError::from_reqwest(err)
    }
}

impl From<ProviderError> for AppError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Unconfigured(d) => AppError::ProviderUnconfigured(d),
            ProviderError::Transient(d) => AppError::ProviderTransient(d),
            ProviderError::Fatal { status, detail } => {
                AppError::ProviderFatal(format!("HTTP {status}: {detail}"))
            }
        }
    }
}
