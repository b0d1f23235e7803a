use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

/// Error kinds carried across layers. Every failure that reaches a
/// caller maps to exactly one of these; the HTTP mapping lives at the
/// server boundary. `detail` strings are safe for end users and never
/// contain credentials, stack traces, or internal paths.
#[derive(Debug, Error)]
pub enum AppError {
    /// Entity missing or not owned by the caller. Deliberately does not
    /// leak whether the entity exists.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Payload violates a stated constraint.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Uniqueness or state precondition failed.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Caller lacks a credential for a required capability.
    #[error("provider unconfigured: {0}")]
    ProviderUnconfigured(String),

    /// Remote returned 5xx or timed out; retriable at the caller's
    /// discretion.
    #[error("provider unavailable: {0}")]
    ProviderTransient(String),

    /// Remote returned a non-auth 4xx.
    #[error("provider rejected request: {0}")]
    ProviderFatal(String),

    /// Queue full, pool saturated, rate-limited.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable kind name used in the JSON error body.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "not_found",
            AppError::Unauthenticated(_) => "unauthenticated",
            AppError::Unauthorized(_) => "unauthorized",
            AppError::BadRequest(_) => "bad_request",
            AppError::Conflict(_) => "conflict",
            AppError::ProviderUnconfigured(_) => "provider_unconfigured",
            AppError::ProviderTransient(_) => "provider_transient",
            AppError::ProviderFatal(_) => "provider_fatal",
            AppError::ResourceExhausted(_) => "resource_exhausted",
            AppError::Internal(_) => "internal",
        }
    }

    pub fn detail(&self) -> &str {
        match self {
            AppError::NotFound(d)
            | AppError::Unauthenticated(d)
            | AppError::Unauthorized(d)
            | AppError::BadRequest(d)
            | AppError::Conflict(d)
            | AppError::ProviderUnconfigured(d)
            | AppError::ProviderTransient(d)
            | AppError::ProviderFatal(d)
            | AppError::ResourceExhausted(d)
            | AppError::Internal(d) => d,
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        AppError::NotFound(what.into())
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        AppError::BadRequest(detail.into())
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        AppError::Internal(detail.into())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        // A typed error wrapped in anyhow keeps its kind.
        match err.downcast::<AppError>() {
            Ok(app) => app,
            Err(other) => AppError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(AppError::not_found("kb").kind(), "not_found");
        assert_eq!(
            AppError::ProviderUnconfigured("no key".into()).kind(),
            "provider_unconfigured"
        );
    }

    #[test]
    fn anyhow_roundtrip_preserves_kind() {
        let err: anyhow::Error = AppError::Conflict("duplicate".into()).into();
        let back: AppError = err.into();
        assert_eq!(back.kind(), "conflict");
        assert_eq!(back.detail(), "duplicate");
    }

    #[test]
    fn anyhow_opaque_becomes_internal() {
        let err = anyhow::anyhow!("disk on fire");
        let app: AppError = err.into();
        assert_eq!(app.kind(), "internal");
    }
}
