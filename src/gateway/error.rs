//! Error types for the provider gateway.

use std::time::Duration;
use thiserror::Error;

/// Additional context from provider errors for debugging.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    /// HTTP status code from the provider.
    pub http_status: Option<u16>,
    /// Provider-specific error code (e.g. "rate_limit_exceeded").
    pub provider_code: Option<String>,
    /// Request ID from provider (x-request-id header).
    pub request_id: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.provider_code = Some(code.into());
        self
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }
}

/// Errors that can occur when calling providers.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Provider returned 429.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited {
        retry_after: Duration,
        context: Option<ErrorContext>,
    },

    /// Invalid request (bad model id, oversized input). Permanent.
    #[error("invalid request: {message}")]
    InvalidRequest {
        message: String,
        context: Option<ErrorContext>,
    },

    /// Credentials rejected (401/403). Permanent.
    #[error("{provider} rejected credentials: {message}")]
    Unauthorized {
        provider: &'static str,
        message: String,
        context: Option<ErrorContext>,
    },

    /// Provider refused the request (content policy, etc.).
    #[error("refused: {message}")]
    Refused {
        message: String,
        context: Option<ErrorContext>,
    },

    /// Provider error - may be retryable.
    #[error("{provider} error: {message}")]
    Provider {
        provider: &'static str,
        message: String,
        retryable: bool,
        context: Option<ErrorContext>,
    },

    /// Request timed out - retryable.
    #[error("timeout after {0:?}")]
    Timeout(Duration, Option<ErrorContext>),

    /// HTTP/network error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration error (missing API key, etc.).
    #[error("configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    /// Create a rate limited error from a provider 429.
    pub fn rate_limited(retry_after: Duration, context: ErrorContext) -> Self {
        Self::RateLimited {
            retry_after,
            context: Some(context),
        }
    }

    /// Create an invalid request error.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
            context: None,
        }
    }

    pub fn unauthorized(
        provider: &'static str,
        message: impl Into<String>,
        context: ErrorContext,
    ) -> Self {
        Self::Unauthorized {
            provider,
            message: message.into(),
            context: Some(context),
        }
    }

    /// Create a refused error.
    pub fn refused(message: impl Into<String>) -> Self {
        Self::Refused {
            message: message.into(),
            context: None,
        }
    }

    /// Create a provider error.
    pub fn provider(provider: &'static str, message: impl Into<String>, retryable: bool) -> Self {
        Self::Provider {
            provider,
            message: message.into(),
            retryable,
            context: None,
        }
    }

    /// Create a provider error with context.
    pub fn provider_with_context(
        provider: &'static str,
        message: impl Into<String>,
        retryable: bool,
        context: ErrorContext,
    ) -> Self {
        Self::Provider {
            provider,
            message: message.into(),
            retryable,
            context: Some(context),
        }
    }

    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::Timeout(_, _) => true,
            Self::Provider { retryable, .. } => *retryable,
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::InvalidRequest { .. } => false,
            Self::Unauthorized { .. } => false,
            Self::Refused { .. } => false,
            Self::Config(_) => false,
        }
    }

    /// Whether the whole run must stop: no amount of retrying or scoring
    /// around this error will make the next call succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::Unauthorized { .. } | Self::InvalidRequest { .. }
        )
    }

    /// Get a short error code for logging.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::Unauthorized { .. } => "unauthorized",
            Self::Refused { .. } => "refused",
            Self::Provider { .. } => "provider_error",
            Self::Timeout(_, _) => "timeout",
            Self::Http(_) => "http_error",
            Self::Config(_) => "config_error",
        }
    }

    /// Get the error context if available.
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::RateLimited { context, .. } => context.as_ref(),
            Self::InvalidRequest { context, .. } => context.as_ref(),
            Self::Unauthorized { context, .. } => context.as_ref(),
            Self::Refused { context, .. } => context.as_ref(),
            Self::Provider { context, .. } => context.as_ref(),
            Self::Timeout(_, context) => context.as_ref(),
            Self::Http(_) => None,
            Self::Config(_) => None,
        }
    }

    /// Get the request ID if available.
    pub fn request_id(&self) -> Option<&str> {
        self.context().and_then(|c| c.request_id.as_deref())
    }
}

/// Map a non-success HTTP status to the error taxonomy shared by all adapters.
pub(crate) fn classify_status(
    provider: &'static str,
    status: u16,
    message: String,
    ctx: ErrorContext,
) -> ProviderError {
    match status {
        429 => ProviderError::rate_limited(Duration::from_secs(60), ctx),
        401 | 403 => ProviderError::unauthorized(provider, message, ctx),
        400 | 404 | 422 => ProviderError::InvalidRequest {
            message,
            context: Some(ctx),
        },
        s => ProviderError::provider_with_context(provider, message, s >= 500, ctx),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_and_config_errors_are_fatal() {
        let ctx = ErrorContext::new().with_status(401);
        assert!(classify_status("openrouter", 401, "bad key".into(), ctx).is_fatal());
        assert!(ProviderError::config("OPENROUTER_API_KEY not set").is_fatal());
        assert!(classify_status("cohere", 404, "no model".into(), ErrorContext::new()).is_fatal());
    }

    #[test]
    fn transient_errors_are_not_fatal() {
        let rate = classify_status("openrouter", 429, String::new(), ErrorContext::new());
        assert!(rate.is_retryable());
        assert!(!rate.is_fatal());

        let server = classify_status("openrouter", 503, "overloaded".into(), ErrorContext::new());
        assert!(server.is_retryable());
        assert!(!server.is_fatal());

        assert!(!ProviderError::Timeout(Duration::from_secs(1), None).is_fatal());
        assert!(!ProviderError::refused("no").is_fatal());
    }

    #[test]
    fn invalid_request_keeps_status_context() {
        let ctx = ErrorContext::new().with_status(422).with_request_id("req-9");
        let err = classify_status("openrouter", 422, "bad temperature".into(), ctx);
        assert!(matches!(err, ProviderError::InvalidRequest { .. }));
        assert_eq!(err.request_id(), Some("req-9"));
        assert_eq!(err.context().and_then(|c| c.http_status), Some(422));
    }
}
