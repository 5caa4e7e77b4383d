//! Error types for the Distill research core.
//!
//! Uses `thiserror` for public API error types with structured variants
//! covering LLM calls, input validation, the result cache, the research
//! pipeline itself, and configuration.

/// Top-level error type for the Distill core library.
#[derive(Debug, thiserror::Error)]
pub enum DistillError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Input error: {0}")]
    Input(#[from] InputError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Research error: {0}")]
    Research(#[from] ResearchError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Logging setup failed: {message}")]
    Logging { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from LLM provider interactions.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LlmError {
    #[error("API request failed: {message}")]
    ApiRequest { message: String },

    #[error("API response parse error: {message}")]
    ResponseParse { message: String },

    #[error("Model not supported: {model}")]
    UnsupportedModel { model: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Provider connection failed: {message}")]
    Connection { message: String },
}

/// Coarse classification of an [`LlmError`], used to decide retryability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LlmErrorKind {
    ApiRequest,
    ResponseParse,
    UnsupportedModel,
    AuthFailed,
    RateLimited,
    Timeout,
    Connection,
}

impl LlmError {
    pub fn kind(&self) -> LlmErrorKind {
        match self {
            LlmError::ApiRequest { .. } => LlmErrorKind::ApiRequest,
            LlmError::ResponseParse { .. } => LlmErrorKind::ResponseParse,
            LlmError::UnsupportedModel { .. } => LlmErrorKind::UnsupportedModel,
            LlmError::AuthFailed { .. } => LlmErrorKind::AuthFailed,
            LlmError::RateLimited { .. } => LlmErrorKind::RateLimited,
            LlmError::Timeout { .. } => LlmErrorKind::Timeout,
            LlmError::Connection { .. } => LlmErrorKind::Connection,
        }
    }

    /// Whether the error is a transient external failure (timeout, rate
    /// limit, connection reset).
    pub fn is_transient(&self) -> bool {
        LlmErrorKind::TRANSIENT.contains(&self.kind())
    }
}

impl LlmErrorKind {
    /// Kinds retried by the default LLM retry policy.
    pub const TRANSIENT: [LlmErrorKind; 3] = [
        LlmErrorKind::RateLimited,
        LlmErrorKind::Timeout,
        LlmErrorKind::Connection,
    ];
}

/// Errors in the caller-supplied research plan. Never retried.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InputError {
    #[error("Research topic is empty")]
    EmptyTopic,

    #[error("Research plan has no subtopics")]
    NoSubtopics,

    #[error("Subtopic at index {index} is blank")]
    BlankSubtopic { index: usize },
}

/// Errors from the research result cache.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache store failure: {message}")]
    Store { message: String },

    #[error("Corrupt cache entry {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Errors from the research pipeline that make the whole request fail.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResearchError {
    #[error("All {count} subtopics failed to synthesize")]
    AllSubtopicsFailed { count: usize },

    #[error("Research request was cancelled")]
    Cancelled,
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// A type alias for results using the top-level `DistillError`.
pub type Result<T> = std::result::Result<T, DistillError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_llm() {
        let err = DistillError::Llm(LlmError::ApiRequest {
            message: "connection refused".into(),
        });
        assert_eq!(
            err.to_string(),
            "LLM error: API request failed: connection refused"
        );
    }

    #[test]
    fn test_error_display_input() {
        let err = DistillError::Input(InputError::BlankSubtopic { index: 2 });
        assert_eq!(err.to_string(), "Input error: Subtopic at index 2 is blank");
    }

    #[test]
    fn test_error_display_research() {
        let err = DistillError::Research(ResearchError::AllSubtopicsFailed { count: 3 });
        assert_eq!(
            err.to_string(),
            "Research error: All 3 subtopics failed to synthesize"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: DistillError = io_err.into();
        assert!(matches!(err, DistillError::Io(_)));
    }

    #[test]
    fn test_error_from_serde() {
        let serde_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let err: DistillError = serde_err.into();
        assert!(matches!(err, DistillError::Serialization(_)));
    }

    #[test]
    fn test_transient_kinds() {
        assert!(LlmError::RateLimited { retry_after_secs: 5 }.is_transient());
        assert!(LlmError::Timeout { timeout_ms: 30_000 }.is_transient());
        assert!(
            LlmError::Connection {
                message: "reset".into()
            }
            .is_transient()
        );
        assert!(
            !LlmError::AuthFailed {
                provider: "openai".into()
            }
            .is_transient()
        );
        assert!(
            !LlmError::ResponseParse {
                message: "bad".into()
            }
            .is_transient()
        );
    }

    #[test]
    fn test_llm_error_variants() {
        let err = LlmError::RateLimited {
            retry_after_secs: 60,
        };
        assert_eq!(err.to_string(), "Rate limited by provider, retry after 60s");
        assert_eq!(err.kind(), LlmErrorKind::RateLimited);
    }
}
