//! # Distill Core
//!
//! Research synthesis for Distill: turns web-search results for a planned
//! topic into a structured report with an executive summary, per-subtopic
//! narratives, key findings and a deduplicated source list.
//!
//! LLM access goes through the [`LlmProvider`] trait behind a [`Brain`] that
//! bounds concurrency, applies per-call timeouts and retries transient
//! failures. Finished reports are cached per topic by [`ResearchCache`].

pub mod brain;
pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod persistence;
pub mod rate_limiter;
pub mod research;
pub mod retry;
pub mod types;

// Re-export commonly used types at the crate root.
pub use brain::{
    Brain, CompletionRequest, CompletionResponse, LlmProvider, MockLlmProvider, TokenUsage,
    UsageSummary,
};
pub use cache::{CacheStore, Clock, FileStore, ManualClock, MemoryStore, ResearchCache, SystemClock};
pub use config::{DistillConfig, load_config};
pub use error::{
    CacheError, ConfigError, DistillError, InputError, LlmError, LlmErrorKind, ResearchError,
    Result,
};
pub use logging::{LoggingOptions, init_tracing};
pub use research::{
    RelevanceFilter, RelevanceReport, ResearchPipeline, SubtopicSynthesizer, SynthesisAggregator,
};
pub use retry::{RetryError, RetryPolicy, Retryable};
pub use types::{
    RelevanceScore, RelevantContentItem, ResearchPlan, SearchResult, SourceRef, SubtopicStatus,
    SubtopicSynthesis, SynthesizedResearch,
};
