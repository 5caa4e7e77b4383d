//! Research synthesis pipeline.
//!
//! Turns search results for a planned topic into a [`SynthesizedResearch`]
//! report in three stages:
//! 1. **Relevance**: score each result and keep the relevant ones
//! 2. **Synthesis**: write one narrative per subtopic, concurrently
//! 3. **Aggregation**: executive summary, key findings and sources
//!
//! [`ResearchPipeline`] runs the stages behind the result cache.
//!
//! [`SynthesizedResearch`]: crate::types::SynthesizedResearch

pub mod aggregate;
pub mod engine;
pub mod prompts;
pub mod relevance;
pub mod synthesis;

pub use aggregate::{SynthesisAggregator, compile_sources, parse_key_findings};
pub use engine::ResearchPipeline;
pub use relevance::{RelevanceFilter, RelevanceReport, parse_relevance};
pub use synthesis::SubtopicSynthesizer;
