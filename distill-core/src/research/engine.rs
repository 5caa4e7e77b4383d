//! Research pipeline: relevance filtering, per-subtopic synthesis and
//! aggregation, wrapped by the result cache.

use super::aggregate::SynthesisAggregator;
use super::relevance::RelevanceFilter;
use super::synthesis::SubtopicSynthesizer;
use crate::brain::{Brain, LlmProvider};
use crate::cache::ResearchCache;
use crate::config::DistillConfig;
use crate::error::{ResearchError, Result};
use crate::types::{ResearchPlan, SearchResult, SynthesizedResearch};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Turns a research plan and search results into a synthesized report.
pub struct ResearchPipeline {
    brain: Arc<Brain>,
    relevance: RelevanceFilter,
    synthesizer: SubtopicSynthesizer,
    aggregator: SynthesisAggregator,
    cache: Option<ResearchCache>,
}

impl ResearchPipeline {
    /// Build a pipeline over `provider`, opening the file cache when enabled.
    pub fn new(provider: Arc<dyn LlmProvider>, config: &DistillConfig) -> Result<Self> {
        let cache = if config.cache.enabled {
            Some(ResearchCache::from_config(&config.cache)?)
        } else {
            None
        };
        Ok(Self::with_brain(Arc::new(Brain::new(provider, config)), config).with_cache(cache))
    }

    /// Build an uncached pipeline around an existing [`Brain`].
    pub fn with_brain(brain: Arc<Brain>, config: &DistillConfig) -> Self {
        Self {
            relevance: RelevanceFilter::new(Arc::clone(&brain), config),
            synthesizer: SubtopicSynthesizer::new(Arc::clone(&brain), config),
            aggregator: SynthesisAggregator::new(Arc::clone(&brain), config),
            brain,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: Option<ResearchCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn brain(&self) -> &Brain {
        &self.brain
    }

    pub fn cache(&self) -> Option<&ResearchCache> {
        self.cache.as_ref()
    }

    /// Run the full pipeline for `plan`.
    ///
    /// A fresh cached report for the topic is returned without any LLM call.
    /// Only runs that finish without warnings are cached. Cancelling `cancel`
    /// aborts in-flight work and returns [`ResearchError::Cancelled`].
    pub async fn run(
        &self,
        plan: &ResearchPlan,
        results: &[SearchResult],
        cancel: &CancellationToken,
    ) -> Result<SynthesizedResearch> {
        plan.validate()?;
        if cancel.is_cancelled() {
            return Err(ResearchError::Cancelled.into());
        }

        if let Some(cache) = &self.cache {
            if let Some(cached) = cache.get(&plan.topic).await? {
                info!(topic = %plan.topic, "Returning cached research");
                return Ok(cached);
            }
        }

        let start = Instant::now();
        let usage_before = self.brain.usage();
        info!(
            topic = %plan.topic,
            subtopics = plan.subtopics.len(),
            results = results.len(),
            "Starting research synthesis"
        );

        let research = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(topic = %plan.topic, "Research cancelled");
                return Err(ResearchError::Cancelled.into());
            }
            research = self.synthesize(plan, results, cancel) => research?,
        };

        // Concurrent runs on a shared brain also count toward this window.
        let usage = self.brain.usage().since(&usage_before);
        info!(
            topic = %plan.topic,
            elapsed_ms = start.elapsed().as_millis() as u64,
            llm_calls = usage.calls,
            failed_calls = usage.failed_calls,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            warnings = research.warnings.len(),
            "Research synthesis complete"
        );

        self.store(&research).await;
        Ok(research)
    }

    async fn synthesize(
        &self,
        plan: &ResearchPlan,
        results: &[SearchResult],
        cancel: &CancellationToken,
    ) -> Result<SynthesizedResearch> {
        let relevance = self.relevance.filter(results, plan).await?;
        let syntheses = self
            .synthesizer
            .synthesize_all(&plan.topic, &plan.subtopics, &relevance.items, cancel)
            .await?;
        let mut research = self
            .aggregator
            .aggregate(&plan.topic, syntheses, relevance.items)
            .await?;

        // Relevance warnings come first: they happened first.
        let mut warnings = relevance.warnings;
        warnings.append(&mut research.warnings);
        research.warnings = warnings;
        Ok(research)
    }

    async fn store(&self, research: &SynthesizedResearch) {
        let Some(cache) = &self.cache else {
            return;
        };
        if !research.is_complete() {
            debug!(topic = %research.topic, "Not caching research with warnings");
            return;
        }
        if let Err(e) = cache.set(&research.topic, research).await {
            warn!(topic = %research.topic, error = %e, "Failed to cache research");
        }
    }
}
