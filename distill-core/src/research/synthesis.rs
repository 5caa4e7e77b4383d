//! Per-subtopic synthesis, fanned out as one task per subtopic.

use super::prompts;
use crate::brain::{Brain, CompletionRequest};
use crate::config::DistillConfig;
use crate::error::{LlmError, ResearchError};
use crate::types::{RelevantContentItem, SubtopicSynthesis, truncate_chars};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SYNTHESIS_TEMPERATURE: f32 = 0.1;

/// Writes one narrative per subtopic from the relevant content.
#[derive(Clone)]
pub struct SubtopicSynthesizer {
    brain: Arc<Brain>,
    model: String,
    max_output_chars: usize,
    max_content_chars_per_item: usize,
}

impl SubtopicSynthesizer {
    pub fn new(brain: Arc<Brain>, config: &DistillConfig) -> Self {
        Self {
            brain,
            model: config.models.synthesis.clone(),
            max_output_chars: config.synthesis.max_output_chars,
            max_content_chars_per_item: config.synthesis.max_content_chars_per_item,
        }
    }

    /// Synthesize a single subtopic from `content`.
    pub async fn synthesize(
        &self,
        topic: &str,
        subtopic: &str,
        content: &[RelevantContentItem],
    ) -> Result<SubtopicSynthesis, LlmError> {
        let request = CompletionRequest::new(prompts::synthesis_prompt(
            topic,
            subtopic,
            content,
            self.max_content_chars_per_item,
        ))
        .with_system(prompts::SYNTHESIS_SYSTEM)
        .with_model(&self.model)
        .with_temperature(SYNTHESIS_TEMPERATURE);

        let response = self.brain.complete("synthesis", request).await?;
        let narrative = response.text.trim();
        if narrative.is_empty() {
            return Err(LlmError::ResponseParse {
                message: format!("empty synthesis for subtopic '{subtopic}'"),
            });
        }

        debug!(subtopic, chars = narrative.len(), "Subtopic synthesized");
        Ok(SubtopicSynthesis::synthesized(
            subtopic,
            truncate_chars(narrative, self.max_output_chars),
            unique_urls(content),
        ))
    }

    /// Synthesize every subtopic concurrently.
    ///
    /// The result is index-aligned with `subtopics`. A subtopic whose call
    /// fails or whose task panics becomes a failed entry; the others are
    /// unaffected. Cancelling `cancel` aborts all in-flight tasks.
    pub async fn synthesize_all(
        &self,
        topic: &str,
        subtopics: &[String],
        relevant_content: &[RelevantContentItem],
        cancel: &CancellationToken,
    ) -> Result<Vec<SubtopicSynthesis>, ResearchError> {
        let topic: Arc<str> = Arc::from(topic);
        let content: Arc<[RelevantContentItem]> = Arc::from(relevant_content);

        let mut tasks = JoinSet::new();
        for (index, subtopic) in subtopics.iter().cloned().enumerate() {
            let this = self.clone();
            let topic = Arc::clone(&topic);
            let content = Arc::clone(&content);
            tasks.spawn(async move {
                let synthesis = match this.synthesize(&topic, &subtopic, &content).await {
                    Ok(synthesis) => synthesis,
                    Err(e) => {
                        warn!(subtopic = %subtopic, error = %e, "Subtopic synthesis failed");
                        SubtopicSynthesis::failed(subtopic, e.to_string())
                    }
                };
                (index, synthesis)
            });
        }

        let mut slots: Vec<Option<SubtopicSynthesis>> = vec![None; subtopics.len()];
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tasks.abort_all();
                    info!(topic = %topic, "Synthesis cancelled");
                    return Err(ResearchError::Cancelled);
                }
                next = tasks.join_next() => match next {
                    Some(Ok((index, synthesis))) => slots[index] = Some(synthesis),
                    Some(Err(e)) => warn!(error = %e, "Synthesis task did not complete"),
                    None => break,
                },
            }
        }

        let syntheses: Vec<SubtopicSynthesis> = slots
            .into_iter()
            .zip(subtopics)
            .map(|(slot, subtopic)| {
                slot.unwrap_or_else(|| {
                    SubtopicSynthesis::failed(subtopic.as_str(), "synthesis task panicked")
                })
            })
            .collect();

        let failed = syntheses.iter().filter(|s| s.is_failed()).count();
        info!(
            topic = %topic,
            subtopics = syntheses.len(),
            failed,
            "Subtopic synthesis complete"
        );
        Ok(syntheses)
    }
}

/// Urls of `content`, deduplicated in first-seen order.
fn unique_urls(content: &[RelevantContentItem]) -> Vec<String> {
    let mut seen = HashSet::new();
    content
        .iter()
        .filter(|&item| seen.insert(item.url.as_str()))
        .map(|item| item.url.clone())
        .collect()
}
