//! Relevance filtering. Scores each search result against the topic and
//! keeps the ones at or above the configured threshold.

use super::prompts;
use crate::brain::{Brain, CompletionRequest};
use crate::config::DistillConfig;
use crate::error::{LlmError, Result};
use crate::types::{RelevanceScore, RelevantContentItem, ResearchPlan, SearchResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, LazyLock};
use tracing::{debug, info, warn};

const RELEVANCE_TEMPERATURE: f32 = 0.1;

static SCORE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bscore\s*(?:\(\s*\d{1,2}\s*[-–]\s*\d{1,2}\s*\)\s*)?(?::|=|of|is)?\s*(\d{1,3})\b")
        .expect("score pattern is valid")
});

static OUT_OF_TEN_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{1,3})\s*/\s*10\b").expect("out-of-ten pattern is valid"));

/// A qualitative label with an optional negation and degree.
static LABEL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:(not|isn['’]t|hardly|barely)\s+)?(?:(highly|very|somewhat|moderately|partially)\s+)?(relevant|irrelevant)\b",
    )
    .expect("label pattern is valid")
});

const NOT_RELEVANT: u8 = 1;
const PARTLY_RELEVANT: u8 = 5;
const HIGHLY_RELEVANT: u8 = 9;

/// Relevant items plus the assessments that could not be made.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelevanceReport {
    pub items: Vec<RelevantContentItem>,
    pub warnings: Vec<String>,
}

/// Scores search results with the LLM and keeps the relevant ones.
pub struct RelevanceFilter {
    brain: Arc<Brain>,
    model: String,
    threshold: u8,
    max_content_chars: usize,
}

impl RelevanceFilter {
    pub fn new(brain: Arc<Brain>, config: &DistillConfig) -> Self {
        Self {
            brain,
            model: config.models.relevance.clone(),
            threshold: config.relevance.threshold,
            max_content_chars: config.relevance.max_content_chars,
        }
    }

    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    /// Assess every result with content and keep those scoring at or above
    /// the threshold, in input order.
    ///
    /// A failed assessment counts as not relevant and adds a warning. If every
    /// assessment fails, the last error is returned.
    pub async fn filter(
        &self,
        results: &[SearchResult],
        plan: &ResearchPlan,
    ) -> Result<RelevanceReport> {
        let eligible: Vec<(&SearchResult, &str)> = results
            .iter()
            .filter_map(|r| r.usable_content().map(|content| (r, content)))
            .collect();

        let skipped = results.len() - eligible.len();
        if skipped > 0 {
            debug!(skipped, "Skipping search results without extracted content");
        }
        if eligible.is_empty() {
            return Ok(RelevanceReport::default());
        }

        let assessments = futures::future::join_all(
            eligible
                .iter()
                .map(|(result, content)| self.assess(&plan.topic, &result.url, content)),
        )
        .await;

        let mut report = RelevanceReport::default();
        let mut last_error: Option<LlmError> = None;
        let mut failures = 0usize;

        for ((result, content), assessment) in eligible.iter().zip(assessments) {
            match assessment {
                Ok(Some(score)) if score.value() >= self.threshold => {
                    report.items.push(RelevantContentItem {
                        source: result.title.clone(),
                        url: result.url.clone(),
                        content: content.to_string(),
                        relevance_score: score,
                    });
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(url = %result.url, error = %e, "Relevance assessment failed");
                    report
                        .warnings
                        .push(format!("relevance assessment failed for {}: {e}", result.url));
                    failures += 1;
                    last_error = Some(e);
                }
            }
        }

        if failures == eligible.len() {
            if let Some(e) = last_error {
                return Err(e.into());
            }
        }

        info!(
            assessed = eligible.len(),
            relevant = report.items.len(),
            failed = failures,
            threshold = self.threshold,
            "Relevance filtering complete"
        );
        Ok(report)
    }

    /// Ask the LLM for a score. `Ok(None)` means the reply could not be parsed.
    async fn assess(
        &self,
        topic: &str,
        url: &str,
        content: &str,
    ) -> std::result::Result<Option<RelevanceScore>, LlmError> {
        let request = CompletionRequest::new(prompts::relevance_prompt(
            topic,
            url,
            content,
            self.max_content_chars,
        ))
        .with_system(prompts::RELEVANCE_SYSTEM)
        .with_model(&self.model)
        .with_temperature(RELEVANCE_TEMPERATURE);

        let response = self.brain.complete("relevance", request).await?;
        let score = parse_relevance(&response.text);
        match score {
            Some(score) => debug!(url, %score, "Relevance assessed"),
            None => debug!(
                url,
                reply = %response.text,
                "Unparseable relevance assessment, treating as not relevant"
            ),
        }
        Ok(score)
    }
}

/// Parse a relevance score out of a free-form LLM reply.
///
/// Tries a JSON object with a numeric `score`, then `score: N` / `score of N`
/// / `N/10`, then qualitative labels (lowest wins). Values outside `1..=10`
/// are ignored.
pub fn parse_relevance(text: &str) -> Option<RelevanceScore> {
    parse_json_score(text)
        .or_else(|| parse_pattern_score(text))
        .or_else(|| parse_label_score(text))
}

fn parse_json_score(text: &str) -> Option<RelevanceScore> {
    text.match_indices('{').find_map(|(start, _)| {
        let mut stream =
            serde_json::Deserializer::from_str(&text[start..]).into_iter::<serde_json::Value>();
        let value = stream.next()?.ok()?;
        let score = value.as_object()?.get("score")?;
        let number = score
            .as_i64()
            .or_else(|| score.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))?;
        RelevanceScore::try_from(number).ok()
    })
}

fn parse_pattern_score(text: &str) -> Option<RelevanceScore> {
    [&*SCORE_PATTERN, &*OUT_OF_TEN_PATTERN]
        .into_iter()
        .flat_map(|pattern| pattern.captures_iter(text))
        .find_map(|caps| {
            let number: i64 = caps.get(1)?.as_str().parse().ok()?;
            RelevanceScore::try_from(number).ok()
        })
}

fn parse_label_score(text: &str) -> Option<RelevanceScore> {
    LABEL_PATTERN
        .captures_iter(text)
        .filter_map(|caps| label_score(&caps))
        .min()
        .and_then(RelevanceScore::new)
}

/// Any negated label counts as not relevant. A bare "relevant" carries no
/// degree and is skipped.
fn label_score(caps: &regex::Captures<'_>) -> Option<u8> {
    if caps.get(1).is_some() || caps[3].eq_ignore_ascii_case("irrelevant") {
        return Some(NOT_RELEVANT);
    }
    match caps.get(2)?.as_str().to_ascii_lowercase().as_str() {
        "highly" | "very" => Some(HIGHLY_RELEVANT),
        _ => Some(PARTLY_RELEVANT),
    }
}
