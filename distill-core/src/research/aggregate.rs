//! Aggregation of subtopic syntheses into the final research report.

use super::prompts;
use crate::brain::{Brain, CompletionRequest};
use crate::config::DistillConfig;
use crate::error::{LlmError, ResearchError, Result};
use crate::types::{
    RelevantContentItem, SourceRef, SubtopicSynthesis, SynthesizedResearch, truncate_chars,
};
use chrono::Utc;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock};
use tracing::{info, warn};

const SUMMARY_TEMPERATURE: f32 = 0.3;

static LIST_ITEM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[-*•]|\d{1,3}[.)])\s+(.*)$").expect("list item pattern is valid")
});

/// Builds the executive summary, key findings and source list.
pub struct SynthesisAggregator {
    brain: Arc<Brain>,
    model: String,
    max_output_chars: usize,
    max_key_findings: usize,
}

impl SynthesisAggregator {
    pub fn new(brain: Arc<Brain>, config: &DistillConfig) -> Self {
        Self {
            brain,
            model: config.models.summary.clone(),
            max_output_chars: config.synthesis.max_output_chars,
            max_key_findings: config.synthesis.max_key_findings,
        }
    }

    /// Combine the per-subtopic results into a [`SynthesizedResearch`].
    ///
    /// Fails only when no subtopic was synthesized. Failed subtopics, and a
    /// failed summary or key-findings call, are reported as warnings.
    pub async fn aggregate(
        &self,
        topic: &str,
        syntheses: Vec<SubtopicSynthesis>,
        relevant_content: Vec<RelevantContentItem>,
    ) -> Result<SynthesizedResearch> {
        let narratives: Vec<(&str, &str)> = syntheses
            .iter()
            .filter_map(|s| s.narrative().map(|n| (s.subtopic.as_str(), n)))
            .collect();
        if narratives.is_empty() {
            return Err(ResearchError::AllSubtopicsFailed {
                count: syntheses.len(),
            }
            .into());
        }

        let mut warnings: Vec<String> = syntheses
            .iter()
            .filter_map(|s| {
                s.failure_reason().map(|reason| {
                    format!("subtopic '{}' could not be synthesized: {reason}", s.subtopic)
                })
            })
            .collect();

        let (summary, findings) = tokio::join!(
            self.executive_summary(topic, &narratives),
            self.key_findings(topic, &narratives)
        );

        let executive_summary = summary.unwrap_or_else(|e| {
            warn!(topic, error = %e, "Executive summary failed");
            warnings.push(format!("executive summary could not be generated: {e}"));
            String::new()
        });
        let key_findings = findings.unwrap_or_else(|e| {
            warn!(topic, error = %e, "Key findings extraction failed");
            warnings.push(format!("key findings could not be extracted: {e}"));
            Vec::new()
        });

        let sources = compile_sources(&syntheses, &relevant_content);
        info!(
            topic,
            subtopics = syntheses.len(),
            synthesized = narratives.len(),
            key_findings = key_findings.len(),
            sources = sources.len(),
            warnings = warnings.len(),
            "Research aggregated"
        );

        Ok(SynthesizedResearch {
            topic: topic.to_string(),
            executive_summary,
            subtopic_syntheses: syntheses,
            key_findings,
            sources,
            warnings,
            relevant_content,
            generated_at: Utc::now(),
        })
    }

    async fn executive_summary(
        &self,
        topic: &str,
        narratives: &[(&str, &str)],
    ) -> std::result::Result<String, LlmError> {
        let request = CompletionRequest::new(prompts::summary_prompt(topic, narratives))
            .with_system(prompts::SYNTHESIS_SYSTEM)
            .with_model(&self.model)
            .with_temperature(SUMMARY_TEMPERATURE);
        let response = self.brain.complete("executive_summary", request).await?;
        Ok(truncate_chars(response.text.trim(), self.max_output_chars).to_string())
    }

    async fn key_findings(
        &self,
        topic: &str,
        narratives: &[(&str, &str)],
    ) -> std::result::Result<Vec<String>, LlmError> {
        let request = CompletionRequest::new(prompts::key_findings_prompt(
            topic,
            narratives,
            self.max_key_findings,
        ))
        .with_system(prompts::SYNTHESIS_SYSTEM)
        .with_model(&self.model)
        .with_temperature(SUMMARY_TEMPERATURE);
        let response = self.brain.complete("key_findings", request).await?;
        Ok(parse_key_findings(&response.text, self.max_key_findings))
    }
}

/// Parse a list of findings from an LLM reply.
///
/// Accepts a JSON string array, or bulleted (`-`, `*`, `•`) or numbered
/// (`1.`, `1)`) lines. When no line carries a marker, every non-blank line
/// is a finding.
pub fn parse_key_findings(text: &str, max: usize) -> Vec<String> {
    if let Some(items) = parse_json_list(text) {
        return items
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .take(max)
            .collect();
    }

    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with("```"))
        .collect();
    let marked: Vec<&str> = lines
        .iter()
        .filter_map(|&line| {
            LIST_ITEM
                .captures(line)
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().trim())
        })
        .collect();

    let items = if marked.is_empty() { lines } else { marked };
    items
        .into_iter()
        .filter(|s| !s.is_empty())
        .take(max)
        .map(String::from)
        .collect()
}

/// The reply is a JSON array only when it is nothing else, optionally inside a
/// code fence.
fn parse_json_list(text: &str) -> Option<Vec<String>> {
    let body = fenced_body(text).unwrap_or(text).trim();
    if !body.starts_with('[') {
        return None;
    }
    serde_json::from_str(body).ok()
}

fn fenced_body(text: &str) -> Option<&str> {
    let (_, after) = text.split_once("```")?;
    let (_, body) = after.split_once('\n')?;
    Some(body.split_once("```").map_or(body, |(inner, _)| inner))
}

/// Flatten each synthesized subtopic's urls into one list, deduplicated in
/// first-seen order, titled from the matching relevant content.
pub fn compile_sources(
    syntheses: &[SubtopicSynthesis],
    relevant_content: &[RelevantContentItem],
) -> Vec<SourceRef> {
    let mut titles: HashMap<&str, &str> = HashMap::new();
    for item in relevant_content {
        titles
            .entry(item.url.as_str())
            .or_insert(item.source.as_str());
    }

    let mut seen = HashSet::new();
    syntheses
        .iter()
        .flat_map(|s| s.sources())
        .filter(|&url| seen.insert(url.as_str()))
        .map(|url| SourceRef {
            title: titles
                .get(url.as_str())
                .map_or_else(|| url.clone(), |t| t.to_string()),
            url: url.clone(),
        })
        .collect()
}
