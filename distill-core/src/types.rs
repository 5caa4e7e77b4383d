//! Core type definitions for the research pipeline.
//!
//! Defines the plan and search results supplied by collaborators, the
//! intermediate relevance and synthesis records, and the final
//! [`SynthesizedResearch`] report.

use crate::error::InputError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// The topic and ordered subtopics that guide synthesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchPlan {
    pub topic: String,
    pub subtopics: Vec<String>,
}

impl ResearchPlan {
    pub fn new(topic: impl Into<String>, subtopics: Vec<String>) -> Self {
        Self {
            topic: topic.into(),
            subtopics,
        }
    }

    /// Reject plans that cannot produce a meaningful report.
    pub fn validate(&self) -> Result<(), InputError> {
        if self.topic.trim().is_empty() {
            return Err(InputError::EmptyTopic);
        }
        if self.subtopics.is_empty() {
            return Err(InputError::NoSubtopics);
        }
        if let Some(index) = self.subtopics.iter().position(|s| s.trim().is_empty()) {
            return Err(InputError::BlankSubtopic { index });
        }
        Ok(())
    }
}

/// A raw search hit from the search/extraction collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub snippet: String,
    /// Extracted page text; `None` when extraction failed upstream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl SearchResult {
    /// Content worth assessing, if any.
    pub fn usable_content(&self) -> Option<&str> {
        self.content
            .as_deref()
            .filter(|content| !content.trim().is_empty())
    }
}

/// Relevance rating of a piece of content, always within `1..=10`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u8")]
pub struct RelevanceScore(u8);

impl RelevanceScore {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 10;

    pub fn new(value: u8) -> Option<Self> {
        (Self::MIN..=Self::MAX).contains(&value).then_some(Self(value))
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl TryFrom<i64> for RelevanceScore {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        u8::try_from(value)
            .ok()
            .and_then(RelevanceScore::new)
            .ok_or_else(|| format!("relevance score {value} outside 1..=10"))
    }
}

impl From<RelevanceScore> for u8 {
    fn from(score: RelevanceScore) -> u8 {
        score.0
    }
}

impl fmt::Display for RelevanceScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/10", self.0)
    }
}

/// A search result that passed the relevance threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelevantContentItem {
    /// Title of the originating search result.
    pub source: String,
    pub url: String,
    pub content: String,
    pub relevance_score: RelevanceScore,
}

/// Outcome of synthesizing one subtopic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubtopicStatus {
    Synthesized {
        narrative: String,
        sources: Vec<String>,
    },
    /// Error marker recorded in place of a narrative.
    Failed { reason: String },
}

/// Per-subtopic synthesis, index-aligned with the plan's subtopics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtopicSynthesis {
    pub subtopic: String,
    #[serde(flatten)]
    pub status: SubtopicStatus,
}

impl SubtopicSynthesis {
    pub fn synthesized(
        subtopic: impl Into<String>,
        narrative: impl Into<String>,
        sources: Vec<String>,
    ) -> Self {
        Self {
            subtopic: subtopic.into(),
            status: SubtopicStatus::Synthesized {
                narrative: narrative.into(),
                sources,
            },
        }
    }

    pub fn failed(subtopic: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            subtopic: subtopic.into(),
            status: SubtopicStatus::Failed {
                reason: reason.into(),
            },
        }
    }

    pub fn narrative(&self) -> Option<&str> {
        match &self.status {
            SubtopicStatus::Synthesized { narrative, .. } => Some(narrative),
            SubtopicStatus::Failed { .. } => None,
        }
    }

    /// Source urls; empty for a failed subtopic.
    pub fn sources(&self) -> &[String] {
        match &self.status {
            SubtopicStatus::Synthesized { sources, .. } => sources,
            SubtopicStatus::Failed { .. } => &[],
        }
    }

    pub fn failure_reason(&self) -> Option<&str> {
        match &self.status {
            SubtopicStatus::Failed { reason } => Some(reason),
            SubtopicStatus::Synthesized { .. } => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, SubtopicStatus::Failed { .. })
    }
}

/// One entry of the aggregated source list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub title: String,
    pub url: String,
}

/// Final pipeline output handed to the report generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesizedResearch {
    pub topic: String,
    pub executive_summary: String,
    pub subtopic_syntheses: Vec<SubtopicSynthesis>,
    pub key_findings: Vec<String>,
    /// Deduplicated by url, in first-seen order.
    pub sources: Vec<SourceRef>,
    /// What could not be produced; empty for a clean run.
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub relevant_content: Vec<RelevantContentItem>,
    pub generated_at: DateTime<Utc>,
}

impl SynthesizedResearch {
    pub fn is_complete(&self) -> bool {
        self.warnings.is_empty()
    }

    /// Subtopics that carry an error marker.
    pub fn failed_subtopics(&self) -> Vec<&str> {
        self.subtopic_syntheses
            .iter()
            .filter(|s| s.is_failed())
            .map(|s| s.subtopic.as_str())
            .collect()
    }
}

/// Truncate `text` to at most `max_chars` characters on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
pub fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
