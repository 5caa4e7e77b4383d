//! Prompt builders for each LLM-backed pipeline stage.

use crate::types::{RelevantContentItem, truncate_chars};
use std::fmt::Write as _;

pub const RELEVANCE_SYSTEM: &str = "You are a research assistant who grades how relevant web \
content is to a research topic. Reply with JSON only.";

pub const SYNTHESIS_SYSTEM: &str = "You are a research analyst. Write accurate, well-organized \
prose grounded only in the supplied sources.";

pub fn relevance_prompt(topic: &str, url: &str, content: &str, max_chars: usize) -> String {
    format!(
        "Rate the relevance of this content to the research topic: {topic}\n\n\
         URL: {url}\n\
         Content snippet: {snippet}...\n\n\
         Is this content highly relevant, somewhat relevant, or not relevant?\n\
         Respond as JSON: {{\"score\": <1-10>, \"label\": \"...\", \"reason\": \"...\"}}",
        snippet = truncate_chars(content, max_chars),
    )
}

pub fn synthesis_prompt(
    topic: &str,
    subtopic: &str,
    content: &[RelevantContentItem],
    max_chars_per_item: usize,
) -> String {
    let mut prompt = format!(
        "Research topic: {topic}\nSubtopic: {subtopic}\n\n\
         Synthesize the following sources into a comprehensive narrative about the subtopic. \
         Focus on facts, trends and insights, and note where sources disagree.\n\n"
    );
    for (i, item) in content.iter().enumerate() {
        let _ = write!(
            prompt,
            "Source {n}: {title}\nURL: {url}\n{body}\n\n",
            n = i + 1,
            title = item.source,
            url = item.url,
            body = truncate_chars(&item.content, max_chars_per_item),
        );
    }
    if content.is_empty() {
        prompt.push_str("No sources were found relevant to this subtopic. Say so briefly.\n");
    }
    prompt
}

fn narratives_block(narratives: &[(&str, &str)]) -> String {
    narratives
        .iter()
        .map(|(subtopic, narrative)| format!("## {subtopic}\n{narrative}"))
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn summary_prompt(topic: &str, narratives: &[(&str, &str)]) -> String {
    format!(
        "Write an executive summary of the research on: {topic}\n\n\
         Use two or three short paragraphs covering the most important conclusions.\n\n\
         {}",
        narratives_block(narratives)
    )
}

pub fn key_findings_prompt(topic: &str, narratives: &[(&str, &str)], max_findings: usize) -> String {
    format!(
        "List the key findings of the research on: {topic}\n\n\
         Return at most {max_findings} findings as a bulleted list, one finding per line.\n\n\
         {}",
        narratives_block(narratives)
    )
}
