use anyhow::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use crate::repository::ToolRepository;
use crate::tools::{Tool, ToolSearchStrategy};

static WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\w+").unwrap());

/// Default search strategy: whole-tag matches score 1.0, tag-word and
/// description-word overlaps score `description_weight` each. Ties break on
/// insertion order.
pub struct TagWeightedSearch {
    tool_repository: Arc<dyn ToolRepository>,
    description_weight: f64,
}

impl TagWeightedSearch {
    pub fn new(repo: Arc<dyn ToolRepository>, description_weight: f64) -> Self {
        Self {
            tool_repository: repo,
            description_weight,
        }
    }

    fn score_tool(&self, tool: &Tool, query_lower: &str, query_words: &HashSet<String>) -> f64 {
        let mut score = 0.0;

        for tag in &tool.tags {
            let tag_lower = tag.to_ascii_lowercase();
            if query_lower.contains(&tag_lower) {
                score += 1.0;
            }
            for m in WORD_RE.find_iter(&tag_lower) {
                if query_words.contains(m.as_str()) {
                    score += self.description_weight;
                }
            }
        }

        for m in WORD_RE.find_iter(&tool.description) {
            let word = m.as_str().to_ascii_lowercase();
            if word.len() > 2 && query_words.contains(&word) {
                score += self.description_weight;
            }
        }

        score
    }
}

struct ScoredTool {
    tool: Tool,
    score: f64,
    order: usize,
}

fn compare_scored(a: &ScoredTool, b: &ScoredTool) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.order.cmp(&b.order))
}

fn take_top_n(scored: &mut Vec<ScoredTool>, limit: usize) {
    if limit != 0 && scored.len() > limit {
        scored.select_nth_unstable_by(limit - 1, compare_scored);
        scored.truncate(limit);
    }
    scored.sort_unstable_by(compare_scored);
}

#[async_trait]
impl ToolSearchStrategy for TagWeightedSearch {
    async fn search_tools(&self, query: &str, limit: usize) -> Result<Vec<Tool>> {
        let query_lower = query.trim().to_lowercase();
        let query_words: HashSet<String> = WORD_RE
            .find_iter(&query_lower)
            .map(|m| m.as_str().to_string())
            .collect();

        let tools = self.tool_repository.get_tools().await?;
        if tools.is_empty() {
            return Ok(Vec::new());
        }

        let mut positives = Vec::new();
        let mut rest = Vec::new();
        for (order, tool) in tools.into_iter().enumerate() {
            let score = self.score_tool(&tool, &query_lower, &query_words);
            let entry = ScoredTool { tool, score, order };
            if score > 0.0 {
                positives.push(entry);
            } else {
                rest.push(entry);
            }
        }

        // Fall back to zero-score tools only when nothing matched at all.
        let mut chosen = if positives.is_empty() { rest } else { positives };
        take_top_n(&mut chosen, limit);
        Ok(chosen.into_iter().map(|st| st.tool).collect())
    }
}
