use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};

use crate::error::{DriftError, Result};
use crate::llm::prompts::{relevance_prompt, CONTEXT_MESSAGE_CHARS};
use crate::llm::{CompletionOptions, LlmProvider};
use crate::models::{Message, RelevanceCategory, Role};

/// Messages of recent context sent with each classification.
const CONTEXT_WINDOW: usize = 5;

/// One message's classification. `category` and `relevance_score` are
/// `None` when the call failed after retries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageJudgement {
    pub index: usize,
    pub category: Option<RelevanceCategory>,
    pub relevance_score: Option<f64>,
    pub is_segment_break: bool,
    pub reasoning: String,
}

impl MessageJudgement {
    fn unknown(index: usize, reason: String) -> Self {
        Self {
            index,
            category: None,
            relevance_score: None,
            is_segment_break: false,
            reasoning: reason,
        }
    }

    pub fn is_known(&self) -> bool {
        self.relevance_score.is_some()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RelevanceAnalysis {
    pub judgements: Vec<MessageJudgement>,
    pub mean_relevance: Option<f64>,
    pub branch_count: usize,
    pub unknown_count: usize,
}

impl RelevanceAnalysis {
    fn from_judgements(judgements: Vec<MessageJudgement>) -> Self {
        let known: Vec<f64> = judgements.iter().filter_map(|j| j.relevance_score).collect();
        let mean_relevance = if known.is_empty() {
            None
        } else {
            Some(known.iter().sum::<f64>() / known.len() as f64)
        };

        Self {
            branch_count: judgements
                .iter()
                .filter(|j| j.category.is_some_and(|c| c.is_branch()))
                .count(),
            unknown_count: judgements.iter().filter(|j| !j.is_known()).count(),
            mean_relevance,
            judgements,
        }
    }

    /// `1 - mean/10`: low relevance means high divergence.
    pub fn score(&self) -> Option<f64> {
        self.mean_relevance
            .map(|mean| (1.0 - mean / 10.0).clamp(0.0, 1.0))
    }

    /// Suggested boundaries. Returns to an earlier topic are reported
    /// separately and never vote.
    pub fn breaks(&self) -> Vec<usize> {
        self.judgements
            .iter()
            .filter(|j| j.is_segment_break && j.category != Some(RelevanceCategory::Returning))
            .map(|j| j.index)
            .collect()
    }

    pub fn returns(&self) -> Vec<usize> {
        self.judgements
            .iter()
            .filter(|j| j.category == Some(RelevanceCategory::Returning))
            .map(|j| j.index)
            .collect()
    }

    pub fn mean_in_span(&self, start: usize, end: usize) -> Option<f64> {
        let scores: Vec<f64> = self
            .judgements
            .iter()
            .filter(|j| (start..=end).contains(&j.index))
            .filter_map(|j| j.relevance_score)
            .collect();
        if scores.is_empty() {
            None
        } else {
            Some(scores.iter().sum::<f64>() / scores.len() as f64)
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawJudgement {
    #[serde(alias = "relation")]
    category: String,
    relevance_score: f64,
    #[serde(default, alias = "suggested_segment_break")]
    is_segment_break: bool,
    #[serde(default)]
    reasoning: String,
}

/// LLM-as-judge relevance classifier.
#[derive(Clone)]
pub struct RelevanceJudge {
    llm: Arc<LlmProvider>,
}

impl RelevanceJudge {
    pub fn new(llm: Arc<LlmProvider>) -> Self {
        Self { llm }
    }

    pub fn is_available(&self) -> bool {
        self.llm.is_available()
    }

    /// Classify every message after the anchor window. Returns `None` when
    /// the analyzer should be treated as unavailable: no provider, an
    /// authentication failure, or every call failing.
    pub async fn analyze(
        &self,
        messages: &[Message],
        anchor_window: usize,
    ) -> Option<RelevanceAnalysis> {
        if !self.is_available() || messages.len() <= anchor_window {
            return None;
        }

        let anchor_topic = anchor_topic(&messages[..anchor_window]);
        let concurrency = self.llm.concurrency();

        let results: Vec<(usize, Result<RawJudgement>)> = stream::iter(anchor_window..messages.len())
            .map(|index| {
                let start = index.saturating_sub(CONTEXT_WINDOW);
                let prompt = relevance_prompt(&anchor_topic, &messages[start..index], &messages[index]);
                async move { (index, self.classify(&prompt).await) }
            })
            .buffered(concurrency)
            .collect()
            .await;

        if let Some((index, err)) = results
            .iter()
            .find_map(|(i, r)| r.as_ref().err().filter(|e| e.is_fatal_llm()).map(|e| (i, e)))
        {
            tracing::warn!(index, error = %err, "Relevance judge unavailable");
            return None;
        }

        let judgements: Vec<MessageJudgement> = results
            .into_iter()
            .map(|(index, result)| match result {
                Ok(raw) => judgement_from_raw(index, raw),
                Err(err) => {
                    tracing::debug!(index, error = %err, "Relevance classification failed");
                    MessageJudgement::unknown(index, err.to_string())
                }
            })
            .collect();

        if judgements.iter().all(|j| !j.is_known()) {
            tracing::warn!(
                messages = judgements.len(),
                "All relevance classifications failed"
            );
            return None;
        }

        Some(RelevanceAnalysis::from_judgements(judgements))
    }

    async fn classify(&self, prompt: &str) -> Result<RawJudgement> {
        let options = CompletionOptions {
            temperature: Some(0.0),
            max_tokens: Some(300),
            stop: None,
        };

        tokio::time::timeout(
            self.llm.call_timeout(),
            self.llm.complete_structured::<RawJudgement>(prompt, Some(&options)),
        )
        .await
        .map_err(|_| DriftError::Llm("Relevance classification timed out".to_string()))?
    }
}

fn judgement_from_raw(index: usize, raw: RawJudgement) -> MessageJudgement {
    let category = raw.category.parse::<RelevanceCategory>().unwrap_or_else(|_| {
        tracing::debug!(index, category = %raw.category, "Unrecognized category, treating as continuing");
        RelevanceCategory::Continuing
    });

    MessageJudgement {
        index,
        category: Some(category),
        relevance_score: Some(raw.relevance_score.clamp(0.0, 10.0)),
        is_segment_break: raw.is_segment_break,
        reasoning: raw.reasoning,
    }
}

/// The anchor topic shown to the judge: the opening user messages, or the
/// opening messages of any role when there are none.
fn anchor_topic(anchor: &[Message]) -> String {
    let user: Vec<&Message> = anchor.iter().filter(|m| m.role == Role::User).collect();
    let source: Vec<&Message> = if user.is_empty() {
        anchor.iter().collect()
    } else {
        user
    };

    source
        .iter()
        .map(|m| m.content.chars().take(CONTEXT_MESSAGE_CHARS).collect::<String>())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn judgement(index: usize, category: RelevanceCategory, score: f64, brk: bool) -> MessageJudgement {
        MessageJudgement {
            index,
            category: Some(category),
            relevance_score: Some(score),
            is_segment_break: brk,
            reasoning: String::new(),
        }
    }

    #[test]
    fn test_aggregates_skip_unknown() {
        let analysis = RelevanceAnalysis::from_judgements(vec![
            judgement(3, RelevanceCategory::Continuing, 8.0, false),
            MessageJudgement::unknown(4, "timeout".to_string()),
            judgement(5, RelevanceCategory::Branching, 2.0, true),
            judgement(6, RelevanceCategory::Tangent, 2.0, false),
        ]);

        assert_eq!(analysis.mean_relevance, Some(4.0));
        assert_eq!(analysis.unknown_count, 1);
        assert_eq!(analysis.branch_count, 2);
        assert!((analysis.score().unwrap() - 0.6).abs() < 1e-9);
        assert_eq!(analysis.breaks(), vec![5]);
        assert_eq!(analysis.mean_in_span(5, 6), Some(2.0));
        assert_eq!(analysis.mean_in_span(4, 4), None);
    }

    #[test]
    fn test_returning_never_votes() {
        let analysis = RelevanceAnalysis::from_judgements(vec![
            judgement(3, RelevanceCategory::Branching, 1.0, true),
            judgement(9, RelevanceCategory::Returning, 9.0, true),
        ]);
        assert_eq!(analysis.breaks(), vec![3]);
        assert_eq!(analysis.returns(), vec![9]);
    }

    #[test]
    fn test_raw_judgement_accepts_legacy_field_names() {
        let raw: RawJudgement = serde_json::from_str(
            r#"{"relation": "drilling_down", "relevance_score": 14, "suggested_segment_break": true}"#,
        )
        .unwrap();
        let judgement = judgement_from_raw(7, raw);
        assert_eq!(judgement.category, Some(RelevanceCategory::Drilling));
        assert_eq!(judgement.relevance_score, Some(10.0));
        assert!(judgement.is_segment_break);
    }

    #[test]
    fn test_anchor_topic_prefers_user_messages() {
        let anchor = vec![
            Message::user("How do I tune autovacuum?"),
            Message::assistant("Start with scale factors."),
            Message::user("Which ones matter most?"),
        ];
        let topic = anchor_topic(&anchor);
        assert_eq!(topic, "How do I tune autovacuum?\nWhich ones matter most?");
    }

    #[tokio::test]
    async fn test_unavailable_provider_skips_analysis() {
        let judge = RelevanceJudge::new(Arc::new(LlmProvider::unavailable("not configured")));
        let messages: Vec<Message> = (0..6).map(|i| Message::user(format!("m{i}"))).collect();
        assert!(judge.analyze(&messages, 3).await.is_none());
    }
}
