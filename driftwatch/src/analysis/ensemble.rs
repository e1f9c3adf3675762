//! Ensemble segmentation: combine drift, topic and relevance signals into
//! confirmed boundaries, segments and one composite divergence report.

use std::sync::Arc;

use chrono::Utc;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};

use crate::config::{AnalysisConfig, ComponentWeights, EnsembleConfig};
use crate::embeddings::Embedder;
use crate::error::{DriftError, Result};
use crate::llm::prompts::segment_summary_prompt;
use crate::llm::{CompletionOptions, LlmProvider};
use crate::models::{
    Conversation, DivergenceMetrics, DivergenceReport, Message, Role, ScoreBand, Segment,
};

use super::drift::{DriftAnalysis, DriftAnalyzer};
use super::math::{cosine_similarity, l2_normalize, mean_vector};
use super::relevance::{RelevanceAnalysis, RelevanceJudge};
use super::terms;
use super::topics::{distribution_stats, transition_rate, TopicAnalysis, TopicAnalyzer};

const FALLBACK_SUMMARY_CHARS: usize = 200;
const SUMMARY_WORDS: usize = 40;
const DEFAULT_TOPIC_LABEL: &str = "main topic";

/// One analyzer's contribution to the composite score.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComponentScore {
    pub name: &'static str,
    pub score: f64,
    pub weight: f64,
    pub available: bool,
}

impl ComponentScore {
    fn new(name: &'static str, score: Option<f64>, weight: f64) -> Self {
        Self {
            name,
            score: score.unwrap_or(0.0).clamp(0.0, 1.0),
            weight,
            available: score.is_some(),
        }
    }
}

/// Weighted mean over the available components, with weights renormalized
/// to sum to 1. Zero when nothing is available.
pub fn composite_score(components: &[ComponentScore]) -> f64 {
    let total_weight: f64 = components
        .iter()
        .filter(|c| c.available && c.weight > 0.0)
        .map(|c| c.weight)
        .sum();
    if total_weight <= 0.0 {
        return 0.0;
    }

    let weighted: f64 = components
        .iter()
        .filter(|c| c.available && c.weight > 0.0)
        .map(|c| c.score * c.weight)
        .sum();

    (weighted / total_weight).clamp(0.0, 1.0)
}

fn components(
    weights: &ComponentWeights,
    drift: Option<f64>,
    entropy: Option<f64>,
    transition: Option<f64>,
    relevance: Option<f64>,
) -> [ComponentScore; 4] {
    [
        ComponentScore::new("embedding_drift", drift, weights.drift),
        ComponentScore::new("topic_entropy", entropy, weights.entropy),
        ComponentScore::new("topic_transition", transition, weights.transition),
        ComponentScore::new("llm_relevance", relevance, weights.relevance),
    ]
}

/// Boundary candidates from one source, each worth `votes`.
#[derive(Debug, Clone)]
pub struct BoundaryVote {
    pub source: &'static str,
    pub votes: u32,
    pub candidates: Vec<usize>,
}

fn votes_at(index: usize, sources: &[BoundaryVote], tolerance: usize) -> u32 {
    sources
        .iter()
        .filter(|s| s.candidates.iter().any(|&c| c.abs_diff(index) <= tolerance))
        .map(|s| s.votes)
        .sum()
}

/// Confirm candidate indices that gather at least `vote_threshold` votes.
///
/// A source votes for an index if any of its candidates lies within
/// `boundary_tolerance` of it, and counts once per index. Confirmed
/// boundaries start at least `min_segment_messages` after the previous
/// boundary (or the start); inside that spacing the candidate with more
/// votes wins, the earlier one on ties.
pub fn confirm_boundaries(sources: &[BoundaryVote], n: usize, config: &EnsembleConfig) -> Vec<usize> {
    let min_gap = config.min_segment_messages.max(1);
    let mut candidates: Vec<usize> = sources
        .iter()
        .flat_map(|s| s.candidates.iter().copied())
        .filter(|&c| c > 0 && c < n)
        .collect();
    candidates.sort_unstable();
    candidates.dedup();

    let mut confirmed: Vec<(usize, u32)> = Vec::new();
    for index in candidates {
        if index < min_gap {
            continue;
        }

        let votes = votes_at(index, sources, config.boundary_tolerance);
        if votes < config.vote_threshold {
            continue;
        }

        match confirmed.last().copied() {
            Some((last, last_votes)) if index - last < min_gap => {
                let floor = confirmed
                    .len()
                    .checked_sub(2)
                    .map_or(min_gap, |i| confirmed[i].0 + min_gap);
                if votes > last_votes && index >= floor {
                    if let Some(slot) = confirmed.last_mut() {
                        *slot = (index, votes);
                    }
                }
            }
            _ => confirmed.push((index, votes)),
        }
    }

    confirmed.into_iter().map(|(index, _)| index).collect()
}

/// Inclusive `(start, end)` spans for sorted boundaries.
pub fn spans(boundaries: &[usize], n: usize) -> Vec<(usize, usize)> {
    if n == 0 {
        return Vec::new();
    }

    let mut starts = vec![0];
    starts.extend(boundaries.iter().copied().filter(|&b| b > 0 && b < n));
    starts
        .iter()
        .enumerate()
        .map(|(i, &start)| {
            let end = starts.get(i + 1).map_or(n - 1, |next| next - 1);
            (start, end)
        })
        .collect()
}

/// Index of the earlier segment whose anchor is most similar, per segment.
fn parent_indices(anchors: &[Vec<f32>]) -> Vec<Option<usize>> {
    anchors
        .iter()
        .enumerate()
        .map(|(j, anchor)| {
            (0..j)
                .map(|i| (i, cosine_similarity(&anchors[i], anchor)))
                .fold(None, |best: Option<(usize, f64)>, (i, sim)| match best {
                    Some((_, best_sim)) if best_sim >= sim => best,
                    _ => Some((i, sim)),
                })
                .map(|(i, _)| i)
        })
        .collect()
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.trim().chars().take(max_chars).collect()
}

fn fallback_summary(span: &[Message]) -> String {
    span.iter()
        .find(|m| m.role == Role::User && !m.content.trim().is_empty())
        .or_else(|| span.iter().find(|m| !m.content.trim().is_empty()))
        .map(|m| truncate_chars(&m.content, FALLBACK_SUMMARY_CHARS))
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnalyzeOptions {
    pub use_llm: bool,
    pub generate_summaries: bool,
}

impl Default for AnalyzeOptions {
    fn default() -> Self {
        Self {
            use_llm: true,
            generate_summaries: false,
        }
    }
}

/// Per-conversation signals gathered before voting.
struct Signals {
    embeddings: Vec<Vec<f32>>,
    drift: DriftAnalysis,
    topics: Option<TopicAnalysis>,
    relevance: Option<RelevanceAnalysis>,
}

/// Runs every analyzer over one conversation and assembles its report.
#[derive(Clone)]
pub struct EnsembleSegmenter {
    config: AnalysisConfig,
    embedder: Arc<dyn Embedder>,
    llm: Arc<LlmProvider>,
    judge: RelevanceJudge,
    drift: DriftAnalyzer,
    topics: TopicAnalyzer,
}

impl EnsembleSegmenter {
    pub fn new(config: AnalysisConfig, embedder: Arc<dyn Embedder>, llm: Arc<LlmProvider>) -> Self {
        Self {
            drift: DriftAnalyzer::new(config.drift.clone()),
            topics: TopicAnalyzer::new(config.topics.clone()),
            judge: RelevanceJudge::new(Arc::clone(&llm)),
            config,
            embedder,
            llm,
        }
    }

    pub fn embedding_model(&self) -> &str {
        self.embedder.model_id()
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Embed and L2-normalize message texts.
    pub async fn embed_messages(&self, messages: &[Message]) -> Result<Vec<Vec<f32>>> {
        let texts: Vec<String> = messages.iter().map(|m| m.content.clone()).collect();
        let mut embeddings = self.embedder.embed(texts).await?;

        if embeddings.len() != messages.len() {
            return Err(DriftError::Embedding(format!(
                "Expected {} embeddings, got {}",
                messages.len(),
                embeddings.len()
            )));
        }

        let dim = embeddings.first().map_or(0, Vec::len);
        if !messages.is_empty() && (dim == 0 || embeddings.iter().any(|e| e.len() != dim)) {
            return Err(DriftError::Embedding(
                "Embedding backend returned inconsistent dimensions".to_string(),
            ));
        }

        for embedding in embeddings.iter_mut() {
            l2_normalize(embedding);
        }
        Ok(embeddings)
    }

    pub async fn analyze(
        &self,
        conversation: &Conversation,
        options: &AnalyzeOptions,
    ) -> Result<DivergenceReport> {
        let messages = &conversation.messages;
        let n = messages.len();

        if n == 0 {
            return Ok(self.empty_report(conversation));
        }

        let embeddings = self.embed_messages(messages).await?;
        if n < self.drift.anchor_window() {
            return Ok(self.trivial_report(conversation, &embeddings));
        }

        let signals = self.gather_signals(conversation, embeddings, options).await?;
        self.assemble(conversation, signals, options).await
    }

    async fn gather_signals(
        &self,
        conversation: &Conversation,
        embeddings: Vec<Vec<f32>>,
        options: &AnalyzeOptions,
    ) -> Result<Signals> {
        let drift = self.drift.analyze(&embeddings);

        let analyzer = self.topics.clone();
        let topic_embeddings = embeddings.clone();
        let texts = conversation.texts();
        let topics = tokio::task::spawn_blocking(move || analyzer.analyze(&topic_embeddings, &texts))
            .await
            .map_err(|e| DriftError::Processing(format!("Topic analysis task failed: {e}")))?;

        let relevance = if options.use_llm {
            self.judge
                .analyze(&conversation.messages, self.drift.anchor_window())
                .await
        } else {
            None
        };

        tracing::debug!(
            conversation_id = %conversation.id,
            drift_changepoints = drift.changepoints.len(),
            topics = topics.as_ref().map(|t| t.num_topics),
            relevance = relevance.is_some(),
            "Divergence signals gathered"
        );

        Ok(Signals {
            embeddings,
            drift,
            topics,
            relevance,
        })
    }

    fn weights(&self, with_relevance: bool) -> &ComponentWeights {
        if with_relevance {
            &self.config.ensemble.weights_with_llm
        } else {
            &self.config.ensemble.weights_without_llm
        }
    }

    fn boundary_votes(&self, signals: &Signals) -> Vec<BoundaryVote> {
        let ensemble = &self.config.ensemble;
        let mut sources = vec![BoundaryVote {
            source: "embedding_drift",
            votes: ensemble.drift_votes,
            candidates: signals.drift.changepoints.clone(),
        }];
        if let Some(topics) = &signals.topics {
            sources.push(BoundaryVote {
                source: "topic_transition",
                votes: ensemble.topic_votes,
                candidates: topics.boundaries(),
            });
        }
        if let Some(relevance) = &signals.relevance {
            sources.push(BoundaryVote {
                source: "llm_break",
                votes: ensemble.llm_votes,
                candidates: relevance.breaks(),
            });
        }
        sources
    }

    /// Composite score recomputed over one span only.
    fn span_score(&self, signals: &Signals, start: usize, end: usize) -> f64 {
        let drift = self.drift.analyze(&signals.embeddings[start..=end]).score;

        let (entropy, transition) = match &signals.topics {
            Some(topics) if end > start => {
                let span = &topics.assignments[start..=end];
                let (entropy, _) = distribution_stats(span, topics.num_topics);
                (
                    Some(entropy),
                    Some((transition_rate(span) * 2.0).clamp(0.0, 1.0)),
                )
            }
            _ => (None, None),
        };

        let relevance = signals
            .relevance
            .as_ref()
            .and_then(|r| r.mean_in_span(start, end))
            .map(|mean| (1.0 - mean / 10.0).clamp(0.0, 1.0));

        let weights = self.weights(signals.relevance.is_some());
        composite_score(&components(weights, Some(drift), entropy, transition, relevance))
    }

    fn topic_label(&self, messages: &[Message], topics: Option<&TopicAnalysis>, start: usize, end: usize) -> String {
        if let Some(label) = topics.and_then(|t| t.dominant_label(start, end)) {
            return label.to_string();
        }

        let texts: Vec<&str> = messages[start..=end].iter().map(|m| m.content.as_str()).collect();
        terms::join_label(&terms::top_terms(&texts, self.config.topics.label_terms.max(1)))
            .unwrap_or_else(|| DEFAULT_TOPIC_LABEL.to_string())
    }

    async fn summarize(&self, span: &[Message], options: &AnalyzeOptions) -> String {
        if options.generate_summaries && self.llm.is_available() {
            let prompt = segment_summary_prompt(span, SUMMARY_WORDS);
            let completion_options = CompletionOptions {
                temperature: Some(0.2),
                max_tokens: Some(120),
                stop: None,
            };
            let result = tokio::time::timeout(
                self.llm.call_timeout(),
                self.llm.complete(&prompt, Some(&completion_options)),
            )
            .await;

            match result {
                Ok(Ok(summary)) if !summary.trim().is_empty() => return summary.trim().to_string(),
                Ok(Err(err)) => tracing::debug!(error = %err, "Segment summary failed"),
                Err(_) => tracing::debug!("Segment summary timed out"),
                Ok(Ok(_)) => {}
            }
        }

        fallback_summary(span)
    }

    async fn build_segments(
        &self,
        conversation: &Conversation,
        signals: &Signals,
        boundaries: &[usize],
        options: &AnalyzeOptions,
    ) -> Vec<Segment> {
        let messages = &conversation.messages;
        let spans = spans(boundaries, messages.len());
        let anchors: Vec<Vec<f32>> = spans
            .iter()
            .map(|&(start, end)| mean_vector(&signals.embeddings[start..=end]))
            .collect();
        let ids: Vec<String> = spans.iter().map(|_| nanoid!()).collect();
        let parents = parent_indices(&anchors);
        let created_at = Utc::now();

        let mut segments = Vec::with_capacity(spans.len());
        for (i, (&(start, end), anchor)) in spans.iter().zip(anchors).enumerate() {
            segments.push(Segment {
                id: ids[i].clone(),
                conversation_id: conversation.id.clone(),
                start_index: start,
                end_index: end,
                anchor_embedding: anchor,
                embedding_model: self.embedding_model().to_string(),
                topic_label: self.topic_label(messages, signals.topics.as_ref(), start, end),
                summary: self.summarize(&messages[start..=end], options).await,
                parent_segment_id: parents[i].map(|p| ids[p].clone()),
                divergence_score: self.span_score(signals, start, end),
                created_at,
            });
        }
        segments
    }

    async fn assemble(
        &self,
        conversation: &Conversation,
        signals: Signals,
        options: &AnalyzeOptions,
    ) -> Result<DivergenceReport> {
        let n = conversation.messages.len();
        let ensemble = &self.config.ensemble;

        let drift_score = Some(signals.drift.score);
        let entropy_score = signals.topics.as_ref().map(TopicAnalysis::entropy_score);
        let transition_score = signals.topics.as_ref().map(TopicAnalysis::transition_score);
        let relevance_score = signals.relevance.as_ref().and_then(RelevanceAnalysis::score);

        let weights = self.weights(relevance_score.is_some());
        let overall_score = composite_score(&components(
            weights,
            drift_score,
            entropy_score,
            transition_score,
            relevance_score,
        ));

        let boundaries = confirm_boundaries(&self.boundary_votes(&signals), n, ensemble);
        let segments = self
            .build_segments(conversation, &signals, &boundaries, options)
            .await;

        let mut return_points = signals.drift.returns.clone();
        if let Some(relevance) = &signals.relevance {
            return_points.extend(relevance.returns());
        }
        return_points.sort_unstable();
        return_points.dedup();

        let metrics = DivergenceMetrics {
            max_drift: signals.drift.max_drift,
            mean_drift: signals.drift.mean_drift,
            drift_velocity: signals.drift.drift_velocity,
            final_drift: signals.drift.final_drift,
            return_count: signals.drift.return_count(),
            num_topics: signals.topics.as_ref().map(|t| t.num_topics),
            topic_entropy: signals.topics.as_ref().map(|t| t.entropy),
            transition_rate: signals.topics.as_ref().map(|t| t.transition_rate),
            dominant_topic_ratio: signals.topics.as_ref().map(|t| t.dominant_topic_ratio),
            mean_relevance: signals.relevance.as_ref().and_then(|r| r.mean_relevance),
            branch_count: signals.relevance.as_ref().map_or(0, |r| r.branch_count),
            unknown_relevance_count: signals.relevance.as_ref().map_or(0, |r| r.unknown_count),
        };

        let should_split =
            overall_score > ensemble.split_threshold || boundaries.len() > ensemble.max_boundaries;

        tracing::info!(
            conversation_id = %conversation.id,
            overall_score,
            boundaries = boundaries.len(),
            should_split,
            "Divergence computed"
        );

        Ok(DivergenceReport {
            conversation_id: conversation.id.clone(),
            overall_score,
            embedding_drift_score: drift_score,
            topic_entropy_score: entropy_score,
            topic_transition_score: transition_score,
            llm_relevance_score: relevance_score,
            metrics,
            num_segments: segments.len(),
            segments,
            should_split,
            suggested_split_points: boundaries,
            return_points,
            interpretation: ScoreBand::from_score(overall_score).describe().to_string(),
            embedding_model: self.embedding_model().to_string(),
            computed_at: Utc::now(),
        })
    }

    /// No messages, so no segments: segments cover exactly the message
    /// indices that exist.
    fn empty_report(&self, conversation: &Conversation) -> DivergenceReport {
        DivergenceReport {
            conversation_id: conversation.id.clone(),
            overall_score: 0.0,
            embedding_drift_score: None,
            topic_entropy_score: None,
            topic_transition_score: None,
            llm_relevance_score: None,
            metrics: DivergenceMetrics::default(),
            segments: Vec::new(),
            num_segments: 0,
            should_split: false,
            suggested_split_points: Vec::new(),
            return_points: Vec::new(),
            interpretation: ScoreBand::Focused.describe().to_string(),
            embedding_model: self.embedding_model().to_string(),
            computed_at: Utc::now(),
        }
    }

    /// Conversations shorter than the anchor window: one segment, no drift.
    fn trivial_report(&self, conversation: &Conversation, embeddings: &[Vec<f32>]) -> DivergenceReport {
        let messages = &conversation.messages;
        let end = messages.len() - 1;
        let now = Utc::now();

        let segment = Segment {
            id: nanoid!(),
            conversation_id: conversation.id.clone(),
            start_index: 0,
            end_index: end,
            anchor_embedding: mean_vector(embeddings),
            embedding_model: self.embedding_model().to_string(),
            topic_label: self.topic_label(messages, None, 0, end),
            summary: fallback_summary(messages),
            parent_segment_id: None,
            divergence_score: 0.0,
            created_at: now,
        };

        DivergenceReport {
            embedding_drift_score: Some(0.0),
            segments: vec![segment],
            num_segments: 1,
            computed_at: now,
            ..self.empty_report(conversation)
        }
    }
}
