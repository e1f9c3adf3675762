use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Segment;

/// Raw per-analyzer measurements behind the component scores.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DivergenceMetrics {
    pub max_drift: f64,
    pub mean_drift: f64,
    pub drift_velocity: f64,
    pub final_drift: f64,
    pub return_count: usize,
    pub num_topics: Option<usize>,
    pub topic_entropy: Option<f64>,
    pub transition_rate: Option<f64>,
    pub dominant_topic_ratio: Option<f64>,
    pub mean_relevance: Option<f64>,
    pub branch_count: usize,
    pub unknown_relevance_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DivergenceReport {
    pub conversation_id: String,
    pub overall_score: f64,
    pub embedding_drift_score: Option<f64>,
    pub topic_entropy_score: Option<f64>,
    pub topic_transition_score: Option<f64>,
    pub llm_relevance_score: Option<f64>,
    pub metrics: DivergenceMetrics,
    pub segments: Vec<Segment>,
    pub num_segments: usize,
    pub should_split: bool,
    pub suggested_split_points: Vec<usize>,
    pub return_points: Vec<usize>,
    pub interpretation: String,
    pub embedding_model: String,
    pub computed_at: DateTime<Utc>,
}

/// Report row without its segments, as listed by summary queries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReportSummary {
    pub conversation_id: String,
    pub overall_score: f64,
    pub num_segments: usize,
    pub should_split: bool,
    pub interpretation: String,
    pub computed_at: DateTime<Utc>,
}
