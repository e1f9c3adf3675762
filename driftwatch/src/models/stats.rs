use serde::{Deserialize, Serialize};

use super::QueueStats;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackfillStats {
    pub processed: u64,
    pub failed: u64,
    pub skipped: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DivergenceStats {
    pub total_conversations: u64,
    pub analyzed_conversations: u64,
    pub high_divergence: u64,
    pub should_split: u64,
    pub average_score: Option<f64>,
    pub total_segments: u64,
    pub total_links: u64,
    /// Segments whose anchor was produced by a different embedding model.
    pub stale_segments: u64,
    pub queue: QueueStats,
}
