use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{LinkType, Metadata};

/// A contiguous, inclusive span `[start_index, end_index]` of one conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Segment {
    pub id: String,
    pub conversation_id: String,
    pub start_index: usize,
    pub end_index: usize,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub anchor_embedding: Vec<f32>,
    pub embedding_model: String,
    pub topic_label: String,
    pub summary: String,
    pub parent_segment_id: Option<String>,
    pub divergence_score: f64,
    pub created_at: DateTime<Utc>,
}

impl Segment {
    pub fn message_count(&self) -> usize {
        self.end_index + 1 - self.start_index
    }

    pub fn contains(&self, index: usize) -> bool {
        (self.start_index..=self.end_index).contains(&index)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SegmentLink {
    pub id: String,
    pub source_segment_id: String,
    pub target_segment_id: String,
    pub link_type: LinkType,
    pub similarity_score: f64,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

/// A persisted anchor considered by the cross-conversation linker.
#[derive(Debug, Clone)]
pub struct SegmentAnchor {
    pub segment_id: String,
    pub conversation_id: String,
    pub conversation_created_at: DateTime<Utc>,
    pub divergence_score: f64,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RelatedConversation {
    pub conversation_id: String,
    pub similarity: f64,
}
