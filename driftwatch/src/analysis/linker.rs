use std::collections::HashMap;

use chrono::{DateTime, Utc};
use nanoid::nanoid;

use crate::config::LinkerConfig;
use crate::models::{LinkType, Metadata, RelatedConversation, Segment, SegmentAnchor, SegmentLink};

use super::math::cosine_similarity;

/// Brute-force nearest-neighbour linker over persisted segment anchors.
///
/// Callers pass anchors of the same embedding model and dimension; vectors
/// of other lengths simply never match.
#[derive(Debug, Clone)]
pub struct CrossChatLinker {
    config: LinkerConfig,
}

impl CrossChatLinker {
    pub fn new(config: LinkerConfig) -> Self {
        Self { config }
    }

    fn link_type(
        &self,
        source: &Segment,
        source_created_at: DateTime<Utc>,
        target: &SegmentAnchor,
        similarity: f64,
    ) -> LinkType {
        if target.conversation_created_at < source_created_at
            && similarity >= self.config.continues_threshold
        {
            LinkType::Continues
        } else if source.divergence_score > self.config.branch_divergence {
            LinkType::BranchesFrom
        } else {
            LinkType::References
        }
    }

    /// Ranked neighbours of one anchor above `floor`, best first.
    fn neighbours<'a>(
        &self,
        conversation_id: &str,
        embedding: &[f32],
        anchors: &'a [SegmentAnchor],
        floor: f64,
    ) -> Vec<(&'a SegmentAnchor, f64)> {
        let mut matches: Vec<(&SegmentAnchor, f64)> = anchors
            .iter()
            .filter(|a| a.conversation_id != conversation_id)
            .map(|a| (a, cosine_similarity(embedding, &a.embedding)))
            .filter(|(_, sim)| *sim >= floor)
            .collect();

        matches.sort_by(|a, b| {
            b.1.total_cmp(&a.1)
                .then_with(|| a.0.segment_id.cmp(&b.0.segment_id))
        });
        matches
    }

    /// Links from each of the conversation's segments to similar segments
    /// of other conversations.
    pub fn link_segments(
        &self,
        conversation_created_at: DateTime<Utc>,
        segments: &[Segment],
        anchors: &[SegmentAnchor],
    ) -> Vec<SegmentLink> {
        let now = Utc::now();
        let mut links = Vec::new();

        for segment in segments {
            if segment.anchor_embedding.is_empty() {
                continue;
            }

            let neighbours = self.neighbours(
                &segment.conversation_id,
                &segment.anchor_embedding,
                anchors,
                self.config.similarity_floor,
            );

            for (rank, (target, similarity)) in neighbours
                .into_iter()
                .take(self.config.max_links_per_segment)
                .enumerate()
            {
                let mut metadata = Metadata::new();
                metadata.insert("rank".to_string(), serde_json::json!(rank + 1));
                metadata.insert(
                    "target_conversation_id".to_string(),
                    serde_json::json!(target.conversation_id),
                );

                links.push(SegmentLink {
                    id: nanoid!(),
                    source_segment_id: segment.id.clone(),
                    target_segment_id: target.segment_id.clone(),
                    link_type: self.link_type(segment, conversation_created_at, target, similarity),
                    similarity_score: similarity,
                    metadata,
                    created_at: now,
                });
            }
        }

        links
    }

    /// Other conversations ranked by their best segment-to-segment
    /// similarity. Never includes the conversation itself.
    pub fn related_conversations(
        &self,
        conversation_id: &str,
        segments: &[Segment],
        anchors: &[SegmentAnchor],
        min_similarity: f64,
        limit: usize,
    ) -> Vec<RelatedConversation> {
        let mut best: HashMap<&str, f64> = HashMap::new();

        for segment in segments.iter().filter(|s| !s.anchor_embedding.is_empty()) {
            for (anchor, similarity) in
                self.neighbours(conversation_id, &segment.anchor_embedding, anchors, min_similarity)
            {
                let entry = best.entry(anchor.conversation_id.as_str()).or_insert(similarity);
                if similarity > *entry {
                    *entry = similarity;
                }
            }
        }

        let mut related: Vec<RelatedConversation> = best
            .into_iter()
            .map(|(id, similarity)| RelatedConversation {
                conversation_id: id.to_string(),
                similarity,
            })
            .collect();
        related.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| a.conversation_id.cmp(&b.conversation_id))
        });
        related.truncate(limit);
        related
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn segment(id: &str, conversation: &str, embedding: Vec<f32>, divergence: f64) -> Segment {
        Segment {
            id: id.to_string(),
            conversation_id: conversation.to_string(),
            start_index: 0,
            end_index: 3,
            anchor_embedding: embedding,
            embedding_model: "test".to_string(),
            topic_label: String::new(),
            summary: String::new(),
            parent_segment_id: None,
            divergence_score: divergence,
            created_at: Utc::now(),
        }
    }

    fn anchor(id: &str, conversation: &str, embedding: Vec<f32>, age_days: i64) -> SegmentAnchor {
        SegmentAnchor {
            segment_id: id.to_string(),
            conversation_id: conversation.to_string(),
            conversation_created_at: Utc::now() - Duration::days(age_days),
            divergence_score: 0.0,
            embedding,
        }
    }

    #[test]
    fn test_link_types() {
        let linker = CrossChatLinker::new(LinkerConfig::default());
        let now = Utc::now();
        let anchors = vec![
            anchor("older-close", "a", vec![1.0, 0.0], 5),
            anchor("newer-close", "b", vec![1.0, 0.05], -5),
            anchor("far", "c", vec![0.0, 1.0], 5),
            anchor("own", "me", vec![1.0, 0.0], 5),
        ];

        let links = linker.link_segments(now, &[segment("s1", "me", vec![1.0, 0.0], 0.2)], &anchors);
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].target_segment_id, "older-close");
        assert_eq!(links[0].link_type, LinkType::Continues);
        assert_eq!(links[1].target_segment_id, "newer-close");
        assert_eq!(links[1].link_type, LinkType::References);

        let branching = linker.link_segments(now, &[segment("s2", "me", vec![1.0, 0.05], 0.7)], &anchors[1..2]);
        assert_eq!(branching[0].link_type, LinkType::BranchesFrom);
    }

    #[test]
    fn test_links_are_capped_per_segment() {
        let linker = CrossChatLinker::new(LinkerConfig::default());
        let anchors: Vec<SegmentAnchor> = (0..9)
            .map(|i| anchor(&format!("t{i}"), &format!("c{i}"), vec![1.0, 0.01 * i as f32], 1))
            .collect();
        let links = linker.link_segments(Utc::now(), &[segment("s", "me", vec![1.0, 0.0], 0.0)], &anchors);
        assert_eq!(links.len(), 5);
        assert!(links.windows(2).all(|w| w[0].similarity_score >= w[1].similarity_score));
    }

    #[test]
    fn test_related_excludes_self_and_sorts() {
        let linker = CrossChatLinker::new(LinkerConfig::default());
        let segments = vec![
            segment("s1", "me", vec![1.0, 0.0], 0.0),
            segment("s2", "me", vec![0.0, 1.0], 0.0),
        ];
        let anchors = vec![
            anchor("x1", "x", vec![0.7, 0.7], 1),
            anchor("y1", "y", vec![0.0, 1.0], 1),
            anchor("y2", "y", vec![0.6, 0.8], 1),
            anchor("me1", "me", vec![1.0, 0.0], 1),
        ];

        let related = linker.related_conversations("me", &segments, &anchors, 0.5, 10);
        let ids: Vec<&str> = related.iter().map(|r| r.conversation_id.as_str()).collect();
        assert_eq!(ids, vec!["y", "x"]);
        assert!((related[0].similarity - 1.0).abs() < 1e-6);

        let limited = linker.related_conversations("me", &segments, &anchors, 0.5, 1);
        assert_eq!(limited.len(), 1);
    }
}
