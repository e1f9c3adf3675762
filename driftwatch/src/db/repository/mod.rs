use chrono::{DateTime, SecondsFormat, Utc};

mod conversations;
mod links;
mod queue;
mod reports;
mod segments;

pub use conversations::ConversationRepository;
pub use links::LinkRepository;
pub use queue::QueueRepository;
pub use reports::{ReportAggregates, ReportRepository};
pub use segments::SegmentRepository;

/// Fixed-width UTC timestamps so lexical order in SQL matches time order.
pub(crate) fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub(crate) fn parse_ts_opt(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|value| DateTime::parse_from_rfc3339(&value).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

pub(crate) fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub(crate) fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedding_blob_layout() {
        let bytes = encode_embedding(&[1.0, -0.5]);
        assert_eq!(bytes.len(), 8);
        assert_eq!(decode_embedding(&bytes), vec![1.0, -0.5]);
        assert!(decode_embedding(&[]).is_empty());
    }

    #[test]
    fn test_timestamps_sort_lexically() {
        let earlier = parse_ts("2024-05-01T10:00:00Z");
        let later = parse_ts("2024-05-01T10:00:00.5Z");
        assert!(format_ts(&earlier) < format_ts(&later));
        assert_eq!(parse_ts(&format_ts(&later)), later);
    }
}
