//! Divergence analysis: drift, topics, relevance, ensemble voting and
//! cross-conversation linking.

pub mod drift;
pub mod ensemble;
pub mod linker;
pub mod math;
pub mod relevance;
pub mod terms;
pub mod topics;

pub use drift::{DriftAnalysis, DriftAnalyzer};
pub use ensemble::{AnalyzeOptions, EnsembleSegmenter};
pub use linker::CrossChatLinker;
pub use relevance::{MessageJudgement, RelevanceAnalysis, RelevanceJudge};
pub use topics::{TopicAnalysis, TopicAnalyzer};
