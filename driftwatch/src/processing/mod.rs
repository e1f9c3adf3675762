mod hooks;
mod pipeline;
mod worker;

pub use hooks::IngestionHooks;
pub use pipeline::{DivergencePipeline, ProcessOutcome};
pub use worker::BackgroundProcessor;
