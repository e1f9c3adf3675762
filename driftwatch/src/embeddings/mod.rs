mod api;
mod provider;

#[cfg(test)]
mod tests;

pub use api::EmbeddingApiClient;
pub use provider::{Embedder, EmbeddingProvider};
