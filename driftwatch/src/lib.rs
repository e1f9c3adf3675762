//! Topic-divergence detection and conversation segmentation.
//!
//! Conversations are embedded message by message, scored by several
//! independent analyzers (embedding drift, topic clustering and an optional
//! LLM relevance judge), split into segments where the analyzers agree, and
//! linked to segments of other conversations.

pub mod analysis;
pub mod api;
pub mod config;
pub mod db;
pub mod embeddings;
pub mod error;
pub mod llm;
pub mod models;
pub mod processing;
pub mod services;
