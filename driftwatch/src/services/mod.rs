mod divergence;

pub use divergence::{BackfillOptions, ComputeOptions, DivergenceService};
