pub mod conversations;
pub mod divergence;
pub(crate) mod health;
pub mod queue;

pub use health::health_check;
