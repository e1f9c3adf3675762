mod common;
mod conversation;
mod queue;
mod report;
mod segment;
mod stats;

pub use common::*;
pub use conversation::*;
pub use queue::*;
pub use report::*;
pub use segment::*;
pub use stats::*;
