//! JEM training pipeline: in-memory image batches, the p(x) / p(y|x) losses,
//! metrics with health checks, and the Adam training loop.

pub mod data;
pub mod loss;
pub mod metrics;
pub mod trainer;
