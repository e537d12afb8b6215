//! Joint Energy-Based Model (JEM) for small image classifiers.
//!
//! A classifier's logits double as an unnormalized density over images:
//! `log p(x) ∝ logsumexp_y f(x)[y]`. This crate provides the reference
//! ShallowCnn, a short-run SGLD sampler with persistent per-class replay
//! buffers, the contrastive-divergence + cross-entropy training loop, and a
//! scorer for out-of-distribution analysis.

pub mod inference;
pub mod model;
pub mod sampler;
pub mod training;

pub use inference::{auprc, auroc, JemScorer};
pub use model::energy::EnergyModel;
pub use model::shallow_cnn::{ShallowCnn, ShallowCnnConfig};
pub use sampler::{SamplerConfig, SamplerError, SgldSampler};
pub use training::trainer::JemTrainingConfig;
