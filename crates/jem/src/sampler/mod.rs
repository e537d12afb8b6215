//! Short-run SGLD sampling with persistent replay buffers.

pub mod buffer;
pub mod error;
pub mod mode;
pub mod sgld;

pub use buffer::{ClassBuffers, ReplayBuffer};
pub use error::SamplerError;
pub use mode::SamplingMode;
pub use sgld::{BufferImage, SamplerConfig, SgldSampler};
