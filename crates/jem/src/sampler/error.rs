/// Errors raised by the replay buffers and the SGLD sampler.
#[derive(Debug, thiserror::Error)]
pub enum SamplerError {
    /// Tried to draw from a buffer with no entries.
    #[error("cannot sample from an empty replay buffer")]
    EmptyBuffer,

    /// Class id outside `[0, num_classes)`.
    #[error("class {class} out of range (num_classes = {num_classes})")]
    ClassOutOfRange { class: usize, num_classes: usize },

    /// Conditional labels must cover the whole batch.
    #[error("expected {expected} labels, got {got}")]
    LabelCount { expected: usize, got: usize },

    /// A tensor did not have the shape the sampler expected.
    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },

    /// Model parameters live on a different device than the sampler.
    #[error("device mismatch: sampler on {expected}, model on {got}")]
    DeviceMismatch { expected: String, got: String },

    /// Every binomial draw for the fresh-noise count came back zero.
    #[error("no fresh samples after {attempts} binomial draws; fresh_ratio too small")]
    NoFreshSamples { attempts: usize },

    /// NaN or Inf appeared in the Langevin state.
    #[error("SGLD diverged at step {step}: non-finite values in state")]
    Diverged { step: usize },

    /// Precondition violated by a configuration value or call argument.
    #[error("invalid sampler configuration: {0}")]
    InvalidConfig(String),
}
