//! JEM model components: the scoring trait, the reference ShallowCnn, and
//! the host/tensor image bridge.

pub mod bridge;
pub mod energy;
pub mod shallow_cnn;
