pub mod hysteresis;
pub mod sampler;

pub use hysteresis::{HysteresisConfig, HysteresisState, ObstructionAction};
pub use sampler::{SamplerConfig, VideoSampler};
