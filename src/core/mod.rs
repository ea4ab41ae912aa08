pub mod classifier;
pub mod discovery;
pub mod element;
pub mod error;
pub mod media;
pub mod pipeline;
pub mod presentation;
pub mod queue;
pub mod settings;
pub mod video;
pub mod worker;

pub use error::PipelineError;
pub use pipeline::{Pipeline, PipelineConfig};
