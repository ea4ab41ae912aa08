use crate::core::element::Status;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Load error: {0}")]
    Load(String),
    #[error("Classify error: {0}")]
    Classify(String),
    #[error("Classifier timed out after {0} ms")]
    Timeout(u64),
    #[error("Image too small: {width}x{height}")]
    TooSmall { width: u32, height: u32 },
    #[error("Config error: {0}")]
    Config(String),
    #[error("Stale result for round {stale}, element is at round {current}")]
    StaleRound { stale: u64, current: u64 },
    #[error("Status regression {from:?} -> {to:?}")]
    Regression { from: Status, to: Status },
    #[error("Element {0} is no longer attached")]
    UnknownElement(u64),
}

impl From<image::ImageError> for PipelineError {
    fn from(e: image::ImageError) -> Self {
        PipelineError::Load(format!("decode failed: {}", e))
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(e: reqwest::Error) -> Self {
        PipelineError::Load(format!("fetch failed: {}", e))
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::Load(format!("read failed: {}", e))
    }
}

impl From<json5::Error> for PipelineError {
    fn from(e: json5::Error) -> Self {
        PipelineError::Config(e.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        PipelineError::Config(e.to_string())
    }
}
