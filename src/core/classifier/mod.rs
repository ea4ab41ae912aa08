//! 分类器接口与融合策略
//!
//! 两个外部模型都当作黑盒：NSFW 五分类 + 人脸 / 性别检测。

pub mod fusion;
pub mod mock;
pub mod thresholds;

pub use fusion::{ClassifierFusion, FrameSource, FusionConfig, GenderCutoffs};
pub use mock::{MockFaceClassifier, MockNsfwClassifier};
pub use thresholds::{contains_nsfw, ClassThreshold};

use crate::core::error::PipelineError;
use crate::core::media::Frame;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NsfwClass {
    Drawing,
    Hentai,
    Neutral,
    Porn,
    Sexy,
}

impl NsfwClass {
    pub const ALL: [NsfwClass; 5] = [
        NsfwClass::Drawing,
        NsfwClass::Hentai,
        NsfwClass::Neutral,
        NsfwClass::Porn,
        NsfwClass::Sexy,
    ];

    /// Output index in the model's logits.
    pub fn from_index(index: usize) -> Option<NsfwClass> {
        Self::ALL.get(index).copied()
    }

    pub fn is_unsafe(self) -> bool {
        matches!(self, NsfwClass::Hentai | NsfwClass::Porn | NsfwClass::Sexy)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassPrediction {
    pub class: NsfwClass,
    pub probability: f32,
}

impl ClassPrediction {
    pub fn new(class: NsfwClass, probability: f32) -> Self {
        Self { class, probability }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceDetection {
    pub gender: Gender,
    /// Confidence of `gender`, 0.0 - 1.0.
    pub gender_score: f32,
    pub age: f32,
}

impl FaceDetection {
    pub fn new(gender: Gender, gender_score: f32, age: f32) -> Self {
        Self {
            gender,
            gender_score,
            age,
        }
    }
}

#[async_trait]
pub trait NsfwClassifier: Send + Sync {
    async fn classify_nsfw(&self, frame: &Frame) -> Result<Vec<ClassPrediction>, PipelineError>;
}

#[async_trait]
pub trait FaceClassifier: Send + Sync {
    async fn classify_faces(&self, frame: &Frame) -> Result<Vec<FaceDetection>, PipelineError>;
}

/// Keeps the `k` most probable classes, highest first.
pub fn top_k(mut predictions: Vec<ClassPrediction>, k: usize) -> Vec<ClassPrediction> {
    predictions.sort_by(|a, b| b.probability.total_cmp(&a.probability));
    predictions.truncate(k);
    predictions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_top_k() {
        let preds = vec![
            ClassPrediction::new(NsfwClass::Drawing, 0.05),
            ClassPrediction::new(NsfwClass::Neutral, 0.6),
            ClassPrediction::new(NsfwClass::Porn, 0.2),
            ClassPrediction::new(NsfwClass::Sexy, 0.1),
            ClassPrediction::new(NsfwClass::Hentai, 0.05),
        ];
        let top = top_k(preds, 3);
        let classes: Vec<_> = top.iter().map(|p| p.class).collect();
        assert_eq!(classes, vec![NsfwClass::Neutral, NsfwClass::Porn, NsfwClass::Sexy]);
    }

    #[test]
    fn test_class_index() {
        assert_eq!(NsfwClass::from_index(3), Some(NsfwClass::Porn));
        assert_eq!(NsfwClass::from_index(5), None);
        assert!(!NsfwClass::Drawing.is_unsafe());
        assert!(NsfwClass::Sexy.is_unsafe());
    }
}
