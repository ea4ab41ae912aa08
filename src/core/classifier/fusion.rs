use super::thresholds::contains_nsfw;
use super::{top_k, ClassPrediction, FaceClassifier, FaceDetection, Gender, NsfwClassifier};
use crate::core::element::{ElementId, Verdict};
use crate::core::error::PipelineError;
use crate::core::media::{Frame, FrameDiffFilter};
use crate::core::settings::SettingsSnapshot;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// 性别判定的置信度分界，可调
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenderCutoffs {
    /// Faces at or below this estimated age never count.
    pub min_age: f32,
    pub male_confident: f32,
    pub female_confident: f32,
    /// Below this, a face labelled with the other gender is taken as uncertain.
    pub uncertain: f32,
}

impl Default for GenderCutoffs {
    fn default() -> Self {
        Self {
            min_age: 20.0,
            male_confident: 0.3,
            female_confident: 0.25,
            uncertain: 0.2,
        }
    }
}

impl GenderCutoffs {
    fn matches_male(&self, face: &FaceDetection) -> bool {
        match face.gender {
            Gender::Male => face.gender_score > self.male_confident,
            Gender::Female => face.gender_score < self.uncertain,
            Gender::Unknown => false,
        }
    }

    fn matches_female(&self, face: &FaceDetection) -> bool {
        match face.gender {
            Gender::Female => face.gender_score > self.female_confident,
            Gender::Male => face.gender_score < self.uncertain,
            Gender::Unknown => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FusionConfig {
    pub cutoffs: GenderCutoffs,
    pub top_k: usize,
    /// 视频帧放宽阈值，减少闪烁
    pub video_strictness_scale: f32,
    /// Frame difference below which video frames reuse the last NSFW result. 0 disables the cache.
    pub cache_sensitivity: f32,
    pub cache_max_age: Duration,
    pub cache_max_skips: u32,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            cutoffs: GenderCutoffs::default(),
            top_k: 3,
            video_strictness_scale: 0.75,
            cache_sensitivity: 0.10,
            cache_max_age: Duration::from_millis(4000),
            cache_max_skips: 99,
        }
    }
}

/// Where a frame comes from. Video frames of one stream share an NSFW cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameSource {
    Image,
    /// `None` for frames the host pushes without an element.
    Video(Option<ElementId>),
}

struct NsfwCache {
    filter: FrameDiffFilter,
    predictions: Option<Vec<ClassPrediction>>,
    stored_at: Option<Instant>,
    skipped: u32,
}

impl NsfwCache {
    fn new(sensitivity: f32) -> Self {
        Self {
            filter: FrameDiffFilter::with_threshold(sensitivity),
            predictions: None,
            stored_at: None,
            skipped: 0,
        }
    }
}

/// 融合两个模型的输出，得到单帧结论
pub struct ClassifierFusion {
    nsfw: Arc<dyn NsfwClassifier>,
    faces: Arc<dyn FaceClassifier>,
    config: FusionConfig,
    caches: Mutex<HashMap<Option<ElementId>, NsfwCache>>,
}

impl ClassifierFusion {
    pub fn new(nsfw: Arc<dyn NsfwClassifier>, faces: Arc<dyn FaceClassifier>) -> Self {
        Self::with_config(nsfw, faces, FusionConfig::default())
    }

    pub fn with_config(
        nsfw: Arc<dyn NsfwClassifier>,
        faces: Arc<dyn FaceClassifier>,
        config: FusionConfig,
    ) -> Self {
        Self {
            nsfw,
            faces,
            config,
            caches: Mutex::new(HashMap::new()),
        }
    }

    fn caches(&self) -> MutexGuard<'_, HashMap<Option<ElementId>, NsfwCache>> {
        self.caches.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Drops the cached NSFW result of a video that is no longer sampled.
    pub fn forget_stream(&self, id: ElementId) {
        self.caches().remove(&Some(id));
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// Classifies one frame. Takes the frame by value; its buffer is released on every exit.
    /// Classifier failures become `Verdict::Error`.
    pub async fn classify(&self, frame: Frame, settings: &SettingsSnapshot, source: FrameSource) -> Verdict {
        match self.try_classify(frame, settings, source).await {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!("⚠️ classification failed: {}", e);
                Verdict::Error
            }
        }
    }

    pub async fn try_classify(
        &self,
        frame: Frame,
        settings: &SettingsSnapshot,
        source: FrameSource,
    ) -> Result<Verdict, PipelineError> {
        if !settings.should_detect() {
            return Ok(Verdict::Clear);
        }

        let mut strictness = settings.effective_strictness();
        if let FrameSource::Video(_) = source {
            strictness *= self.config.video_strictness_scale;
        }

        let predictions = self.nsfw_predictions(&frame, source).await?;
        if self.evaluate_nsfw(&predictions, strictness) {
            debug!("nsfw: {:?}", predictions);
            return Ok(Verdict::Nsfw);
        }

        // 性别开关都关了就不跑人脸模型
        if !settings.should_detect_gender() {
            return Ok(Verdict::Clear);
        }

        let faces = self.faces.classify_faces(&frame).await?;
        drop(frame);

        if self.contains_gender_face(&faces, settings.detect_male, settings.detect_female) {
            Ok(Verdict::Face)
        } else {
            Ok(Verdict::Clear)
        }
    }

    /// NSFW decision on raw predictions, counting only the top `k` classes.
    pub fn evaluate_nsfw(&self, predictions: &[ClassPrediction], strictness: f32) -> bool {
        let top = top_k(predictions.to_vec(), self.config.top_k);
        contains_nsfw(&top, strictness)
    }

    pub fn contains_gender_face(
        &self,
        faces: &[FaceDetection],
        detect_male: bool,
        detect_female: bool,
    ) -> bool {
        let cutoffs = &self.config.cutoffs;
        faces.iter().filter(|f| f.age > cutoffs.min_age).any(|face| {
            (detect_male && cutoffs.matches_male(face)) || (detect_female && cutoffs.matches_female(face))
        })
    }

    async fn nsfw_predictions(
        &self,
        frame: &Frame,
        source: FrameSource,
    ) -> Result<Vec<ClassPrediction>, PipelineError> {
        let stream = match source {
            FrameSource::Video(stream) if self.config.cache_sensitivity > 0.0 => Some(stream),
            _ => None,
        };
        if let Some(stream) = stream {
            if let Some(cached) = self.cached_predictions(stream, frame) {
                return Ok(cached);
            }
        }

        let predictions = self.nsfw.classify_nsfw(frame).await?;

        if let Some(stream) = stream {
            let sensitivity = self.config.cache_sensitivity;
            let mut caches = self.caches();
            let cache = caches
                .entry(stream)
                .or_insert_with(|| NsfwCache::new(sensitivity));
            cache.predictions = Some(predictions.clone());
            cache.stored_at = Some(Instant::now());
            cache.skipped = 0;
        }
        Ok(predictions)
    }

    /// 画面几乎没变、缓存没过期、跳过次数没超限时复用同一路视频上一次的结果
    fn cached_predictions(
        &self,
        stream: Option<ElementId>,
        frame: &Frame,
    ) -> Option<Vec<ClassPrediction>> {
        let sensitivity = self.config.cache_sensitivity;
        let mut caches = self.caches();
        let cache = caches
            .entry(stream)
            .or_insert_with(|| NsfwCache::new(sensitivity));
        let changed = cache.filter.has_changed(frame);
        let fresh = cache
            .stored_at
            .map(|at| at.elapsed() < self.config.cache_max_age)
            .unwrap_or(false);

        if changed || !fresh || cache.skipped >= self.config.cache_max_skips {
            return None;
        }
        let predictions = cache.predictions.clone()?;
        cache.skipped += 1;
        Some(predictions)
    }
}
