//! 分类执行上下文
//!
//! 视频帧同一时刻只接受一帧；忙的时候直接回 `Skipped`，不排队。
//! 图片走有限的许可数，和检测队列共用同一个上限。

use crate::core::classifier::{ClassifierFusion, FrameSource};
use crate::core::element::{Dimensions, ElementId, Verdict};
use crate::core::error::PipelineError;
use crate::core::media::{Frame, MediaLoader, ResizeLimits};
use crate::core::settings::SettingsHandle;
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Upper bound for one video frame classification.
    pub frame_timeout: Duration,
    /// Images classified at the same time, across the queue and host requests.
    pub image_permits: usize,
    pub min_image: Dimensions,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            frame_timeout: Duration::from_secs(2),
            image_permits: 4,
            min_image: Dimensions::new(64, 64),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrameOutcome {
    Classified { verdict: Verdict, timestamp: Duration },
    /// Another frame was in flight.
    Skipped,
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct ClassificationWorker {
    fusion: Arc<ClassifierFusion>,
    loader: Arc<dyn MediaLoader>,
    settings: SettingsHandle,
    config: WorkerConfig,
    image_slots: Semaphore,
    busy: AtomicBool,
}

impl ClassificationWorker {
    pub fn new(
        fusion: Arc<ClassifierFusion>,
        loader: Arc<dyn MediaLoader>,
        settings: SettingsHandle,
        config: WorkerConfig,
    ) -> Self {
        let image_slots = Semaphore::new(config.image_permits.max(1));
        Self {
            fusion,
            loader,
            settings,
            config,
            image_slots,
            busy: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// One-shot image classification on an already decoded frame.
    pub async fn classify_image(&self, frame: Frame) -> Result<Verdict, PipelineError> {
        let size = Dimensions::new(frame.width, frame.height);
        if size.is_below(self.config.min_image) {
            return Err(PipelineError::TooSmall {
                width: size.width,
                height: size.height,
            });
        }

        let _permit = self
            .image_slots
            .acquire()
            .await
            .map_err(|e| PipelineError::Classify(e.to_string()))?;
        let frame = frame.fit_within(ResizeLimits::IMAGE)?;
        let settings = self.settings.current();
        self.fusion
            .try_classify(frame, &settings, FrameSource::Image)
            .await
    }

    /// Loads `source` first, for requests that only carry a URL.
    pub async fn classify_image_source(&self, source: &str) -> Result<Verdict, PipelineError> {
        let frame = self.loader.load_image(source).await?;
        self.classify_image(frame).await
    }

    /// Single-flight classification of a frame the host pushed without an element.
    pub async fn classify_frame(&self, frame: Frame) -> Result<FrameOutcome, PipelineError> {
        self.classify_stream_frame(None, frame).await
    }

    /// Same as `classify_frame`, for a frame sampled from video element `id`.
    pub async fn classify_video_frame(
        &self,
        id: ElementId,
        frame: Frame,
    ) -> Result<FrameOutcome, PipelineError> {
        self.classify_stream_frame(Some(id), frame).await
    }

    /// The video is no longer sampled; its cached results go too.
    pub fn forget_stream(&self, id: ElementId) {
        self.fusion.forget_stream(id);
    }

    async fn classify_stream_frame(
        &self,
        stream: Option<ElementId>,
        frame: Frame,
    ) -> Result<FrameOutcome, PipelineError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("⏭️ classifier busy, frame at {:?} skipped", frame.timestamp);
            return Ok(FrameOutcome::Skipped);
        }
        let _guard = InFlight(&self.busy);

        let timestamp = frame.timestamp;
        let frame = frame.fit_within(ResizeLimits::VIDEO)?;
        let settings = self.settings.current();
        let timeout = self.config.frame_timeout;

        let verdict = tokio::time::timeout(
            timeout,
            self.fusion
                .try_classify(frame, &settings, FrameSource::Video(stream)),
        )
        .await
        .map_err(|_| PipelineError::Timeout(timeout.as_millis() as u64))??;

        Ok(FrameOutcome::Classified { verdict, timestamp })
    }
}
