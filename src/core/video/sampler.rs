use super::hysteresis::{HysteresisConfig, HysteresisState, ObstructionAction};
use crate::core::element::{ElementId, ElementRegistry, Status, Verdict};
use crate::core::error::PipelineError;
use crate::core::media::{calc_resize, ResizeLimits, VideoSource};
use crate::core::presentation::Presentation;
use crate::core::settings::SettingsHandle;
use crate::core::worker::{ClassificationWorker, FrameOutcome};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

#[derive(Debug, Clone)]
pub struct SamplerConfig {
    /// Minimum gap between two samples of the same video.
    pub frame_interval: Duration,
    /// Verdicts for frames older than this (against playback position) are dropped.
    pub stale_after: Duration,
    /// Consecutive errors tolerated before the video is given up.
    pub error_budget: u32,
    pub hysteresis: HysteresisConfig,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            frame_interval: Duration::from_millis(1000 / 25),
            stale_after: Duration::from_millis(500),
            error_budget: 3,
            hysteresis: HysteresisConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum SampleOutcome {
    Verdict(Verdict),
    Skipped,
    Stale,
    /// No decoded frame yet.
    NotReady,
}

struct VideoTrack {
    round: u64,
    source: Arc<dyn VideoSource>,
    playing: bool,
    last_sample: Option<Instant>,
    consecutive_errors: u32,
}

/// 视频采样循环
///
/// 分类上下文一次只收一帧，所以每个 tick 只抓一路视频：在播、到了采样间隔、
/// 并且最久没有被采样的那一路。多路视频因此轮流得到分类。
/// 结果经过去抖后再决定是否切换遮挡。
pub struct VideoSampler {
    tracks: Mutex<HashMap<ElementId, VideoTrack>>,
    worker: Arc<ClassificationWorker>,
    registry: Arc<ElementRegistry>,
    presentation: Arc<dyn Presentation>,
    settings: SettingsHandle,
    config: SamplerConfig,
}

impl VideoSampler {
    pub fn new(
        worker: Arc<ClassificationWorker>,
        registry: Arc<ElementRegistry>,
        presentation: Arc<dyn Presentation>,
        settings: SettingsHandle,
        config: SamplerConfig,
    ) -> Self {
        Self {
            tracks: Mutex::new(HashMap::new()),
            worker,
            registry,
            presentation,
            settings,
            config,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ElementId, VideoTrack>> {
        self.tracks.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Starts sampling `id` for `round`. Replaces any previous track.
    pub fn register(&self, id: ElementId, round: u64, source: Arc<dyn VideoSource>) {
        let playing = source.is_playing();
        self.lock().insert(
            id,
            VideoTrack {
                round,
                source,
                playing,
                last_sample: None,
                consecutive_errors: 0,
            },
        );
        debug!("🎬 video {} tracked (round {}, playing: {})", id, round, playing);
    }

    pub fn remove(&self, id: ElementId) -> bool {
        let removed = self.lock().remove(&id).is_some();
        if removed {
            self.worker.forget_stream(id);
        }
        removed
    }

    pub fn clear(&self) {
        let ids: Vec<ElementId> = self.lock().drain().map(|(id, _)| id).collect();
        for id in ids {
            self.worker.forget_stream(id);
        }
    }

    pub fn is_tracking(&self, id: ElementId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 暂停时不采样，收到播放事件后从下一个 tick 继续
    pub fn set_playing(&self, id: ElementId, playing: bool) {
        if let Some(track) = self.lock().get_mut(&id) {
            track.playing = playing;
            if playing {
                track.last_sample = None;
            }
        }
    }

    /// Samples the playing video that has waited longest, if its interval has elapsed.
    /// Returns how many samples ran (0 or 1).
    pub async fn tick(&self) -> usize {
        if !self.settings.current().should_detect_videos() {
            return 0;
        }
        // 上下文正忙，抓了帧也只会被跳过
        if self.worker.is_busy() {
            return 0;
        }

        let now = Instant::now();
        let interval = self.config.frame_interval;
        let next = {
            let mut tracks = self.lock();
            let next = tracks
                .iter_mut()
                .filter(|(_, track)| {
                    track.playing
                        && track
                            .last_sample
                            .map_or(true, |at| now.duration_since(at) >= interval)
                })
                .min_by_key(|(id, track)| (track.last_sample, **id))
                .map(|(id, track)| {
                    track.last_sample = Some(now);
                    (*id, track.round, track.source.clone())
                });
            next
        };
        let Some((id, round, source)) = next else {
            return 0;
        };

        let outcome = sample_once(&self.worker, id, source.as_ref(), self.config.stale_after).await;
        self.apply(id, round, outcome);
        1
    }

    /// Ticks until `shutdown` flips to true or its sender is dropped.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.frame_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("🎬 video sampler started ({:?} per frame)", self.config.frame_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("🎬 video sampler stopped");
    }

    fn apply(&self, id: ElementId, round: u64, outcome: Result<SampleOutcome, PipelineError>) {
        match outcome {
            Ok(SampleOutcome::Verdict(verdict)) => self.apply_verdict(id, round, verdict),
            Ok(other) => debug!("video {} sample ignored: {:?}", id, other),
            Err(e) => self.record_error(id, round, e),
        }
    }

    fn apply_verdict(&self, id: ElementId, round: u64, verdict: Verdict) {
        {
            let mut tracks = self.lock();
            match tracks.get_mut(&id) {
                Some(track) if track.round == round => track.consecutive_errors = 0,
                _ => return,
            }
        }

        let hysteresis = &self.config.hysteresis;
        let action = self.registry.with_element(id, round, |element| {
            let (next, action) = HysteresisState::of(element).transition(verdict, hysteresis);
            next.store(element);
            element.last_verdict = Some(verdict);
            action
        });

        match action {
            Ok(ObstructionAction::Engage) => {
                info!("🙈 video {} obstructed ({:?})", id, verdict);
                self.presentation.on_verdict_changed(id, true);
            }
            Ok(ObstructionAction::Release) => {
                info!("👀 video {} released", id);
                self.presentation.on_verdict_changed(id, false);
            }
            Ok(ObstructionAction::Hold) => {}
            Err(e) => {
                // 元素已移除或换了新一轮，停止旧的采样
                debug!("video {} dropped from sampler: {}", id, e);
                self.drop_track(id, round);
            }
        }
    }

    fn record_error(&self, id: ElementId, round: u64, e: PipelineError) {
        let exhausted = {
            let mut tracks = self.lock();
            let Some(track) = tracks.get_mut(&id).filter(|t| t.round == round) else {
                return;
            };
            track.consecutive_errors += 1;
            let exhausted = track.consecutive_errors > self.config.error_budget;
            if exhausted {
                tracks.remove(&id);
            }
            exhausted
        };

        if !exhausted {
            warn!("⚠️ video {} sample failed: {}", id, e);
            return;
        }
        self.worker.forget_stream(id);
        self.give_up(id, round, e);
    }

    /// 错误预算用完：标记 Error，解除遮挡，不再采样
    fn give_up(&self, id: ElementId, round: u64, e: PipelineError) {
        error!("❌ video {} stopped after repeated failures: {}", id, e);
        if let Err(e) = self.registry.transition(id, round, Status::Error) {
            debug!("video {} error status not recorded: {}", id, e);
            return;
        }
        let was_obstructed = self
            .registry
            .with_element(id, round, |element| {
                let was = element.obstructed;
                HysteresisState::new().store(element);
                element.last_verdict = Some(Verdict::Error);
                was
            })
            .unwrap_or(false);
        if was_obstructed {
            self.presentation.on_verdict_changed(id, false);
        }
    }

    fn drop_track(&self, id: ElementId, round: u64) {
        let dropped = {
            let mut tracks = self.lock();
            if tracks.get(&id).map_or(false, |t| t.round == round) {
                tracks.remove(&id);
                true
            } else {
                false
            }
        };
        if dropped {
            self.worker.forget_stream(id);
        }
    }
}

async fn sample_once(
    worker: &ClassificationWorker,
    id: ElementId,
    source: &dyn VideoSource,
    stale_after: Duration,
) -> Result<SampleOutcome, PipelineError> {
    let dimensions = source.dimensions();
    if !dimensions.is_known() {
        return Ok(SampleOutcome::NotReady);
    }

    let (width, height) = calc_resize(dimensions.width, dimensions.height, ResizeLimits::VIDEO);
    let frame = source.capture_frame(width, height).await?;

    match worker.classify_video_frame(id, frame).await? {
        FrameOutcome::Skipped => Ok(SampleOutcome::Skipped),
        FrameOutcome::Classified { verdict, timestamp } => {
            let lag = source.current_time().saturating_sub(timestamp);
            if lag > stale_after {
                Ok(SampleOutcome::Stale)
            } else {
                Ok(SampleOutcome::Verdict(verdict))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::classifier::{
        ClassPrediction, ClassifierFusion, FaceDetection, FusionConfig, Gender, MockFaceClassifier,
        MockNsfwClassifier, NsfwClass,
    };
    use crate::core::element::{Dimensions, MediaKind};
    use crate::core::media::{ScriptedVideoSource, StaticMediaLoader};
    use crate::core::presentation::RecordingPresentation;
    use crate::core::settings::SettingsSnapshot;
    use crate::core::worker::WorkerConfig;

    const ID: ElementId = ElementId(42);

    struct Harness {
        sampler: Arc<VideoSampler>,
        worker: Arc<ClassificationWorker>,
        registry: Arc<ElementRegistry>,
        presentation: Arc<RecordingPresentation>,
        video: Arc<ScriptedVideoSource>,
    }

    fn harness(nsfw: MockNsfwClassifier, faces: MockFaceClassifier) -> Harness {
        let fusion = Arc::new(ClassifierFusion::with_config(
            Arc::new(nsfw),
            Arc::new(faces),
            FusionConfig {
                cache_sensitivity: 0.0,
                ..FusionConfig::default()
            },
        ));
        let settings = SettingsHandle::fixed(SettingsSnapshot::default());
        let worker = Arc::new(ClassificationWorker::new(
            fusion,
            Arc::new(StaticMediaLoader::new()),
            settings.clone(),
            WorkerConfig::default(),
        ));
        let registry = Arc::new(ElementRegistry::new());
        let presentation = Arc::new(RecordingPresentation::new());
        let sampler = Arc::new(VideoSampler::new(
            worker.clone(),
            registry.clone(),
            presentation.clone(),
            settings,
            SamplerConfig::default(),
        ));

        let video = track(&sampler, &registry, ID);

        Harness {
            sampler,
            worker,
            registry,
            presentation,
            video,
        }
    }

    fn track(
        sampler: &VideoSampler,
        registry: &ElementRegistry,
        id: ElementId,
    ) -> Arc<ScriptedVideoSource> {
        registry.observe(id, MediaKind::Video, "clip.mp4", Dimensions::new(1920, 1080));
        for status in [Status::Queued, Status::Loading, Status::Loaded, Status::Processing, Status::Processed] {
            registry.transition(id, 0, status).unwrap();
        }
        let video = Arc::new(ScriptedVideoSource::new(1920, 1080));
        sampler.register(id, 0, video.clone());
        video
    }

    fn neutral() -> Vec<ClassPrediction> {
        vec![ClassPrediction::new(NsfwClass::Neutral, 0.95)]
    }

    fn porn() -> Vec<ClassPrediction> {
        vec![ClassPrediction::new(NsfwClass::Porn, 0.95)]
    }

    fn woman() -> Vec<FaceDetection> {
        vec![FaceDetection::new(Gender::Female, 0.9, 30.0)]
    }

    async fn next_tick(sampler: &VideoSampler) -> usize {
        tokio::time::advance(Duration::from_millis(40)).await;
        sampler.tick().await
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_clear_frame_keeps_obstruction() {
        let h = harness(
            MockNsfwClassifier::fixed(neutral()),
            MockFaceClassifier::fixed(woman()).then(woman()).then(vec![]),
        );

        assert_eq!(h.sampler.tick().await, 1);
        assert_eq!(h.presentation.events(), vec![(ID, true)]);

        next_tick(&h.sampler).await;
        next_tick(&h.sampler).await;

        let element = h.registry.get(ID).unwrap();
        assert!(element.obstructed);
        assert_eq!(element.negative_streak, 1);
        assert_eq!(element.last_verdict, Some(Verdict::Clear));
        assert_eq!(h.presentation.events(), vec![(ID, true)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sustained_clears_release() {
        let h = harness(
            MockNsfwClassifier::fixed(porn()).then(neutral()),
            MockFaceClassifier::fixed(vec![]),
        );

        h.sampler.tick().await;
        for _ in 0..3 {
            next_tick(&h.sampler).await;
        }
        assert_eq!(h.presentation.events_for(ID), vec![true, false]);
        assert!(!h.registry.get(ID).unwrap().obstructed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_budget_exhausted_fails_open() {
        let h = harness(
            MockNsfwClassifier::fixed(porn()).then_fail("backend lost"),
            MockFaceClassifier::fixed(vec![]),
        );

        h.sampler.tick().await;
        assert!(h.presentation.is_obstructed(ID));

        for _ in 0..3 {
            next_tick(&h.sampler).await;
        }
        // 三次连续错误仍可容忍
        assert!(h.sampler.is_tracking(ID));
        assert_eq!(h.registry.get(ID).unwrap().status, Status::Processed);

        next_tick(&h.sampler).await;
        assert!(!h.sampler.is_tracking(ID));
        let element = h.registry.get(ID).unwrap();
        assert_eq!(element.status, Status::Error);
        assert!(!element.obstructed);
        assert!(!h.presentation.is_obstructed(ID));

        assert_eq!(next_tick(&h.sampler).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_captures_use_up_error_budget() {
        let h = harness(MockNsfwClassifier::fixed(porn()), MockFaceClassifier::fixed(vec![]));

        h.sampler.tick().await;
        assert!(h.presentation.is_obstructed(ID));

        h.video.fail_next_captures(4);
        for _ in 0..3 {
            next_tick(&h.sampler).await;
        }
        assert!(h.sampler.is_tracking(ID));
        assert!(h.presentation.is_obstructed(ID));

        next_tick(&h.sampler).await;
        assert!(!h.sampler.is_tracking(ID));
        let element = h.registry.get(ID).unwrap();
        assert_eq!(element.status, Status::Error);
        assert!(!element.obstructed);
        assert_eq!(h.presentation.events_for(ID), vec![true, false]);
        assert_eq!(h.video.capture_count(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_videos_take_turns() {
        let h = harness(
            MockNsfwClassifier::fixed(neutral()).with_delay(Duration::from_millis(10)),
            MockFaceClassifier::fixed(vec![]),
        );
        let other = ElementId(43);
        let other_video = track(&h.sampler, &h.registry, other);

        for _ in 0..50 {
            next_tick(&h.sampler).await;
        }

        assert_eq!(h.video.capture_count(), 25);
        assert_eq!(other_video.capture_count(), 25);
        assert_eq!(h.registry.get(ID).unwrap().last_verdict, Some(Verdict::Clear));
        assert_eq!(h.registry.get(other).unwrap().last_verdict, Some(Verdict::Clear));
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_context_skips_capture() {
        let h = harness(
            MockNsfwClassifier::fixed(neutral()).with_delay(Duration::from_millis(100)),
            MockFaceClassifier::fixed(vec![]),
        );

        let worker = h.worker.clone();
        let host_frame = tokio::spawn(async move {
            let frame = crate::core::media::Frame::new(16, 16, vec![0u8; 16 * 16 * 4], 0);
            worker.classify_frame(frame).await
        });
        tokio::task::yield_now().await;
        assert!(h.worker.is_busy());

        assert_eq!(h.sampler.tick().await, 0);
        assert_eq!(h.video.capture_count(), 0);

        host_frame.await.unwrap().unwrap();
        assert_eq!(h.sampler.tick().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_between_verdicts_do_not_accumulate() {
        let h = harness(
            MockNsfwClassifier::fixed(neutral())
                .then_fail("a")
                .then_fail("b")
                .then_fail("c")
                .then(neutral())
                .then_fail("d")
                .then_fail("e")
                .then_fail("f"),
            MockFaceClassifier::fixed(vec![]),
        );

        h.sampler.tick().await;
        for _ in 0..7 {
            next_tick(&h.sampler).await;
        }
        assert!(h.sampler.is_tracking(ID));
        assert_eq!(h.registry.get(ID).unwrap().status, Status::Processed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_video_is_not_sampled() {
        let h = harness(MockNsfwClassifier::fixed(neutral()), MockFaceClassifier::fixed(vec![]));

        h.sampler.set_playing(ID, false);
        assert_eq!(h.sampler.tick().await, 0);
        assert_eq!(next_tick(&h.sampler).await, 0);
        assert_eq!(h.video.capture_count(), 0);

        h.sampler.set_playing(ID, true);
        assert_eq!(h.sampler.tick().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_respects_frame_interval() {
        let h = harness(MockNsfwClassifier::fixed(neutral()), MockFaceClassifier::fixed(vec![]));

        assert_eq!(h.sampler.tick().await, 1);
        assert_eq!(h.sampler.tick().await, 0);
        tokio::time::advance(Duration::from_millis(20)).await;
        assert_eq!(h.sampler.tick().await, 0);
        tokio::time::advance(Duration::from_millis(20)).await;
        assert_eq!(h.sampler.tick().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_frame_verdict_is_dropped() {
        let h = harness(
            MockNsfwClassifier::fixed(porn()).with_delay(Duration::from_secs(1)),
            MockFaceClassifier::fixed(vec![]),
        );

        let sampler = h.sampler.clone();
        let pending = tokio::spawn(async move { sampler.tick().await });

        tokio::time::sleep(Duration::from_millis(500)).await;
        // 用户拖动了进度条
        h.video.set_current_time(Duration::from_secs(30));

        assert_eq!(pending.await.unwrap(), 1);
        assert!(h.presentation.events().is_empty());
        assert_eq!(h.registry.get(ID).unwrap().last_verdict, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_element_stops_sampling() {
        let h = harness(MockNsfwClassifier::fixed(porn()), MockFaceClassifier::fixed(vec![]));

        h.registry.remove(ID);
        h.sampler.tick().await;
        assert!(!h.sampler.is_tracking(ID));
        assert!(h.presentation.events().is_empty());
    }
}
