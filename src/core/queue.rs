//! 加载 / 检测两级队列
//!
//! 两个队列都是无界积压、有界并发。槽位在任务结束时由 `Slot` 的 Drop 释放，
//! 释放后立刻尝试放行下一个，所以单个失败的元素不会卡住队列。

use crate::core::element::{Dimensions, ElementId, ElementRegistry, MediaKind, Status, Verdict};
use crate::core::error::PipelineError;
use crate::core::media::{LoadedMedia, MediaLoader};
use crate::core::presentation::Presentation;
use crate::core::video::VideoSampler;
use crate::core::worker::ClassificationWorker;
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub load_concurrency: usize,
    /// 分类后端是稀缺资源，保持很小
    pub detect_concurrency: usize,
    pub min_image: Dimensions,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            load_concurrency: 100,
            detect_concurrency: 4,
            min_image: Dimensions::new(64, 64),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Low,
}

impl Priority {
    fn of(visible: bool) -> Self {
        if visible {
            Priority::High
        } else {
            Priority::Low
        }
    }
}

struct LoadJob {
    id: ElementId,
    round: u64,
}

struct DetectJob {
    id: ElementId,
    round: u64,
    /// The source `media` was loaded from.
    source: String,
    media: LoadedMedia,
}

trait Job {
    fn id(&self) -> ElementId;
}

impl Job for LoadJob {
    fn id(&self) -> ElementId {
        self.id
    }
}

impl Job for DetectJob {
    fn id(&self) -> ElementId {
        self.id
    }
}

/// 高优先级总是先出队
struct Lanes<T> {
    high: VecDeque<T>,
    low: VecDeque<T>,
}

impl<T: Job> Lanes<T> {
    fn new() -> Self {
        Self {
            high: VecDeque::new(),
            low: VecDeque::new(),
        }
    }

    fn push(&mut self, job: T, priority: Priority) {
        match priority {
            Priority::High => self.high.push_back(job),
            Priority::Low => self.low.push_back(job),
        }
    }

    fn pop(&mut self) -> Option<(T, Priority)> {
        if let Some(job) = self.high.pop_front() {
            return Some((job, Priority::High));
        }
        self.low.pop_front().map(|job| (job, Priority::Low))
    }

    fn reprioritize(&mut self, id: ElementId, priority: Priority) {
        let (from, to) = match priority {
            Priority::High => (&mut self.low, &mut self.high),
            Priority::Low => (&mut self.high, &mut self.low),
        };
        if let Some(pos) = from.iter().position(|job| job.id() == id) {
            if let Some(job) = from.remove(pos) {
                to.push_back(job);
            }
        }
    }

    fn forget(&mut self, id: ElementId) {
        self.high.retain(|job| job.id() != id);
        self.low.retain(|job| job.id() != id);
    }

    fn clear(&mut self) {
        self.high.clear();
        self.low.clear();
    }

    fn len(&self) -> usize {
        self.high.len() + self.low.len()
    }
}

struct QueueState {
    loads: Lanes<LoadJob>,
    detects: Lanes<DetectJob>,
    active_loads: usize,
    active_detects: usize,
}

impl QueueState {
    fn is_idle(&self) -> bool {
        self.loads.len() == 0
            && self.detects.len() == 0
            && self.active_loads == 0
            && self.active_detects == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotKind {
    Load,
    Detect,
}

/// Concurrency slot held by one running job.
struct Slot {
    inner: Arc<QueueInner>,
    kind: SlotKind,
}

impl Drop for Slot {
    fn drop(&mut self) {
        let idle = {
            let mut state = self.inner.lock();
            match self.kind {
                SlotKind::Load => state.active_loads -= 1,
                SlotKind::Detect => state.active_detects -= 1,
            }
            state.is_idle()
        };
        match self.kind {
            SlotKind::Load => self.inner.pump_loads(),
            SlotKind::Detect => self.inner.pump_detects(),
        }
        if idle {
            self.inner.idle.notify_waiters();
        }
    }
}

enum Eligibility {
    Queued(Priority),
    TooSmall,
    NotObserved,
}

/// 检测开始前 / 结束时对元素的原子检查结果
enum Checkpoint {
    Passed,
    /// The element now points at a different source than the one classified.
    SourceReplaced,
    Skipped(Status),
}

struct QueueInner {
    state: Mutex<QueueState>,
    idle: Notify,
    registry: Arc<ElementRegistry>,
    loader: Arc<dyn MediaLoader>,
    worker: Arc<ClassificationWorker>,
    sampler: Arc<VideoSampler>,
    presentation: Arc<dyn Presentation>,
    config: QueueConfig,
}

impl QueueInner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn enqueue(self: &Arc<Self>, id: ElementId, round: u64) -> bool {
        let min = self.config.min_image;
        let eligibility = self.registry.with_element(id, round, |element| {
            if element.status != Status::Observed {
                return Eligibility::NotObserved;
            }
            // 0x0 表示尺寸还未知，先放行，加载后再判断
            if element.kind == MediaKind::Image
                && element.dimensions.is_known()
                && element.dimensions.is_below(min)
            {
                element.status = Status::Invalid;
                return Eligibility::TooSmall;
            }
            element.status = Status::Queued;
            Eligibility::Queued(Priority::of(element.visible))
        });

        match eligibility {
            Ok(Eligibility::Queued(priority)) => {
                debug!("element {} queued ({:?})", id, priority);
                self.lock().loads.push(LoadJob { id, round }, priority);
                self.pump_loads();
                true
            }
            Ok(Eligibility::TooSmall) => {
                debug!("element {} too small, invalid", id);
                false
            }
            Ok(Eligibility::NotObserved) => false,
            Err(e) => {
                debug!("element {} not queued: {}", id, e);
                false
            }
        }
    }

    fn pump_loads(self: &Arc<Self>) {
        loop {
            let next = {
                let mut state = self.lock();
                if state.active_loads >= self.config.load_concurrency {
                    None
                } else {
                    let next = state.loads.pop();
                    if next.is_some() {
                        state.active_loads += 1;
                    }
                    next
                }
            };
            let Some((job, priority)) = next else {
                break;
            };

            let slot = Slot {
                inner: self.clone(),
                kind: SlotKind::Load,
            };
            tokio::spawn(async move {
                if priority == Priority::Low {
                    tokio::task::yield_now().await;
                }
                slot.inner.load(job).await;
                drop(slot);
            });
        }
    }

    fn pump_detects(self: &Arc<Self>) {
        loop {
            let next = {
                let mut state = self.lock();
                if state.active_detects >= self.config.detect_concurrency {
                    None
                } else {
                    let next = state.detects.pop();
                    if next.is_some() {
                        state.active_detects += 1;
                    }
                    next
                }
            };
            let Some((job, priority)) = next else {
                break;
            };

            let slot = Slot {
                inner: self.clone(),
                kind: SlotKind::Detect,
            };
            tokio::spawn(async move {
                if priority == Priority::Low {
                    tokio::task::yield_now().await;
                }
                slot.inner.detect(job).await;
                drop(slot);
            });
        }
    }

    async fn load(self: &Arc<Self>, job: LoadJob) {
        let LoadJob { id, round } = job;
        let Some(element) = self.registry.get(id) else {
            debug!("element {} removed before load", id);
            return;
        };
        if let Err(e) = self.registry.transition(id, round, Status::Loading) {
            debug!("element {} load skipped: {}", id, e);
            return;
        }

        let source = element.source.clone();
        let loaded = match element.kind {
            MediaKind::Image => self.loader.load_image(&source).await.map(LoadedMedia::Image),
            MediaKind::Video => self.loader.load_video(id, &source).await.map(LoadedMedia::Video),
        };

        // 加载期间被移除、重置或者换了 src，旧结果作废
        let current = match self.registry.get(id) {
            Some(current) if current.round == round => current,
            _ => return,
        };
        if current.source != source {
            self.restart_replaced(id);
            return;
        }

        let media = match loaded {
            Ok(media) => media,
            Err(e) => {
                self.fail(id, round, &source, e);
                return;
            }
        };

        let dimensions = media.dimensions();
        if element.kind == MediaKind::Image
            && dimensions.is_known()
            && dimensions.is_below(self.config.min_image)
        {
            debug!("element {} decoded at {:?}, too small", id, dimensions);
            let _ = self.registry.transition(id, round, Status::Invalid);
            return;
        }

        let loaded = self.registry.with_element(id, round, |element| {
            if dimensions.is_known() {
                element.dimensions = dimensions;
            }
        });
        if loaded.is_err() || self.registry.transition(id, round, Status::Loaded).is_err() {
            return;
        }

        let priority = Priority::of(current.visible);
        self.lock().detects.push(
            DetectJob {
                id,
                round,
                source,
                media,
            },
            priority,
        );
        self.pump_detects();
    }

    async fn detect(self: &Arc<Self>, job: DetectJob) {
        let DetectJob {
            id,
            round,
            source,
            media,
        } = job;

        // 等检测槽位期间 src 可能被换掉，旧的帧不能代表新内容
        let start = self.registry.with_element(id, round, |element| {
            if element.source != source {
                Checkpoint::SourceReplaced
            } else if element.status != Status::Loaded {
                Checkpoint::Skipped(element.status)
            } else {
                element.status = Status::Processing;
                Checkpoint::Passed
            }
        });
        match start {
            Ok(Checkpoint::Passed) => debug!("element {} Loaded -> Processing (round {})", id, round),
            Ok(Checkpoint::SourceReplaced) => {
                self.restart_replaced(id);
                return;
            }
            Ok(Checkpoint::Skipped(status)) => {
                debug!("element {} detection skipped at {:?}", id, status);
                return;
            }
            Err(e) => {
                debug!("element {} detection skipped: {}", id, e);
                return;
            }
        }

        match media {
            LoadedMedia::Image(frame) => match self.worker.classify_image(frame).await {
                Ok(Verdict::Error) => self.fail(
                    id,
                    round,
                    &source,
                    PipelineError::Classify("classifier returned an error verdict".to_string()),
                ),
                Ok(verdict) => self.finish_image(id, round, &source, verdict),
                Err(e) => self.fail(id, round, &source, e),
            },
            LoadedMedia::Video(video) => {
                // 视频交给采样循环，之后的结论由去抖逻辑决定
                if self.registry.transition(id, round, Status::Processed).is_ok() {
                    self.sampler.register(id, round, video);
                }
            }
        }
    }

    /// Pending work found a new source under it: start over in a new round.
    fn restart_replaced(self: &Arc<Self>, id: ElementId) {
        debug!("element {} source replaced before detection, restarting", id);
        if let Some(next_round) = self.registry.restart(id) {
            self.enqueue(id, next_round);
        }
    }

    /// 图片只判一次，结论直接决定遮挡
    fn finish_image(self: &Arc<Self>, id: ElementId, round: u64, source: &str, verdict: Verdict) {
        let obstruct = verdict.should_obstruct();
        let finished = self.registry.with_element(id, round, |element| {
            if element.source != source {
                return Checkpoint::SourceReplaced;
            }
            if element.status != Status::Processing {
                return Checkpoint::Skipped(element.status);
            }
            element.status = Status::Processed;
            element.last_verdict = Some(verdict);
            element.obstructed = obstruct;
            Checkpoint::Passed
        });

        match finished {
            Ok(Checkpoint::Passed) => {
                if obstruct {
                    info!("🙈 image {} obstructed ({:?})", id, verdict);
                }
                self.presentation.on_verdict_changed(id, obstruct);
            }
            Ok(Checkpoint::SourceReplaced) => self.restart_replaced(id),
            Ok(Checkpoint::Skipped(status)) => {
                debug!("element {} result discarded at {:?}", id, status)
            }
            Err(e) => debug!("element {} result discarded: {}", id, e),
        }
    }

    /// Fail open: terminal status and no obstruction.
    fn fail(self: &Arc<Self>, id: ElementId, round: u64, source: &str, e: PipelineError) {
        let replaced = self
            .registry
            .get(id)
            .map_or(false, |element| element.round == round && element.source != source);
        if replaced {
            // 失败的是旧内容，新内容还没看过
            self.restart_replaced(id);
            return;
        }

        let status = match e {
            PipelineError::Load(_) | PipelineError::TooSmall { .. } => Status::Invalid,
            _ => Status::Error,
        };
        warn!("⚠️ element {} -> {:?}: {}", id, status, e);
        if self.registry.transition(id, round, status).is_err() {
            return;
        }
        let was_obstructed = self
            .registry
            .with_element(id, round, |element| {
                let was = element.obstructed;
                element.obstructed = false;
                if status == Status::Error {
                    element.last_verdict = Some(Verdict::Error);
                }
                was
            })
            .unwrap_or(false);
        if was_obstructed {
            self.presentation.on_verdict_changed(id, false);
        }
    }
}

/// 调度器：唯一决定并发的地方
#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<QueueInner>,
}

impl QueueManager {
    pub fn new(
        registry: Arc<ElementRegistry>,
        loader: Arc<dyn MediaLoader>,
        worker: Arc<ClassificationWorker>,
        sampler: Arc<VideoSampler>,
        presentation: Arc<dyn Presentation>,
        config: QueueConfig,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    loads: Lanes::new(),
                    detects: Lanes::new(),
                    active_loads: 0,
                    active_detects: 0,
                }),
                idle: Notify::new(),
                registry,
                loader,
                worker,
                sampler,
                presentation,
                config,
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Offers an `Observed` element for `round` to the load queue. Returns whether it was admitted.
    pub fn enqueue(&self, id: ElementId, round: u64) -> bool {
        self.inner.enqueue(id, round)
    }

    /// 进入视口的元素提到高优先级，离开的降下来
    pub fn set_visible(&self, id: ElementId, visible: bool) {
        if self.inner.registry.set_visible(id, visible).is_none() {
            return;
        }
        let priority = Priority::of(visible);
        let mut state = self.inner.lock();
        state.loads.reprioritize(id, priority);
        state.detects.reprioritize(id, priority);
    }

    /// Drops pending work for a removed element. In-flight work finishes and is discarded.
    pub fn forget(&self, id: ElementId) {
        let mut state = self.inner.lock();
        state.loads.forget(id);
        state.detects.forget(id);
    }

    /// Drops all pending work.
    pub fn clear(&self) {
        let idle = {
            let mut state = self.inner.lock();
            state.loads.clear();
            state.detects.clear();
            state.is_idle()
        };
        if idle {
            self.inner.idle.notify_waiters();
        }
    }

    pub fn pending_loads(&self) -> usize {
        self.inner.lock().loads.len()
    }

    pub fn pending_detects(&self) -> usize {
        self.inner.lock().detects.len()
    }

    pub fn active_loads(&self) -> usize {
        self.inner.lock().active_loads
    }

    pub fn active_detects(&self) -> usize {
        self.inner.lock().active_detects
    }

    pub fn is_idle(&self) -> bool {
        self.inner.lock().is_idle()
    }

    /// Resolves once nothing is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }
}
