//! 检测流水线入口
//!
//! 组装各组件，消费元素变更事件，并把设置变化接到队列和采样循环上。
//! 所有方法都要在 tokio 运行时内调用。

use crate::core::classifier::{ClassifierFusion, FaceClassifier, FusionConfig, NsfwClassifier};
use crate::core::discovery::{
    scan_document, FeedEvent, IdAllocator, NodeSnapshot, PlaybackState, SOURCE_ATTRIBUTE,
};
use crate::core::element::{Admission, ElementId, ElementRegistry, MediaKind, Status};
use crate::core::error::PipelineError;
use crate::core::media::MediaLoader;
use crate::core::presentation::Presentation;
use crate::core::queue::{QueueConfig, QueueManager};
use crate::core::settings::{host_of, SettingsSnapshot, SettingsStore};
use crate::core::video::{SamplerConfig, VideoSampler};
use crate::core::worker::{ClassificationWorker, WorkerConfig};
use log::{debug, info};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub queue: QueueConfig,
    pub sampler: SamplerConfig,
    pub fusion: FusionConfig,
    /// Upper bound for one video frame classification.
    pub frame_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            sampler: SamplerConfig::default(),
            fusion: FusionConfig::default(),
            frame_timeout: Duration::from_secs(2),
        }
    }
}

pub struct Pipeline {
    settings: Arc<SettingsStore>,
    registry: Arc<ElementRegistry>,
    queue: QueueManager,
    sampler: Arc<VideoSampler>,
    worker: Arc<ClassificationWorker>,
    presentation: Arc<dyn Presentation>,
    page_host: Mutex<Option<String>>,
    ids: IdAllocator,
    shutdown: watch::Sender<bool>,
}

impl Pipeline {
    pub fn new(
        settings: Arc<SettingsStore>,
        nsfw: Arc<dyn NsfwClassifier>,
        faces: Arc<dyn FaceClassifier>,
        loader: Arc<dyn MediaLoader>,
        presentation: Arc<dyn Presentation>,
        config: PipelineConfig,
    ) -> Arc<Self> {
        crate::init_logging();
        let handle = settings.handle();
        let fusion = Arc::new(ClassifierFusion::with_config(nsfw, faces, config.fusion));
        // 图片分类的许可数和检测队列上限一致，宿主请求和队列共用
        let worker_config = WorkerConfig {
            frame_timeout: config.frame_timeout,
            image_permits: config.queue.detect_concurrency,
            min_image: config.queue.min_image,
        };
        let worker = Arc::new(ClassificationWorker::new(
            fusion,
            loader.clone(),
            handle.clone(),
            worker_config,
        ));
        let registry = Arc::new(ElementRegistry::new());
        let sampler = Arc::new(VideoSampler::new(
            worker.clone(),
            registry.clone(),
            presentation.clone(),
            handle,
            config.sampler,
        ));
        let queue = QueueManager::new(
            registry.clone(),
            loader,
            worker.clone(),
            sampler.clone(),
            presentation.clone(),
            config.queue,
        );
        let (shutdown, _) = watch::channel(false);

        let pipeline = Arc::new(Self {
            settings,
            registry,
            queue,
            sampler,
            worker,
            presentation,
            page_host: Mutex::new(None),
            // 与宿主分配的 id 错开
            ids: IdAllocator::starting_at(1 << 48),
            shutdown,
        });
        Self::subscribe(&pipeline);
        info!("🚀 pipeline created");
        pipeline
    }

    fn subscribe(pipeline: &Arc<Self>) {
        let store = pipeline.settings.clone();

        store.on_toggle(|settings| {
            info!("🔀 detection switched {}", if settings.enabled { "on" } else { "off" });
        });

        // 任何影响检测范围的变更（图片 / 视频开关、白名单）都在这里对齐
        let weak: Weak<Self> = Arc::downgrade(pipeline);
        store.on_settings_changed(move |settings| {
            if let Some(pipeline) = weak.upgrade() {
                pipeline.reconcile(settings);
            }
        });

        let weak: Weak<Self> = Arc::downgrade(pipeline);
        store.on_style_changed(move |settings| {
            if let Some(pipeline) = weak.upgrade() {
                pipeline.presentation.on_style_changed(&settings.style());
            }
        });
    }

    pub fn registry(&self) -> &Arc<ElementRegistry> {
        &self.registry
    }

    pub fn queue(&self) -> &QueueManager {
        &self.queue
    }

    pub fn sampler(&self) -> &Arc<VideoSampler> {
        &self.sampler
    }

    pub fn worker(&self) -> &Arc<ClassificationWorker> {
        &self.worker
    }

    pub fn settings(&self) -> &Arc<SettingsStore> {
        &self.settings
    }

    /// Sets the page this pipeline runs on, for the whitelist.
    pub fn set_page_url(&self, url: &str) {
        let host = host_of(url);
        debug!("page host: {:?}", host);
        *self.page_host.lock().unwrap_or_else(|p| p.into_inner()) = host;
    }

    fn is_whitelisted(&self, settings: &SettingsSnapshot) -> bool {
        self.page_host
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_deref()
            .map_or(false, |host| settings.is_whitelisted(host))
    }

    fn accepts(&self, kind: MediaKind, settings: &SettingsSnapshot) -> bool {
        if self.is_whitelisted(settings) {
            return false;
        }
        match kind {
            MediaKind::Image => settings.should_detect_images(),
            MediaKind::Video => settings.should_detect_videos(),
        }
    }

    pub fn handle_event(&self, event: FeedEvent) {
        match event {
            FeedEvent::Added(nodes) => {
                for node in &nodes {
                    for media in node.media_nodes() {
                        self.observe_node(media);
                    }
                }
            }
            FeedEvent::AttributeChanged { node, attribute } => {
                if attribute == SOURCE_ATTRIBUTE && node.media_kind().is_some() {
                    self.observe_node(&node);
                }
            }
            FeedEvent::Removed(ids) => {
                for id in ids {
                    self.queue.forget(id);
                    self.sampler.remove(id);
                    if self.registry.remove(id).is_some() {
                        debug!("element {} detached", id);
                    }
                }
            }
            FeedEvent::VisibilityChanged { id, visible } => self.queue.set_visible(id, visible),
            FeedEvent::Playback { id, state } => {
                self.sampler.set_playing(id, state == PlaybackState::Playing)
            }
        }
    }

    fn observe_node(&self, node: &NodeSnapshot) {
        let Some(kind) = node.media_kind() else {
            return;
        };
        // 还没有 src，等属性变更事件
        let Some(source) = node.media_source() else {
            return;
        };

        let round = match self.registry.observe(node.id, kind, source, node.dimensions) {
            Admission::Admit { round } => round,
            Admission::Skip | Admission::SourceUpdated => return,
        };

        self.release_previous_round(node.id, round);

        let settings = self.settings.current();
        if !self.accepts(kind, &settings) {
            let _ = self.registry.transition(node.id, round, Status::Disabled);
            return;
        }
        self.queue.enqueue(node.id, round);
    }

    /// 换了内容的元素先解除旧的遮挡，旧的采样也停掉
    fn release_previous_round(&self, id: ElementId, round: u64) {
        if round == 0 {
            return;
        }
        self.sampler.remove(id);
        let was_obstructed = self
            .registry
            .with_element(id, round, |element| std::mem::replace(&mut element.obstructed, false))
            .unwrap_or(false);
        if was_obstructed {
            self.presentation.on_verdict_changed(id, false);
        }
    }

    /// 总开关关闭：停止放行和采样，解除所有遮挡
    fn disable(&self) {
        self.queue.clear();
        self.sampler.clear();
        let released = self.release(self.registry.disable_where(|_| true));
        info!("⏸️ detection disabled, {} elements released", released);
    }

    /// Disables the kinds the settings no longer cover and re-queues the ones they cover again.
    fn reconcile(&self, settings: &SettingsSnapshot) {
        if !settings.should_detect() {
            self.disable();
            return;
        }

        let images = self.accepts(MediaKind::Image, settings);
        let videos = self.accepts(MediaKind::Video, settings);
        let covers = |kind: MediaKind| match kind {
            MediaKind::Image => images,
            MediaKind::Video => videos,
        };

        let disabled = self.registry.disable_where(|element| !covers(element.kind));
        for (id, _) in &disabled {
            self.queue.forget(*id);
            self.sampler.remove(*id);
        }
        let released = self.release(disabled);
        if released > 0 {
            info!("⏸️ {} elements released after settings change", released);
        }

        let mut admitted = 0;
        for (id, round) in self.registry.reenable_where(|element| covers(element.kind)) {
            if self.queue.enqueue(id, round) {
                admitted += 1;
            }
        }
        if admitted > 0 {
            info!("▶️ detection enabled, {} elements re-queued", admitted);
        }
    }

    /// Tells the presentation about every element that lost its obstruction. Returns the count.
    fn release(&self, disabled: Vec<(ElementId, bool)>) -> usize {
        let mut released = 0;
        for (id, was_obstructed) in disabled {
            if was_obstructed {
                self.presentation.on_verdict_changed(id, false);
                released += 1;
            }
        }
        released
    }

    /// Feeds every media element already present in an HTML snapshot. Returns the assigned ids.
    pub fn scan_document(&self, html: &str) -> Result<Vec<ElementId>, PipelineError> {
        let nodes = scan_document(html, &self.ids)?;
        let ids = nodes.iter().map(|n| n.id).collect();
        self.handle_event(FeedEvent::Added(nodes));
        Ok(ids)
    }

    /// Consumes the element change feed until it closes or `shutdown` is called.
    pub async fn run(self: Arc<Self>, mut feed: mpsc::Receiver<FeedEvent>) {
        let mut stop = self.shutdown.subscribe();
        let sampler = tokio::spawn(self.sampler.clone().run(self.shutdown.subscribe()));
        info!("🚀 pipeline running");

        loop {
            tokio::select! {
                event = feed.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }

        self.shutdown.send_replace(true);
        let _ = sampler.await;
        info!("🛑 pipeline stopped");
    }

    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        self.queue.clear();
        self.sampler.clear();
    }
}
