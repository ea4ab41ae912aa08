use super::frame::Frame;
use super::loader::{MediaLoader, VideoSource};
use crate::core::element::{Dimensions, ElementId};
use crate::core::error::PipelineError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// 脚本化视频源：可控的播放状态、播放位置和抓帧失败次数
pub struct ScriptedVideoSource {
    dimensions: Dimensions,
    playing: AtomicBool,
    current_time: Mutex<Duration>,
    failing_captures: AtomicU32,
    captures: AtomicUsize,
}

impl ScriptedVideoSource {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            dimensions: Dimensions::new(width, height),
            playing: AtomicBool::new(true),
            current_time: Mutex::new(Duration::ZERO),
            failing_captures: AtomicU32::new(0),
            captures: AtomicUsize::new(0),
        }
    }

    pub fn set_playing(&self, playing: bool) {
        self.playing.store(playing, Ordering::SeqCst);
    }

    pub fn set_current_time(&self, position: Duration) {
        *self
            .current_time
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = position;
    }

    /// The next `count` captures fail.
    pub fn fail_next_captures(&self, count: u32) {
        self.failing_captures.store(count, Ordering::SeqCst);
    }

    pub fn capture_count(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VideoSource for ScriptedVideoSource {
    fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    fn current_time(&self) -> Duration {
        *self
            .current_time
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    async fn capture_frame(&self, width: u32, height: u32) -> Result<Frame, PipelineError> {
        let n = self.captures.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_captures.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_captures.store(failing - 1, Ordering::SeqCst);
            return Err(PipelineError::Load("frame capture failed".to_string()));
        }
        let fill = (n % 251) as u8;
        let timestamp = self.current_time().as_millis() as u64;
        Ok(Frame::new(width, height, vec![fill; (width * height * 4) as usize], timestamp))
    }
}

#[derive(Clone)]
pub enum MediaScript {
    Image { width: u32, height: u32 },
    Video(Arc<ScriptedVideoSource>),
    Fail(String),
}

/// 按 source 返回预设结果的加载器，记录调用次数和最大并发
pub struct StaticMediaLoader {
    scripts: Mutex<HashMap<String, MediaScript>>,
    delay: Duration,
    loads: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl StaticMediaLoader {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            delay: Duration::ZERO,
            loads: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Every load sleeps for `delay` before resolving.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn script(&self, source: &str, script: MediaScript) {
        self.scripts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(source.to_string(), script);
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn resolve(&self, source: &str) -> Result<MediaScript, PipelineError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let script = self
            .scripts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(source)
            .cloned();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match script {
            Some(MediaScript::Fail(reason)) => Err(PipelineError::Load(reason)),
            Some(script) => Ok(script),
            None => Err(PipelineError::Load(format!("unscripted source {}", source))),
        }
    }
}

impl Default for StaticMediaLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaLoader for StaticMediaLoader {
    async fn load_image(&self, source: &str) -> Result<Frame, PipelineError> {
        match self.resolve(source).await? {
            MediaScript::Image { width, height } => {
                Ok(Frame::new(width, height, vec![90u8; (width * height * 4) as usize], 0))
            }
            _ => Err(PipelineError::Load(format!("{} is not an image", source))),
        }
    }

    async fn load_video(
        &self,
        _id: ElementId,
        source: &str,
    ) -> Result<Arc<dyn VideoSource>, PipelineError> {
        match self.resolve(source).await? {
            MediaScript::Video(video) => Ok(video),
            _ => Err(PipelineError::Load(format!("{} is not a video", source))),
        }
    }
}
