use super::frame::Frame;
use crate::core::element::{Dimensions, ElementId};
use crate::core::error::PipelineError;
use async_trait::async_trait;
use log::debug;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;

/// A playing video as exposed by the host page.
#[async_trait]
pub trait VideoSource: Send + Sync {
    /// Natural size, known once the first frame is decoded.
    fn dimensions(&self) -> Dimensions;

    fn current_time(&self) -> Duration;

    fn is_playing(&self) -> bool;

    /// Draws the current frame at `width` x `height`.
    async fn capture_frame(&self, width: u32, height: u32) -> Result<Frame, PipelineError>;
}

/// 加载结果：图片直接解码成帧，视频交给采样循环
pub enum LoadedMedia {
    Image(Frame),
    Video(Arc<dyn VideoSource>),
}

impl LoadedMedia {
    pub fn dimensions(&self) -> Dimensions {
        match self {
            LoadedMedia::Image(frame) => Dimensions::new(frame.width, frame.height),
            LoadedMedia::Video(video) => video.dimensions(),
        }
    }
}

#[async_trait]
pub trait MediaLoader: Send + Sync {
    async fn load_image(&self, source: &str) -> Result<Frame, PipelineError>;

    /// Waits until the video element has decoded data.
    async fn load_video(
        &self,
        id: ElementId,
        source: &str,
    ) -> Result<Arc<dyn VideoSource>, PipelineError> {
        let _ = id;
        Err(PipelineError::Load(format!(
            "no video backend available for {}",
            source
        )))
    }
}

/// 默认加载器：http(s) 走 reqwest，其余按本地路径读取
pub struct HttpMediaLoader {
    client: Client,
}

impl HttpMediaLoader {
    pub fn new() -> Result<Self, PipelineError> {
        let client = Client::builder()
            .user_agent("Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0.0.0 Safari/537.36")
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client })
    }

    async fn fetch_bytes(&self, source: &str) -> Result<Vec<u8>, PipelineError> {
        if source.starts_with("http://") || source.starts_with("https://") {
            let resp = self.client.get(source).send().await?.error_for_status()?;
            Ok(resp.bytes().await?.to_vec())
        } else {
            let path = source.strip_prefix("file://").unwrap_or(source);
            Ok(tokio::fs::read(path).await?)
        }
    }
}

#[async_trait]
impl MediaLoader for HttpMediaLoader {
    async fn load_image(&self, source: &str) -> Result<Frame, PipelineError> {
        if source.is_empty() {
            return Err(PipelineError::Load("empty source".to_string()));
        }
        let bytes = self.fetch_bytes(source).await?;
        debug!("fetched {} bytes from {}", bytes.len(), source);

        // 解码放到阻塞线程，避免卡住调度
        tokio::task::spawn_blocking(move || Frame::decode(&bytes))
            .await
            .map_err(|e| PipelineError::Load(format!("decode task failed: {}", e)))?
    }
}
