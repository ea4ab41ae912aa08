//! 宿主消息端点 - 把信封请求转给分类上下文

use crate::api::models::{FramePayload, HostRequest, HostResponse, ImagePayload};
use crate::core::element::{Dimensions, Verdict};
use crate::core::error::PipelineError;
use crate::core::media::Frame;
use crate::core::worker::{ClassificationWorker, FrameOutcome};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// 宿主侧错误类型，可直接序列化回给调用方
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    pub error_type: String,
    pub message: String,
}

impl ApiError {
    fn bad_request(e: String) -> Self {
        Self {
            error_type: "BadRequest".to_string(),
            message: format!("请求解析失败: {}", e),
        }
    }

    fn bad_frame(e: String) -> Self {
        Self {
            error_type: "BadFrame".to_string(),
            message: format!("帧解码失败: {}", e),
        }
    }

    fn too_small(width: u32, height: u32) -> Self {
        Self {
            error_type: "TooSmall".to_string(),
            message: format!("图片太小，不做检测: {}x{}", width, height),
        }
    }

    fn internal(e: String) -> Self {
        Self {
            error_type: "Internal".to_string(),
            message: e,
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.error_type, self.message)
    }
}

impl std::error::Error for ApiError {}

/// 分类上下文对外的唯一入口
///
/// ```ignore
/// let endpoint = HostEndpoint::new(pipeline.worker().clone());
/// let reply = endpoint.handle_json(r#"{"type":"classifyImage","requestId":"1","payload":{"src":"a.png"}}"#).await;
/// ```
pub struct HostEndpoint {
    worker: Arc<ClassificationWorker>,
}

impl HostEndpoint {
    pub fn new(worker: Arc<ClassificationWorker>) -> Self {
        Self { worker }
    }

    /// Media faults come back as an `error` verdict. Malformed requests and images below
    /// the minimum size are `Err`.
    pub async fn handle(&self, request: HostRequest) -> Result<HostResponse, ApiError> {
        match request {
            HostRequest::ClassifyImage {
                request_id,
                payload,
            } => self.classify_image(&request_id, payload).await,
            HostRequest::ClassifyFrame {
                request_id,
                payload,
            } => self.classify_frame(&request_id, payload).await,
        }
    }

    /// JSON in, JSON out. Errors are serialized as `ApiError`.
    pub async fn handle_json(&self, raw: &str) -> String {
        let reply = match serde_json::from_str::<HostRequest>(raw) {
            Ok(request) => self.handle(request).await,
            Err(e) => Err(ApiError::bad_request(e.to_string())),
        };

        let encoded = match &reply {
            Ok(response) => serde_json::to_string(response),
            Err(error) => serde_json::to_string(error),
        };
        encoded.unwrap_or_else(|e| {
            let fallback = ApiError::internal(e.to_string());
            format!(
                r#"{{"error_type":"{}","message":"{}"}}"#,
                fallback.error_type,
                fallback.message.replace('"', "'")
            )
        })
    }

    async fn classify_image(
        &self,
        request_id: &str,
        payload: ImagePayload,
    ) -> Result<HostResponse, ApiError> {
        debug!("📨 [{}] classifyImage {}", request_id, payload.src);
        let declared = Dimensions::new(payload.width, payload.height);
        if declared.is_known() && declared.is_below(self.worker.config().min_image) {
            return Err(ApiError::too_small(declared.width, declared.height));
        }

        // 并发上限由分类上下文的许可数控制
        let verdict = match self.worker.classify_image_source(&payload.src).await {
            Ok(verdict) => verdict,
            Err(PipelineError::TooSmall { width, height }) => {
                return Err(ApiError::too_small(width, height))
            }
            Err(e) => {
                warn!("⚠️ [{}] image failed, fail open: {}", request_id, e);
                Verdict::Error
            }
        };
        Ok(HostResponse::verdict(request_id, verdict, payload.timestamp))
    }

    async fn classify_frame(
        &self,
        request_id: &str,
        payload: FramePayload,
    ) -> Result<HostResponse, ApiError> {
        let mut frame =
            Frame::decode(&payload.data).map_err(|e| ApiError::bad_frame(e.to_string()))?;
        frame.timestamp = Duration::from_millis(payload.timestamp);

        let response = match self.worker.classify_frame(frame).await {
            Ok(FrameOutcome::Classified { verdict, timestamp }) => {
                HostResponse::verdict(request_id, verdict, timestamp.as_millis() as u64)
            }
            Ok(FrameOutcome::Skipped) => HostResponse::skipped(request_id, payload.timestamp),
            Err(PipelineError::Timeout(ms)) => {
                warn!("⏱️ [{}] frame timed out after {} ms", request_id, ms);
                HostResponse::verdict(request_id, Verdict::Error, payload.timestamp)
            }
            Err(e) => {
                warn!("⚠️ [{}] frame failed, fail open: {}", request_id, e);
                HostResponse::verdict(request_id, Verdict::Error, payload.timestamp)
            }
        };
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::classifier::{
        ClassPrediction, ClassifierFusion, FusionConfig, MockFaceClassifier, MockNsfwClassifier,
        NsfwClass,
    };
    use crate::core::media::{MediaScript, StaticMediaLoader};
    use crate::core::settings::{SettingsHandle, SettingsSnapshot};
    use crate::core::worker::WorkerConfig;

    fn endpoint(nsfw: MockNsfwClassifier) -> HostEndpoint {
        endpoint_with(Arc::new(nsfw), WorkerConfig::default())
    }

    fn endpoint_with(nsfw: Arc<MockNsfwClassifier>, config: WorkerConfig) -> HostEndpoint {
        let fusion = Arc::new(ClassifierFusion::with_config(
            nsfw,
            Arc::new(MockFaceClassifier::fixed(vec![])),
            FusionConfig {
                cache_sensitivity: 0.0,
                ..FusionConfig::default()
            },
        ));
        let loader = Arc::new(StaticMediaLoader::new());
        loader.script("cat.png", MediaScript::Image { width: 320, height: 240 });
        loader.script("dot.png", MediaScript::Image { width: 20, height: 20 });
        let worker = ClassificationWorker::new(
            fusion,
            loader,
            SettingsHandle::fixed(SettingsSnapshot::default()),
            config,
        );
        HostEndpoint::new(Arc::new(worker))
    }

    fn jpeg() -> Vec<u8> {
        Frame::new(32, 32, vec![90u8; 32 * 32 * 4], 0)
            .encode_jpeg(60)
            .unwrap()
    }

    #[tokio::test]
    async fn test_classify_image_by_source() {
        let endpoint = endpoint(MockNsfwClassifier::fixed(vec![ClassPrediction::new(
            NsfwClass::Porn,
            0.9,
        )]));
        let reply = endpoint
            .handle(HostRequest::ClassifyImage {
                request_id: "1".to_string(),
                payload: ImagePayload {
                    src: "cat.png".to_string(),
                    width: 320,
                    height: 240,
                    timestamp: 5000,
                },
            })
            .await
            .unwrap();
        assert_eq!(reply.verdict, Some(Verdict::Nsfw));
        assert!(!reply.skipped);
        assert_eq!(reply.timestamp, 5000);
    }

    #[tokio::test]
    async fn test_missing_image_fails_open() {
        let endpoint = endpoint(MockNsfwClassifier::fixed(vec![]));
        let raw = r#"{"type":"classifyImage","requestId":"9","payload":{"src":"gone.png"}}"#;
        let reply: HostResponse = serde_json::from_str(&endpoint.handle_json(raw).await).unwrap();
        assert_eq!(reply.request_id, "9");
        assert_eq!(reply.verdict, Some(Verdict::Error));
    }

    #[tokio::test]
    async fn test_classify_frame_echoes_timestamp() {
        let endpoint = endpoint(MockNsfwClassifier::fixed(vec![ClassPrediction::new(
            NsfwClass::Neutral,
            0.99,
        )]));
        let reply = endpoint
            .handle(HostRequest::ClassifyFrame {
                request_id: "f".to_string(),
                payload: FramePayload {
                    data: jpeg(),
                    timestamp: 1234,
                },
            })
            .await
            .unwrap();
        assert_eq!(reply.verdict, Some(Verdict::Clear));
        assert_eq!(reply.timestamp, 1234);
    }

    #[tokio::test]
    async fn test_garbage_frame_is_api_error() {
        let endpoint = endpoint(MockNsfwClassifier::fixed(vec![]));
        let err = endpoint
            .handle(HostRequest::ClassifyFrame {
                request_id: "x".to_string(),
                payload: FramePayload {
                    data: vec![1, 2, 3],
                    timestamp: 0,
                },
            })
            .await
            .unwrap_err();
        assert_eq!(err.error_type, "BadFrame");
    }

    #[tokio::test]
    async fn test_malformed_json_is_bad_request() {
        let endpoint = endpoint(MockNsfwClassifier::fixed(vec![]));
        let raw = endpoint.handle_json(r#"{"type":"unknown"}"#).await;
        let err: ApiError = serde_json::from_str(&raw).unwrap();
        assert_eq!(err.error_type, "BadRequest");
    }

    #[tokio::test]
    async fn test_small_images_are_refused() {
        let nsfw = Arc::new(MockNsfwClassifier::fixed(vec![]));
        let endpoint = endpoint_with(nsfw.clone(), WorkerConfig::default());

        // 宿主给了尺寸：不加载直接拒绝
        let raw = r#"{"type":"classifyImage","requestId":"s","payload":{"src":"cat.png","width":40,"height":40}}"#;
        let err: ApiError = serde_json::from_str(&endpoint.handle_json(raw).await).unwrap();
        assert_eq!(err.error_type, "TooSmall");

        // 尺寸未知：解码后再判断
        let raw = r#"{"type":"classifyImage","requestId":"t","payload":{"src":"dot.png"}}"#;
        let err: ApiError = serde_json::from_str(&endpoint.handle_json(raw).await).unwrap();
        assert_eq!(err.error_type, "TooSmall");
        assert_eq!(nsfw.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_image_burst_stays_within_detect_cap() {
        let nsfw = Arc::new(
            MockNsfwClassifier::fixed(vec![ClassPrediction::new(NsfwClass::Neutral, 0.9)])
                .with_delay(Duration::from_millis(40)),
        );
        let endpoint = Arc::new(endpoint_with(
            nsfw.clone(),
            WorkerConfig {
                image_permits: 2,
                ..WorkerConfig::default()
            },
        ));

        let mut requests = tokio::task::JoinSet::new();
        for i in 0..10 {
            let endpoint = endpoint.clone();
            requests.spawn(async move {
                let raw = format!(
                    r#"{{"type":"classifyImage","requestId":"{}","payload":{{"src":"cat.png"}}}}"#,
                    i
                );
                endpoint.handle_json(&raw).await
            });
        }
        while let Some(reply) = requests.join_next().await {
            let reply: HostResponse = serde_json::from_str(&reply.unwrap()).unwrap();
            assert_eq!(reply.verdict, Some(Verdict::Clear));
        }
        assert_eq!(nsfw.calls(), 10);
        assert!(nsfw.max_in_flight() <= 2);
    }
}
