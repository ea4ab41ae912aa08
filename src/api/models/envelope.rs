use crate::core::element::Verdict;
use serde::{Deserialize, Serialize};

/// 跨上下文请求信封
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HostRequest {
    ClassifyImage {
        #[serde(rename = "requestId")]
        request_id: String,
        payload: ImagePayload,
    },
    ClassifyFrame {
        #[serde(rename = "requestId")]
        request_id: String,
        payload: FramePayload,
    },
}

impl HostRequest {
    pub fn request_id(&self) -> &str {
        match self {
            HostRequest::ClassifyImage { request_id, .. } => request_id,
            HostRequest::ClassifyFrame { request_id, .. } => request_id,
        }
    }
}

/// 图片请求：宽高为 0 表示未知
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagePayload {
    pub src: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    /// Host-side request time in milliseconds, echoed back.
    #[serde(default)]
    pub timestamp: u64,
}

/// 视频帧：JPEG 字节 + 采集时刻（毫秒）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FramePayload {
    pub data: Vec<u8>,
    #[serde(default)]
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostResponse {
    #[serde(rename = "requestId")]
    pub request_id: String,
    /// `None` when the frame was skipped.
    pub verdict: Option<Verdict>,
    #[serde(default)]
    pub skipped: bool,
    /// Frame capture time (or the image request time) echoed back, in milliseconds.
    #[serde(default)]
    pub timestamp: u64,
}

impl HostResponse {
    pub fn verdict(request_id: &str, verdict: Verdict, timestamp: u64) -> Self {
        Self {
            request_id: request_id.to_string(),
            verdict: Some(verdict),
            skipped: false,
            timestamp,
        }
    }

    pub fn skipped(request_id: &str, timestamp: u64) -> Self {
        Self {
            request_id: request_id.to_string(),
            verdict: None,
            skipped: true,
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_classify_image_request() {
        let json = r#"{"type":"classifyImage","requestId":"r1","payload":{"src":"https://a.com/x.png","width":640,"height":480,"timestamp":77}}"#;
        let request: HostRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.request_id(), "r1");
        match request {
            HostRequest::ClassifyImage { payload, .. } => {
                assert_eq!(payload.src, "https://a.com/x.png");
                assert_eq!(payload.width, 640);
                assert_eq!(payload.timestamp, 77);
            }
            _ => panic!("应该是 classifyImage"),
        }
    }

    #[test]
    fn test_skipped_response_has_no_verdict() {
        let json = serde_json::to_string(&HostResponse::skipped("r2", 120)).unwrap();
        assert!(json.contains("\"verdict\":null"));
        assert!(json.contains("\"skipped\":true"));
        assert!(json.contains("\"timestamp\":120"));
    }

    #[test]
    fn test_verdict_serializes_lowercase_with_timestamp() {
        let json = serde_json::to_string(&HostResponse::verdict("r3", Verdict::Nsfw, 0)).unwrap();
        assert!(json.contains("\"verdict\":\"nsfw\""));
        assert!(json.contains("\"timestamp\":0"));
    }
}
