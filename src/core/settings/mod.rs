//! 用户设置快照
//!
//! 每次变更都整体替换，读者只持有 `Arc<SettingsSnapshot>`，不会看到半更新状态。

mod store;

pub use store::{SettingsCallback, SettingsEvent, SettingsHandle, SettingsStore};

use crate::core::error::PipelineError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static HOST_PATTERN: Lazy<Result<Regex, regex::Error>> =
    Lazy::new(|| Regex::new(r"^(?:[a-zA-Z][a-zA-Z0-9+.\-]*://)?(?:[^@/]*@)?([^/:?#]+)"));

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsSnapshot {
    /// 总开关
    #[serde(rename = "status")]
    pub enabled: bool,
    #[serde(rename = "blurImages")]
    pub detect_images: bool,
    #[serde(rename = "blurVideos")]
    pub detect_videos: bool,
    #[serde(rename = "blurMale")]
    pub detect_male: bool,
    #[serde(rename = "blurFemale")]
    pub detect_female: bool,
    /// 0.0 - 1.0，越大越敏感
    pub strictness: f32,

    // 以下仅供展示层使用，原样透传
    #[serde(rename = "blurAmount")]
    pub blur_amount: u32,
    #[serde(rename = "gray")]
    pub grayscale: bool,
    #[serde(rename = "unblurImages")]
    pub unblur_images_on_hover: bool,
    #[serde(rename = "unblurVideos")]
    pub unblur_videos_on_hover: bool,
    #[serde(rename = "blurryStartMode")]
    pub blurry_start_mode: bool,

    pub whitelist: Vec<String>,
}

impl Default for SettingsSnapshot {
    fn default() -> Self {
        Self {
            enabled: true,
            detect_images: true,
            detect_videos: true,
            detect_male: false,
            detect_female: true,
            strictness: 0.5,
            blur_amount: 20,
            grayscale: true,
            unblur_images_on_hover: false,
            unblur_videos_on_hover: false,
            blurry_start_mode: false,
            whitelist: Vec::new(),
        }
    }
}

/// Presentation-only subset forwarded to the style layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StyleSettings {
    pub blur_amount: u32,
    pub grayscale: bool,
    pub unblur_images_on_hover: bool,
    pub unblur_videos_on_hover: bool,
}

impl SettingsSnapshot {
    /// Snapshot used whenever configuration cannot be trusted.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// 解析持久化的设置（JSON5，容忍注释和尾逗号）
    pub fn parse(text: &str) -> Result<Self, PipelineError> {
        let snapshot: SettingsSnapshot = json5::from_str(text)?;
        snapshot.validate()?;
        Ok(snapshot)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if !(0.0..=1.0).contains(&self.strictness) {
            return Err(PipelineError::Config(format!(
                "strictness {} outside [0, 1]",
                self.strictness
            )));
        }
        Ok(())
    }

    /// Returns a new snapshot with one persisted key replaced.
    pub fn apply(&self, key: &str, value: serde_json::Value) -> Result<Self, PipelineError> {
        let mut raw = serde_json::to_value(self)?;
        let fields = raw
            .as_object_mut()
            .ok_or_else(|| PipelineError::Config("settings are not an object".to_string()))?;
        if !fields.contains_key(key) {
            return Err(PipelineError::Config(format!("unknown setting: {}", key)));
        }
        fields.insert(key.to_string(), value);

        let next: SettingsSnapshot = serde_json::from_value(raw)?;
        next.validate()?;
        Ok(next)
    }

    pub fn should_detect_gender(&self) -> bool {
        self.enabled && (self.detect_male || self.detect_female)
    }

    /// NSFW 分类不依赖性别开关，所以只要开启了图片或视频就需要检测
    pub fn should_detect(&self) -> bool {
        let nsfw_without_gender = true;
        self.enabled
            && (self.detect_images || self.detect_videos)
            && (self.detect_male || self.detect_female || nsfw_without_gender)
    }

    pub fn should_detect_images(&self) -> bool {
        self.should_detect() && self.detect_images
    }

    pub fn should_detect_videos(&self) -> bool {
        self.should_detect() && self.detect_videos
    }

    /// Effective strictness; zero when detection is off.
    pub fn effective_strictness(&self) -> f32 {
        if !self.should_detect() {
            return 0.0;
        }
        self.strictness
    }

    pub fn style(&self) -> StyleSettings {
        StyleSettings {
            blur_amount: if self.should_detect() { self.blur_amount } else { 0 },
            grayscale: self.should_detect() && self.grayscale,
            unblur_images_on_hover: self.enabled && self.unblur_images_on_hover,
            unblur_videos_on_hover: self.enabled && self.unblur_videos_on_hover,
        }
    }

    pub fn is_whitelisted(&self, host: &str) -> bool {
        let host = normalize_host(host);
        self.whitelist
            .iter()
            .any(|entry| normalize_host(entry) == host)
    }
}

/// 去掉前缀 `www.` 并转小写
pub fn normalize_host(host: &str) -> String {
    let host = host.trim().to_ascii_lowercase();
    match host.strip_prefix("www.") {
        Some(stripped) => stripped.to_string(),
        None => host,
    }
}

/// Extracts the hostname portion of a page URL.
pub fn host_of(url: &str) -> Option<String> {
    let pattern = HOST_PATTERN.as_ref().ok()?;
    pattern
        .captures(url.trim())
        .and_then(|caps| caps.get(1))
        .map(|m| normalize_host(m.as_str()))
        .filter(|h| !h.is_empty())
}
