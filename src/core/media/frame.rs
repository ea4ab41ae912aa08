use crate::core::error::PipelineError;
use image::{DynamicImage, ImageOutputFormat, RgbaImage};
use std::io::Cursor;
use std::time::Duration;

/// 最大工作分辨率
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizeLimits {
    pub max_width: u32,
    pub max_height: u32,
}

impl ResizeLimits {
    pub const IMAGE: ResizeLimits = ResizeLimits {
        max_width: 400,
        max_height: 300,
    };
    // 保持 1920x1080 的比例
    pub const VIDEO: ResizeLimits = ResizeLimits {
        max_width: 1920 / 4,
        max_height: 1080 / 4,
    };
}

/// Scales `(width, height)` down to fit `limits`, preserving the aspect ratio.
///
/// Portrait input swaps the max width and height. Input already under both limits is
/// returned unchanged, as is input with an unknown (zero) side.
pub fn calc_resize(width: u32, height: u32, limits: ResizeLimits) -> (u32, u32) {
    if width == 0 || height == 0 {
        return (width, height);
    }

    let (mut max_w, mut max_h) = (limits.max_width, limits.max_height);
    if width < height {
        std::mem::swap(&mut max_w, &mut max_h);
    }

    if width < max_w && height < max_h {
        return (width, height);
    }

    let ratio = (max_w as f64 / width as f64).min(max_h as f64 / height as f64);
    let new_w = ((width as f64 * ratio).round() as u32).max(1);
    let new_h = ((height as f64 * ratio).round() as u32).max(1);
    (new_w, new_h)
}

/// 解码后的帧数据（RGBA）
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
    /// Playback position the frame was captured at; zero for still images.
    pub timestamp: Duration,
}

impl Frame {
    pub fn new(width: u32, height: u32, data: Vec<u8>, timestamp_ms: u64) -> Self {
        Self {
            width,
            height,
            data,
            timestamp: Duration::from_millis(timestamp_ms),
        }
    }

    /// Decodes PNG / JPEG / BMP bytes.
    pub fn decode(bytes: &[u8]) -> Result<Frame, PipelineError> {
        let rgba = image::load_from_memory(bytes)?.to_rgba8();
        let (width, height) = rgba.dimensions();
        Ok(Frame {
            width,
            height,
            data: rgba.into_raw(),
            timestamp: Duration::ZERO,
        })
    }

    fn to_image(&self) -> Result<RgbaImage, PipelineError> {
        RgbaImage::from_raw(self.width, self.height, self.data.clone()).ok_or_else(|| {
            PipelineError::Load(format!(
                "frame buffer of {} bytes does not match {}x{}",
                self.data.len(),
                self.width,
                self.height
            ))
        })
    }

    pub fn resize_to(&self, target_width: u32, target_height: u32) -> Result<Frame, PipelineError> {
        let img = self.to_image()?;
        let resized = image::imageops::resize(
            &img,
            target_width,
            target_height,
            image::imageops::FilterType::Triangle,
        );

        Ok(Frame {
            width: target_width,
            height: target_height,
            data: resized.into_raw(),
            timestamp: self.timestamp,
        })
    }

    /// Downscales to the working resolution; frames already inside `limits` pass through.
    pub fn fit_within(self, limits: ResizeLimits) -> Result<Frame, PipelineError> {
        let (w, h) = calc_resize(self.width, self.height, limits);
        if (w, h) == (self.width, self.height) {
            return Ok(self);
        }
        self.resize_to(w, h)
    }

    /// 编码为 JPEG，用于跨上下文传帧
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>, PipelineError> {
        let rgb = DynamicImage::ImageRgba8(self.to_image()?).to_rgb8();
        let mut buffer = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(rgb).write_to(&mut buffer, ImageOutputFormat::Jpeg(quality))?;
        Ok(buffer.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_creation() {
        let data = vec![255u8; 100 * 100 * 4]; // 100x100 white image
        let frame = Frame::new(100, 100, data, 1000);

        assert_eq!(frame.width, 100);
        assert_eq!(frame.data.len(), 40000);
        assert_eq!(frame.timestamp.as_millis(), 1000);
    }

    #[test]
    fn test_frame_resize() {
        let frame = Frame::new(100, 100, vec![255u8; 100 * 100 * 4], 0);
        let resized = frame.resize_to(32, 32).unwrap();

        assert_eq!(resized.width, 32);
        assert_eq!(resized.data.len(), 32 * 32 * 4);
    }

    #[test]
    fn test_mismatched_buffer_is_load_error() {
        let frame = Frame::new(10, 10, vec![0u8; 12], 0);
        assert!(matches!(frame.resize_to(5, 5), Err(PipelineError::Load(_))));
    }

    #[test]
    fn test_calc_resize() {
        assert_eq!(calc_resize(1920, 1080, ResizeLimits::VIDEO), (480, 270));
        // 竖屏时交换宽高上限
        assert_eq!(calc_resize(1080, 1920, ResizeLimits::VIDEO), (270, 480));
        assert_eq!(calc_resize(100, 80, ResizeLimits::IMAGE), (100, 80));
        assert_eq!(calc_resize(800, 300, ResizeLimits::IMAGE), (400, 150));
        assert_eq!(calc_resize(0, 0, ResizeLimits::IMAGE), (0, 0));
    }

    #[test]
    fn test_jpeg_round_trip_keeps_size() {
        let frame = Frame::new(16, 8, vec![128u8; 16 * 8 * 4], 0);
        let bytes = frame.encode_jpeg(60).unwrap();
        let decoded = Frame::decode(&bytes).unwrap();
        assert_eq!((decoded.width, decoded.height), (16, 8));
    }

    #[test]
    fn test_fit_within() {
        let frame = Frame::new(800, 600, vec![0u8; 800 * 600 * 4], 0);
        let fitted = frame.fit_within(ResizeLimits::IMAGE).unwrap();
        assert_eq!((fitted.width, fitted.height), (400, 300));
    }
}
