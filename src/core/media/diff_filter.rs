use super::frame::Frame;

/// 帧差判定：pHash + 亮度直方图，判断与上一帧相比是否有明显变化
pub struct FrameDiffFilter {
    sample_size: (u32, u32),
    threshold: f32,
    last_hash: Option<u64>,
    last_histogram: Option<[u32; 64]>,
}

impl FrameDiffFilter {
    pub fn new() -> Self {
        Self::with_threshold(0.10)
    }

    /// `threshold` of 0 makes every frame count as changed.
    pub fn with_threshold(threshold: f32) -> Self {
        Self {
            sample_size: (8, 8),
            threshold,
            last_hash: None,
            last_histogram: None,
        }
    }

    /// Returns true when `frame` differs enough from the previous one. Undecodable frames
    /// always count as changed.
    pub fn has_changed(&mut self, frame: &Frame) -> bool {
        let resized = match frame.resize_to(self.sample_size.0, self.sample_size.1) {
            Ok(resized) => resized,
            Err(_) => {
                self.reset();
                return true;
            }
        };
        let (gray, mean) = Self::to_grayscale(&resized);

        let current_hash = Self::phash(&gray, mean);
        let current_histogram = Self::histogram(&gray);

        let changed =
            if let (Some(last_hash), Some(last_hist)) = (self.last_hash, self.last_histogram) {
                let hash_diff = Self::hamming_distance(current_hash, last_hash) as f32 / 64.0;
                let hist_sim = Self::histogram_similarity(&current_histogram, &last_hist);

                let combined_score = hash_diff * 0.5 + (1.0 - hist_sim) * 0.5;
                combined_score >= self.threshold
            } else {
                true
            };

        self.last_hash = Some(current_hash);
        self.last_histogram = Some(current_histogram);

        changed
    }

    fn to_grayscale(frame: &Frame) -> (Vec<u8>, u8) {
        let mut sum = 0u32;
        let gray: Vec<u8> = frame
            .data
            .chunks_exact(4)
            .map(|rgba| {
                let val =
                    (rgba[0] as u32 * 299 + rgba[1] as u32 * 587 + rgba[2] as u32 * 114) / 1000;
                sum += val;
                val as u8
            })
            .collect();
        let mean = if gray.is_empty() {
            0
        } else {
            (sum / gray.len() as u32) as u8
        };
        (gray, mean)
    }

    fn phash(gray: &[u8], mean: u8) -> u64 {
        let mut hash: u64 = 0;
        for (i, &val) in gray.iter().enumerate().take(56) {
            if val > mean {
                hash |= 1 << i;
            }
        }

        let brightness = (mean as u64) << 56;
        hash | brightness
    }

    /// 64 bins
    fn histogram(gray: &[u8]) -> [u32; 64] {
        let mut hist = [0u32; 64];
        for &val in gray {
            hist[(val >> 2) as usize] += 1;
        }
        hist
    }

    fn hamming_distance(a: u64, b: u64) -> u32 {
        (a ^ b).count_ones()
    }

    fn histogram_similarity(h1: &[u32; 64], h2: &[u32; 64]) -> f32 {
        let dot: u32 = h1.iter().zip(h2.iter()).map(|(a, b)| a.min(b)).sum();
        let sum1: u32 = h1.iter().sum();
        let sum2: u32 = h2.iter().sum();

        if sum1 == 0 || sum2 == 0 {
            return 0.0;
        }

        dot as f32 / sum1.max(sum2) as f32
    }

    pub fn reset(&mut self) {
        self.last_hash = None;
        self.last_histogram = None;
    }
}

impl Default for FrameDiffFilter {
    fn default() -> Self {
        Self::new()
    }
}
