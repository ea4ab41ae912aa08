use super::{ClassPrediction, NsfwClass};

/// 每个类别的阈值在宽松值和严格值之间随 strictness 线性插值
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassThreshold {
    pub class: NsfwClass,
    /// Threshold at strictness 0.
    pub lenient: f32,
    /// Threshold at strictness 1.
    pub strict: f32,
}

impl ClassThreshold {
    pub fn at(&self, strictness: f32) -> f32 {
        let s = strictness.clamp(0.0, 1.0);
        self.lenient + (self.strict - self.lenient) * s
    }
}

// 数值来自反复试验：不安全类别越严越低，Neutral 越严越高
const TABLE: [ClassThreshold; 5] = [
    ClassThreshold {
        class: NsfwClass::Drawing,
        lenient: 0.5,
        strict: 0.5,
    },
    ClassThreshold {
        class: NsfwClass::Hentai,
        lenient: 1.0,
        strict: 0.5,
    },
    ClassThreshold {
        class: NsfwClass::Neutral,
        lenient: 0.5,
        strict: 1.0,
    },
    ClassThreshold {
        class: NsfwClass::Porn,
        lenient: 0.5,
        strict: 0.1,
    },
    ClassThreshold {
        class: NsfwClass::Sexy,
        lenient: 0.5,
        strict: 0.1,
    },
];

pub fn threshold_for(class: NsfwClass, strictness: f32) -> f32 {
    TABLE
        .iter()
        .find(|t| t.class == class)
        .map(|t| t.at(strictness))
        .unwrap_or(1.0)
}

/// Nsfw iff the best unsafe margin beats the best safe margin. Margins start at zero,
/// so predictions all under their thresholds never count as Nsfw.
pub fn contains_nsfw(predictions: &[ClassPrediction], strictness: f32) -> bool {
    if predictions.is_empty() {
        return false;
    }

    let mut highest_unsafe = 0.0f32;
    let mut highest_safe = 0.0f32;
    for prediction in predictions {
        let margin = prediction.probability - threshold_for(prediction.class, strictness);
        if prediction.class.is_unsafe() {
            highest_unsafe = highest_unsafe.max(margin);
        } else {
            highest_safe = highest_safe.max(margin);
        }
    }
    highest_unsafe > highest_safe
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-5
    }

    #[test]
    fn test_thresholds_are_monotonic() {
        for t in TABLE.iter() {
            let low = t.at(0.0);
            let high = t.at(1.0);
            if t.class.is_unsafe() {
                assert!(high <= low, "{:?}", t.class);
            } else {
                assert!(high >= low, "{:?}", t.class);
            }
        }
        assert!(approx(threshold_for(NsfwClass::Porn, 0.9), 0.14));
        assert!(approx(threshold_for(NsfwClass::Neutral, 0.9), 0.95));
    }

    #[test]
    fn test_high_strictness_flags_low_porn_score() {
        let preds = [
            ClassPrediction::new(NsfwClass::Porn, 0.2),
            ClassPrediction::new(NsfwClass::Neutral, 0.7),
        ];
        assert!(contains_nsfw(&preds, 0.9));
        // 宽松模式下同样的分数不算
        assert!(!contains_nsfw(&preds, 0.0));
    }

    #[test]
    fn test_safe_margin_wins() {
        let preds = [
            ClassPrediction::new(NsfwClass::Drawing, 0.9),
            ClassPrediction::new(NsfwClass::Sexy, 0.6),
        ];
        // Drawing margin 0.4 > Sexy margin 0.6 - 0.3 = 0.3
        assert!(!contains_nsfw(&preds, 0.5));
    }

    #[test]
    fn test_empty_predictions() {
        assert!(!contains_nsfw(&[], 1.0));
    }
}
