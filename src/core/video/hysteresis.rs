use crate::core::element::{MediaElement, Verdict};

/// 遮挡开关的去抖状态：开得快，关得慢
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HysteresisState {
    pub positive_streak: u32,
    pub negative_streak: u32,
    pub obstructed: bool,
}

impl HysteresisState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn of(element: &MediaElement) -> Self {
        Self {
            positive_streak: element.positive_streak,
            negative_streak: element.negative_streak,
            obstructed: element.obstructed,
        }
    }

    pub fn store(&self, element: &mut MediaElement) {
        element.positive_streak = self.positive_streak;
        element.negative_streak = self.negative_streak;
        element.obstructed = self.obstructed;
    }

    pub fn transition(
        &self,
        verdict: Verdict,
        config: &HysteresisConfig,
    ) -> (HysteresisState, ObstructionAction) {
        match verdict {
            Verdict::Nsfw | Verdict::Face => {
                let positive_streak = self.positive_streak + 1;
                let engage = !self.obstructed && positive_streak >= config.positive_threshold;
                (
                    HysteresisState {
                        positive_streak,
                        negative_streak: 0,
                        obstructed: self.obstructed || engage,
                    },
                    if engage {
                        ObstructionAction::Engage
                    } else {
                        ObstructionAction::Hold
                    },
                )
            }

            Verdict::Clear => {
                let negative_streak = self.negative_streak + 1;
                let release = self.obstructed && negative_streak >= config.negative_threshold;
                (
                    HysteresisState {
                        positive_streak: 0,
                        negative_streak,
                        obstructed: self.obstructed && !release,
                    },
                    if release {
                        ObstructionAction::Release
                    } else {
                        ObstructionAction::Hold
                    },
                )
            }

            // 出错的帧不改变计数，由错误预算处理
            Verdict::Error => (*self, ObstructionAction::Hold),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObstructionAction {
    Hold,
    Engage,
    Release,
}

#[derive(Debug, Clone)]
pub struct HysteresisConfig {
    pub positive_threshold: u32,
    pub negative_threshold: u32,
}

impl Default for HysteresisConfig {
    fn default() -> Self {
        Self {
            positive_threshold: 1,
            negative_threshold: 3,
        }
    }
}
