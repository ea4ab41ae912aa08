//! 展示层边界：只收遮挡开关和样式，CSS 归宿主管

use crate::core::element::ElementId;
use crate::core::settings::StyleSettings;
use std::collections::HashMap;
use std::sync::Mutex;

pub trait Presentation: Send + Sync {
    fn on_verdict_changed(&self, id: ElementId, should_obstruct: bool);

    /// Presentation-only settings, forwarded untouched.
    fn on_style_changed(&self, style: &StyleSettings) {
        let _ = style;
    }
}

/// 记录所有回调，测试用
#[derive(Default)]
pub struct RecordingPresentation {
    events: Mutex<Vec<(ElementId, bool)>>,
    styles: Mutex<Vec<StyleSettings>>,
}

impl RecordingPresentation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(ElementId, bool)> {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn events_for(&self, id: ElementId) -> Vec<bool> {
        self.events()
            .into_iter()
            .filter(|(e, _)| *e == id)
            .map(|(_, on)| on)
            .collect()
    }

    /// Last signal per element; elements never signalled are unobstructed.
    pub fn is_obstructed(&self, id: ElementId) -> bool {
        let latest: HashMap<ElementId, bool> = self.events().into_iter().collect();
        latest.get(&id).copied().unwrap_or(false)
    }

    pub fn styles(&self) -> Vec<StyleSettings> {
        self.styles
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

impl Presentation for RecordingPresentation {
    fn on_verdict_changed(&self, id: ElementId, should_obstruct: bool) {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((id, should_obstruct));
    }

    fn on_style_changed(&self, style: &StyleSettings) {
        self.styles
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(style.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latest_signal_wins() {
        let p = RecordingPresentation::new();
        p.on_verdict_changed(ElementId(1), true);
        p.on_verdict_changed(ElementId(2), true);
        p.on_verdict_changed(ElementId(1), false);

        assert!(!p.is_obstructed(ElementId(1)));
        assert!(p.is_obstructed(ElementId(2)));
        assert!(!p.is_obstructed(ElementId(3)));
        assert_eq!(p.events_for(ElementId(1)), vec![true, false]);
    }
}
