use super::{Dimensions, ElementId, MediaElement, MediaKind, Status};
use crate::core::error::PipelineError;
use log::debug;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Outcome of observing a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Should be offered to the load queue for this round.
    Admit { round: u64 },
    /// Already queued or done for the current source.
    Skip,
    /// Source changed while still in flight below `Processing`; the pending work picks it up.
    SourceUpdated,
}

/// 元素旁路表：只记录仍挂在页面上的节点，移除即删除
#[derive(Default)]
pub struct ElementRegistry {
    elements: Mutex<HashMap<ElementId, MediaElement>>,
}

impl ElementRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ElementId, MediaElement>> {
        self.elements
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a node or re-evaluates it after a source change.
    pub fn observe(
        &self,
        id: ElementId,
        kind: MediaKind,
        source: &str,
        dimensions: Dimensions,
    ) -> Admission {
        let mut elements = self.lock();

        let element = match elements.get_mut(&id) {
            None => {
                elements.insert(id, MediaElement::new(id, kind, source.to_string(), dimensions));
                debug!("element {} observed ({:?})", id, kind);
                return Admission::Admit { round: 0 };
            }
            Some(element) => element,
        };

        if dimensions.is_known() {
            element.dimensions = dimensions;
        }

        // 同一内容不重试，包括 Error：只有换了 src 才重新来过
        if element.source == source {
            return match element.status {
                Status::Observed => Admission::Admit { round: element.round },
                _ => Admission::Skip,
            };
        }

        if element.status.is_in_flight_below_processing() {
            element.source = source.to_string();
            debug!("element {} source updated while {:?}", id, element.status);
            return Admission::SourceUpdated;
        }

        // 内容换了，当作新元素处理
        element.source = source.to_string();
        element.kind = kind;
        element.reset();
        debug!("element {} source changed, round {}", id, element.round);
        Admission::Admit { round: element.round }
    }

    /// Moves an element forward inside `round`. Returns the previous status.
    pub fn transition(&self, id: ElementId, round: u64, to: Status) -> Result<Status, PipelineError> {
        let mut elements = self.lock();
        let element = elements
            .get_mut(&id)
            .ok_or(PipelineError::UnknownElement(id.0))?;

        if element.round != round {
            return Err(PipelineError::StaleRound {
                stale: round,
                current: element.round,
            });
        }

        let from = element.status;
        if to != Status::Error && to.rank() < from.rank() {
            return Err(PipelineError::Regression { from, to });
        }

        element.status = to;
        debug!("element {} {:?} -> {:?} (round {})", id, from, to, round);
        Ok(from)
    }

    /// Explicit reset, used when pending work finds the source replaced under it.
    /// Returns the new round.
    pub fn restart(&self, id: ElementId) -> Option<u64> {
        let mut elements = self.lock();
        let element = elements.get_mut(&id)?;
        element.reset();
        debug!("element {} restarted, round {}", id, element.round);
        Some(element.round)
    }

    /// Runs `f` against the element if it is still in `round`.
    pub fn with_element<R>(
        &self,
        id: ElementId,
        round: u64,
        f: impl FnOnce(&mut MediaElement) -> R,
    ) -> Result<R, PipelineError> {
        let mut elements = self.lock();
        let element = elements
            .get_mut(&id)
            .ok_or(PipelineError::UnknownElement(id.0))?;
        if element.round != round {
            return Err(PipelineError::StaleRound {
                stale: round,
                current: element.round,
            });
        }
        Ok(f(element))
    }

    pub fn get(&self, id: ElementId) -> Option<MediaElement> {
        self.lock().get(&id).cloned()
    }

    pub fn contains(&self, id: ElementId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn remove(&self, id: ElementId) -> Option<MediaElement> {
        self.lock().remove(&id)
    }

    /// Returns the previous visibility, `None` for unknown elements.
    pub fn set_visible(&self, id: ElementId, visible: bool) -> Option<bool> {
        let mut elements = self.lock();
        let element = elements.get_mut(&id)?;
        let previous = element.visible;
        element.visible = visible;
        Some(previous)
    }

    pub fn count_with_status(&self, status: Status) -> usize {
        self.lock().values().filter(|e| e.status == status).count()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 把满足条件且还没停用的元素标记为 Disabled 并开启新一轮。
    /// Returns `(id, was_obstructed)` for every element it disabled; already disabled ones are left alone.
    pub fn disable_where(
        &self,
        mut pred: impl FnMut(&MediaElement) -> bool,
    ) -> Vec<(ElementId, bool)> {
        let mut disabled = Vec::new();
        for element in self.lock().values_mut() {
            if element.status == Status::Disabled || !pred(element) {
                continue;
            }
            let was_obstructed = std::mem::replace(&mut element.obstructed, false);
            element.reset();
            element.status = Status::Disabled;
            disabled.push((element.id, was_obstructed));
        }
        disabled.sort();
        disabled
    }

    /// Explicit reset of the `Disabled` elements matching `pred`; returns `(id, round)` to enqueue.
    pub fn reenable_where(
        &self,
        mut pred: impl FnMut(&MediaElement) -> bool,
    ) -> Vec<(ElementId, u64)> {
        let mut admitted = Vec::new();
        for element in self.lock().values_mut() {
            if element.status == Status::Disabled && pred(element) {
                element.reset();
                admitted.push((element.id, element.round));
            }
        }
        admitted.sort();
        admitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(registry: &ElementRegistry, id: u64, src: &str) -> Admission {
        registry.observe(ElementId(id), MediaKind::Image, src, Dimensions::new(200, 200))
    }

    #[test]
    fn test_observe_is_idempotent_once_queued() {
        let registry = ElementRegistry::new();
        assert_eq!(image(&registry, 1, "a.png"), Admission::Admit { round: 0 });
        registry.transition(ElementId(1), 0, Status::Queued).unwrap();
        assert_eq!(image(&registry, 1, "a.png"), Admission::Skip);
    }

    #[test]
    fn test_monotonic_within_round() {
        let registry = ElementRegistry::new();
        image(&registry, 1, "a.png");
        let id = ElementId(1);
        for status in [Status::Queued, Status::Loading, Status::Loaded, Status::Processing] {
            registry.transition(id, 0, status).unwrap();
        }
        let err = registry.transition(id, 0, Status::Queued).unwrap_err();
        assert!(matches!(err, PipelineError::Regression { .. }));

        // Error 可以从任何状态进入
        registry.transition(id, 0, Status::Error).unwrap();
        assert_eq!(registry.get(id).unwrap().status, Status::Error);
    }

    #[test]
    fn test_source_change_resets_processed_element() {
        let registry = ElementRegistry::new();
        let id = ElementId(7);
        image(&registry, 7, "a.png");
        for status in [Status::Queued, Status::Loading, Status::Loaded, Status::Processing, Status::Processed] {
            registry.transition(id, 0, status).unwrap();
        }

        assert_eq!(image(&registry, 7, "b.png"), Admission::Admit { round: 1 });
        let element = registry.get(id).unwrap();
        assert_eq!(element.status, Status::Observed);
        assert_eq!(element.source, "b.png");

        let stale = registry.transition(id, 0, Status::Processed).unwrap_err();
        assert!(matches!(stale, PipelineError::StaleRound { stale: 0, current: 1 }));
    }

    #[test]
    fn test_source_change_in_flight_keeps_round() {
        let registry = ElementRegistry::new();
        let id = ElementId(3);
        image(&registry, 3, "a.png");
        registry.transition(id, 0, Status::Queued).unwrap();

        assert_eq!(image(&registry, 3, "b.png"), Admission::SourceUpdated);
        let element = registry.get(id).unwrap();
        assert_eq!(element.round, 0);
        assert_eq!(element.source, "b.png");
    }

    #[test]
    fn test_errored_element_is_not_retried_for_same_source() {
        let registry = ElementRegistry::new();
        let id = ElementId(4);
        image(&registry, 4, "a.png");
        registry.transition(id, 0, Status::Error).unwrap();

        // 节点被挪动后重复上报，不应该重试
        assert_eq!(image(&registry, 4, "a.png"), Admission::Skip);
        assert_eq!(registry.get(id).unwrap().status, Status::Error);

        assert_eq!(image(&registry, 4, "b.png"), Admission::Admit { round: 1 });
    }

    #[test]
    fn test_restart_bumps_round() {
        let registry = ElementRegistry::new();
        let id = ElementId(5);
        image(&registry, 5, "a.png");
        registry.transition(id, 0, Status::Loading).unwrap();

        assert_eq!(registry.restart(id), Some(1));
        assert_eq!(registry.get(id).unwrap().status, Status::Observed);
        assert_eq!(registry.restart(ElementId(99)), None);
    }

    #[test]
    fn test_disable_and_reenable() {
        let registry = ElementRegistry::new();
        image(&registry, 1, "a.png");
        image(&registry, 2, "b.png");
        registry
            .with_element(ElementId(2), 0, |e| e.obstructed = true)
            .unwrap();

        assert_eq!(
            registry.disable_where(|_| true),
            vec![(ElementId(1), false), (ElementId(2), true)]
        );
        assert!(!registry.get(ElementId(2)).unwrap().obstructed);
        assert_eq!(registry.count_with_status(Status::Disabled), 2);
        // 已经停用的不再重复处理
        assert!(registry.disable_where(|_| true).is_empty());

        let admitted = registry.reenable_where(|_| true);
        assert_eq!(admitted, vec![(ElementId(1), 2), (ElementId(2), 2)]);
        assert_eq!(registry.count_with_status(Status::Observed), 2);
    }

    #[test]
    fn test_disable_by_kind() {
        let registry = ElementRegistry::new();
        image(&registry, 1, "a.png");
        registry.observe(ElementId(2), MediaKind::Video, "v.mp4", Dimensions::default());

        let disabled = registry.disable_where(|e| e.kind == MediaKind::Image);
        assert_eq!(disabled, vec![(ElementId(1), false)]);
        assert_eq!(registry.get(ElementId(2)).unwrap().status, Status::Observed);

        assert!(registry.reenable_where(|e| e.kind == MediaKind::Video).is_empty());
        assert_eq!(registry.reenable_where(|e| e.kind == MediaKind::Image), vec![(ElementId(1), 2)]);
    }
}
