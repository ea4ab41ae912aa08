use super::SettingsSnapshot;
use crate::core::error::PipelineError;
use log::{info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

pub type SettingsCallback = Arc<dyn Fn(&SettingsSnapshot) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingsEvent {
    /// Any replacement of the snapshot.
    Changed,
    /// The master switch flipped.
    Toggled,
    /// A presentation-only value changed.
    StyleChanged,
}

/// Read side of the settings channel, injected into every component.
#[derive(Clone)]
pub struct SettingsHandle {
    rx: watch::Receiver<Arc<SettingsSnapshot>>,
}

impl SettingsHandle {
    pub fn current(&self) -> Arc<SettingsSnapshot> {
        self.rx.borrow().clone()
    }

    /// Fixed snapshot without a backing store, mostly for tests.
    pub fn fixed(settings: SettingsSnapshot) -> Self {
        let (_tx, rx) = watch::channel(Arc::new(settings));
        Self { rx }
    }
}

/// 设置存储 - 整体替换 + 按事件名分组的订阅列表
pub struct SettingsStore {
    tx: watch::Sender<Arc<SettingsSnapshot>>,
    subscribers: Mutex<HashMap<SettingsEvent, Vec<SettingsCallback>>>,
}

impl SettingsStore {
    pub fn new(initial: SettingsSnapshot) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(initial));
        Self {
            tx,
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Builds a store from persisted text; malformed text yields a disabled store.
    pub fn load(text: &str) -> (Self, Option<PipelineError>) {
        match SettingsSnapshot::parse(text) {
            Ok(settings) => (Self::new(settings), None),
            Err(e) => {
                warn!("⚠️ Settings rejected, detection disabled: {}", e);
                (Self::new(SettingsSnapshot::disabled()), Some(e))
            }
        }
    }

    pub fn current(&self) -> Arc<SettingsSnapshot> {
        self.tx.borrow().clone()
    }

    pub fn handle(&self) -> SettingsHandle {
        SettingsHandle {
            rx: self.tx.subscribe(),
        }
    }

    pub fn on_settings_changed<F>(&self, callback: F)
    where
        F: Fn(&SettingsSnapshot) + Send + Sync + 'static,
    {
        self.subscribe(SettingsEvent::Changed, Arc::new(callback));
    }

    pub fn on_toggle<F>(&self, callback: F)
    where
        F: Fn(&SettingsSnapshot) + Send + Sync + 'static,
    {
        self.subscribe(SettingsEvent::Toggled, Arc::new(callback));
    }

    pub fn on_style_changed<F>(&self, callback: F)
    where
        F: Fn(&SettingsSnapshot) + Send + Sync + 'static,
    {
        self.subscribe(SettingsEvent::StyleChanged, Arc::new(callback));
    }

    pub fn subscribe(&self, event: SettingsEvent, callback: SettingsCallback) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.entry(event).or_default().push(callback);
    }

    /// Replaces the snapshot wholesale and notifies subscribers.
    pub fn replace(&self, next: SettingsSnapshot) {
        let next = Arc::new(next);
        let previous = self.tx.send_replace(next.clone());

        let mut events = vec![SettingsEvent::Changed];
        if previous.enabled != next.enabled {
            events.push(SettingsEvent::Toggled);
        }
        if previous.style() != next.style() {
            events.push(SettingsEvent::StyleChanged);
        }
        info!("⚙️ Settings replaced, events: {:?}", events);

        for event in events {
            for callback in self.callbacks(event) {
                callback(&next);
            }
        }
    }

    /// 单个键的增量更新，生成新快照后整体替换
    pub fn update(&self, key: &str, value: serde_json::Value) -> Result<(), PipelineError> {
        let next = self.current().apply(key, value)?;
        self.replace(next);
        Ok(())
    }

    fn callbacks(&self, event: SettingsEvent) -> Vec<SettingsCallback> {
        let subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.get(&event).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_handle_sees_replacement() {
        let store = SettingsStore::new(SettingsSnapshot::default());
        let handle = store.handle();
        let before = handle.current();

        store.update("strictness", json!(0.9)).unwrap();

        assert_eq!(before.strictness, 0.5);
        assert_eq!(handle.current().strictness, 0.9);
    }

    #[test]
    fn test_events_per_name() {
        let store = SettingsStore::new(SettingsSnapshot::default());
        let changed = Arc::new(AtomicUsize::new(0));
        let toggled = Arc::new(AtomicUsize::new(0));
        let styled = Arc::new(AtomicUsize::new(0));

        let c = changed.clone();
        store.on_settings_changed(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let t = toggled.clone();
        store.on_toggle(move |s| {
            assert!(!s.enabled);
            t.fetch_add(1, Ordering::SeqCst);
        });
        let st = styled.clone();
        store.on_style_changed(move |_| {
            st.fetch_add(1, Ordering::SeqCst);
        });

        store.update("blurMale", json!(true)).unwrap();
        assert_eq!(changed.load(Ordering::SeqCst), 1);
        assert_eq!(toggled.load(Ordering::SeqCst), 0);
        assert_eq!(styled.load(Ordering::SeqCst), 0);

        store.update("status", json!(false)).unwrap();
        assert_eq!(changed.load(Ordering::SeqCst), 2);
        assert_eq!(toggled.load(Ordering::SeqCst), 1);
        // 关闭后 blur_amount 归零，也算样式变化
        assert_eq!(styled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_load_malformed_disables_detection() {
        let (store, err) = SettingsStore::load("{ status: true, strictness: ");
        assert!(matches!(err, Some(PipelineError::Config(_))));
        assert!(!store.current().should_detect());
    }
}
