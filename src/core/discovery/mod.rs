//! 页面元素变更事件
//!
//! 流水线不负责观察页面，只消费宿主推过来的事件。

mod html;

pub use html::scan_document;

use crate::core::element::{Dimensions, ElementId, MediaKind};
use std::sync::atomic::{AtomicU64, Ordering};

/// Attribute whose change gives the element a new identity.
pub const SOURCE_ATTRIBUTE: &str = "src";

/// Snapshot of one page node and its subtree at the time of the event.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSnapshot {
    pub id: ElementId,
    /// Lowercase tag name.
    pub tag: String,
    pub source: Option<String>,
    pub dimensions: Dimensions,
    pub children: Vec<NodeSnapshot>,
}

impl NodeSnapshot {
    pub fn new(id: ElementId, tag: &str) -> Self {
        Self {
            id,
            tag: tag.to_ascii_lowercase(),
            source: None,
            dimensions: Dimensions::default(),
            children: Vec::new(),
        }
    }

    pub fn image(id: ElementId, source: &str, width: u32, height: u32) -> Self {
        Self::new(id, "img")
            .with_source(source)
            .with_dimensions(width, height)
    }

    pub fn video(id: ElementId, source: &str) -> Self {
        Self::new(id, "video").with_source(source)
    }

    pub fn with_source(mut self, source: &str) -> Self {
        self.source = Some(source.to_string());
        self
    }

    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.dimensions = Dimensions::new(width, height);
        self
    }

    pub fn with_child(mut self, child: NodeSnapshot) -> Self {
        self.children.push(child);
        self
    }

    pub fn media_kind(&self) -> Option<MediaKind> {
        match self.tag.as_str() {
            "img" => Some(MediaKind::Image),
            "video" => Some(MediaKind::Video),
            _ => None,
        }
    }

    /// Non-empty source, if any.
    pub fn media_source(&self) -> Option<&str> {
        self.source.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }

    /// 自身及所有后代中的图片 / 视频节点，先序遍历
    pub fn media_nodes(&self) -> Vec<&NodeSnapshot> {
        let mut found = Vec::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            if node.media_kind().is_some() {
                found.push(node);
            }
            stack.extend(node.children.iter().rev());
        }
        found
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Playing,
    Paused,
}

/// Element change feed consumed by the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Added(Vec<NodeSnapshot>),
    AttributeChanged { node: NodeSnapshot, attribute: String },
    Removed(Vec<ElementId>),
    VisibilityChanged { id: ElementId, visible: bool },
    Playback { id: ElementId, state: PlaybackState },
}

/// 宿主没有稳定 id 时用它分配
#[derive(Debug, Default)]
pub struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    pub fn next_id(&self) -> ElementId {
        ElementId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}
