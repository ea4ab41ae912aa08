//! 媒体元素的数据模型与生命周期状态

mod registry;

pub use registry::{Admission, ElementRegistry};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identity of a node, assigned by the element change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ElementId(pub u64);

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaKind {
    Image,
    Video,
}

/// 元素生命周期状态，`rank` 用于判断是否回退
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Error,
    Observed,
    Queued,
    Loading,
    Loaded,
    Processing,
    Processed,
    /// Too small or undecodable.
    Invalid,
    /// Excluded by the user.
    Disabled,
}

impl Status {
    pub fn rank(self) -> i8 {
        match self {
            Status::Error => -1,
            Status::Observed => 0,
            Status::Queued => 1,
            Status::Loading => 2,
            Status::Loaded => 3,
            Status::Processing => 4,
            Status::Processed => 5,
            Status::Invalid | Status::Disabled => 9,
        }
    }

    /// Queued, loading or waiting for a detection slot.
    pub fn is_in_flight_below_processing(self) -> bool {
        matches!(self, Status::Queued | Status::Loading | Status::Loaded)
    }
}

/// 单帧 / 单图的分类结论
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Clear,
    Nsfw,
    Face,
    Error,
}

impl Verdict {
    pub fn should_obstruct(self) -> bool {
        matches!(self, Verdict::Nsfw | Verdict::Face)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// 0x0 表示还没加载完，尺寸未知
    pub fn is_known(&self) -> bool {
        self.width > 0 && self.height > 0
    }

    pub fn is_below(&self, min: Dimensions) -> bool {
        self.width < min.width || self.height < min.height
    }
}

/// Per-element record kept in the side-table while the node is attached.
#[derive(Debug, Clone)]
pub struct MediaElement {
    pub id: ElementId,
    pub kind: MediaKind,
    pub source: String,
    pub status: Status,
    /// Bumped on every source change / explicit reset; results from older rounds are dropped.
    pub round: u64,
    pub last_verdict: Option<Verdict>,
    pub positive_streak: u32,
    pub negative_streak: u32,
    pub obstructed: bool,
    pub visible: bool,
    pub dimensions: Dimensions,
}

impl MediaElement {
    pub fn new(id: ElementId, kind: MediaKind, source: String, dimensions: Dimensions) -> Self {
        Self {
            id,
            kind,
            source,
            status: Status::Observed,
            round: 0,
            last_verdict: None,
            positive_streak: 0,
            negative_streak: 0,
            obstructed: false,
            visible: false,
            dimensions,
        }
    }

    /// Starts a new classification round, keeping the viewport state.
    pub fn reset(&mut self) {
        self.round += 1;
        self.status = Status::Observed;
        self.last_verdict = None;
        self.positive_streak = 0;
        self.negative_streak = 0;
    }
}
