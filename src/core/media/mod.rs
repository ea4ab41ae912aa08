pub mod diff_filter;
pub mod frame;
pub mod loader;
pub mod mock;

pub use diff_filter::FrameDiffFilter;
pub use frame::{calc_resize, Frame, ResizeLimits};
pub use loader::{HttpMediaLoader, LoadedMedia, MediaLoader, VideoSource};
pub use mock::{MediaScript, ScriptedVideoSource, StaticMediaLoader};
