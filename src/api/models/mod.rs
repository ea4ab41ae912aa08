pub mod envelope;

pub use envelope::{FramePayload, HostRequest, HostResponse, ImagePayload};
