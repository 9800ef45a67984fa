use thiserror::Error;

use super::types::DescriptorHeapKind;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid scheduler configuration: {0}")]
    InvalidConfig(String),

    #[error("frame slot {frame} is out of range, buffer count is {buffers}")]
    FrameOutOfRange { frame: usize, buffers: usize },

    #[error("device removed: {0}")]
    DeviceRemoved(String),

    #[error("device call failed: {0}")]
    Device(String),

    #[error(
        "out of {kind:?} descriptors: requested {requested}, {available} left of {capacity}"
    )]
    OutOfDescriptors {
        kind: DescriptorHeapKind,
        requested: usize,
        available: usize,
        capacity: usize,
    },

    #[error("work queue is closed")]
    QueueClosed,

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl Error {
    /// Device-level failures abort the frame; everything else is local to the caller.
    pub fn is_device_failure(&self) -> bool {
        matches!(self, Error::DeviceRemoved(_) | Error::Device(_))
    }
}
