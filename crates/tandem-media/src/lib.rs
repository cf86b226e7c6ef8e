//! Media boundary for Tandem.
//!
//! Decoded frames come out of an external media engine on its own threads and
//! are consumed by render pipelines on their own clocks. This crate holds the
//! frame types, the bounded [`FrameBridge`] between the two sides, and the
//! trait seams the engine and the render pipelines plug into.

#![forbid(unsafe_code)]

pub mod bridge;
pub mod dummy;
pub mod engine;
pub mod render;
pub mod stream;

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub use bridge::{BridgeStats, FrameBridge, PushOutcome, Sample};
pub use dummy::SyntheticEngine;
pub use engine::{
    ConnectionState, EngineCallbacks, EngineConfig, EngineError, EngineEvent, MediaEngine,
};
pub use render::{RenderLoop, RenderLoopHost, RenderSink, StatsSink};
pub use stream::{FormatError, PipelineHost, StreamFormat};

/// Pixel layout of decoded frames. Only planar YUV 4:2:0 is produced.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PixelFormat {
    I420,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// A frame with no pixels in one of its dimensions.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Which side of the call a frame stream belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Local capture, shown as preview.
    Local,
    /// Decoded frames from the remote peer.
    Remote,
}

impl StreamKind {
    /// Bridge capacity for this stream. Remote delivery is bursty, so it gets more slack.
    pub fn bridge_capacity(&self) -> usize {
        match self {
            StreamKind::Local => bridge::LOCAL_BRIDGE_CAPACITY,
            StreamKind::Remote => bridge::REMOTE_BRIDGE_CAPACITY,
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Local => f.write_str("local"),
            StreamKind::Remote => f.write_str("remote"),
        }
    }
}

/// A decoded video frame. The pixel payload is opaque to everything in this crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Bytes,
    pub timestamp_us: Option<u64>,
}

impl Frame {
    pub fn i420(width: u32, height: u32, data: impl Into<Bytes>) -> Self {
        Self {
            width,
            height,
            format: PixelFormat::I420,
            data: data.into(),
            timestamp_us: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp_us: u64) -> Self {
        self.timestamp_us = Some(timestamp_us);
        self
    }

    pub fn resolution(&self) -> Resolution {
        Resolution {
            width: self.width,
            height: self.height,
        }
    }
}

/// Byte length of an I420 image: a full-size luma plane and two quarter-size chroma planes.
pub fn i420_len(width: u32, height: u32) -> usize {
    let (w, h) = (width as usize, height as usize);
    let chroma = w.div_ceil(2) * h.div_ceil(2);
    w * h + 2 * chroma
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_i420_len() {
        assert_eq!(i420_len(4, 4), 16 + 2 * 4);
        assert_eq!(i420_len(3, 3), 9 + 2 * 4);
        assert_eq!(i420_len(0, 0), 0);
    }

    #[test]
    fn test_stream_capacities() {
        assert_eq!(StreamKind::Local.bridge_capacity(), 3);
        assert_eq!(StreamKind::Remote.bridge_capacity(), 5);
    }

    #[test]
    fn test_frame_builder() {
        let frame = Frame::i420(2, 2, vec![0u8; i420_len(2, 2)]).with_timestamp(42);
        assert_eq!(frame.resolution().to_string(), "2x2");
        assert_eq!(frame.timestamp_us, Some(42));
        assert_eq!(frame.format, PixelFormat::I420);
    }
}
