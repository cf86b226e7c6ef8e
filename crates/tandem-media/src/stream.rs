//! Render-side stream parameters and the pipeline owner seam.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::bridge::FrameBridge;
use crate::{Resolution, StreamKind};

/// Bits per pixel of I420.
pub const I420_BITS_PER_PIXEL: u64 = 12;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    #[error("invalid frame size {width}x{height}")]
    InvalidSize { width: u32, height: u32 },
    #[error("framerate must be positive")]
    ZeroFramerate,
}

/// Parameters a render pipeline is (re)configured with when a stream's first frame arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFormat {
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    /// Raw bitrate in bits per second.
    pub bitrate: u64,
}

impl StreamFormat {
    pub fn new(width: u32, height: u32, framerate: u32) -> Result<Self, FormatError> {
        if width == 0 || height == 0 {
            return Err(FormatError::InvalidSize { width, height });
        }
        if framerate == 0 {
            return Err(FormatError::ZeroFramerate);
        }
        let bitrate =
            u64::from(framerate) * u64::from(width) * u64::from(height) * I420_BITS_PER_PIXEL;
        Ok(Self {
            width,
            height,
            framerate,
            bitrate,
        })
    }

    pub fn from_resolution(resolution: Resolution, framerate: u32) -> Result<Self, FormatError> {
        Self::new(resolution.width, resolution.height, framerate)
    }

    pub fn resolution(&self) -> Resolution {
        Resolution {
            width: self.width,
            height: self.height,
        }
    }
}

/// Owner of the render pipelines.
///
/// `stream_ready` is called once per stream, when its bridge accepts its first
/// frame. `stream_detached` is called during teardown, after the bridge has
/// stopped serving frames.
pub trait PipelineHost: Send {
    fn stream_ready(&mut self, kind: StreamKind, format: StreamFormat, bridge: Arc<FrameBridge>);
    fn stream_detached(&mut self, kind: StreamKind);
}
