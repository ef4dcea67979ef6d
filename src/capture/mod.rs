//! Video sources feeding the frame buffer pool

mod format;
mod generator;
mod pool;
#[cfg(feature = "v4l2")]
mod v4l2;

pub use format::{InvalidFourCc, PixelFormat, VideoFormat};
pub use generator::PatternGenerator;
pub use pool::{AllocationError, BufferOverflow, BufferPool, BufferState, FrameBuffer};
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Source;

use crate::config::SourceConfig;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Device name that selects the built-in pattern generator
pub const GENERATOR_DEVICE: &str = "generator";

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("unsupported format {format}: {reason}")]
    UnsupportedFormat { format: VideoFormat, reason: String },

    #[error("video device not found: {0}")]
    DeviceNotFound(String),

    #[error("no buffers queued")]
    NoBuffersQueued,

    #[error("stream is not running")]
    NotStreaming,

    #[error("timed out waiting for a frame")]
    Timeout,

    #[error("stream stopped by the device")]
    StreamStopped,

    #[error(transparent)]
    Overflow(#[from] BufferOverflow),

    #[error("device I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl std::fmt::Debug for dyn VideoSource + Send {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("VideoSource")
    }
}

/// A streaming video capture device.
///
/// Buffers are moved into the device by [`enqueue`](VideoSource::enqueue) and moved
/// back out by [`dequeue`](VideoSource::dequeue); the device owns them in between.
/// After [`stop_stream`](VideoSource::stop_stream), `dequeue(Some(Duration::ZERO))`
/// returns every buffer the device still holds, then reports
/// [`CaptureError::Timeout`].
pub trait VideoSource {
    fn set_format(&mut self, requested: &VideoFormat) -> Result<(), CaptureError>;

    fn get_format(&mut self) -> Result<VideoFormat, CaptureError>;

    /// Hands an empty buffer to the device. Never blocks.
    fn enqueue(&mut self, buffer: FrameBuffer);

    /// Waits for a filled buffer. `None` waits forever.
    fn dequeue(&mut self, timeout: Option<Duration>) -> Result<FrameBuffer, CaptureError>;

    fn start_stream(&mut self) -> Result<(), CaptureError>;

    /// Idempotent
    fn stop_stream(&mut self) -> Result<(), CaptureError>;

    /// Requests `requested`, then reads back what the device actually applied.
    /// The pitch in particular is device-determined.
    fn negotiate_format(&mut self, requested: &VideoFormat) -> Result<VideoFormat, CaptureError> {
        self.set_format(requested)?;
        let actual = self.get_format()?;

        if actual.frame_size() == 0 {
            return Err(CaptureError::UnsupportedFormat {
                format: actual,
                reason: "device reported an empty frame size".to_string(),
            });
        }

        Ok(actual)
    }
}

impl<V: VideoSource + ?Sized> VideoSource for Box<V> {
    fn set_format(&mut self, requested: &VideoFormat) -> Result<(), CaptureError> {
        (**self).set_format(requested)
    }

    fn get_format(&mut self) -> Result<VideoFormat, CaptureError> {
        (**self).get_format()
    }

    fn enqueue(&mut self, buffer: FrameBuffer) {
        (**self).enqueue(buffer)
    }

    fn dequeue(&mut self, timeout: Option<Duration>) -> Result<FrameBuffer, CaptureError> {
        (**self).dequeue(timeout)
    }

    fn start_stream(&mut self) -> Result<(), CaptureError> {
        (**self).start_stream()
    }

    fn stop_stream(&mut self) -> Result<(), CaptureError> {
        (**self).stop_stream()
    }
}

/// Resolves the configured device name to a source, once, at startup
pub fn open_source(config: &SourceConfig) -> Result<Box<dyn VideoSource + Send>, CaptureError> {
    if config.device.eq_ignore_ascii_case(GENERATOR_DEVICE) {
        info!(fps = %config.fps, "Using test pattern generator");
        let interval = Duration::from_secs(1) / config.fps.max(1);
        return Ok(Box::new(PatternGenerator::new(interval)));
    }

    open_device(&config.device)
}

#[cfg(feature = "v4l2")]
fn open_device(path: &str) -> Result<Box<dyn VideoSource + Send>, CaptureError> {
    if !std::path::Path::new(path).exists() {
        return Err(CaptureError::DeviceNotFound(path.to_string()));
    }
    Ok(Box::new(V4l2Source::open(path)?))
}

#[cfg(not(feature = "v4l2"))]
fn open_device(path: &str) -> Result<Box<dyn VideoSource + Send>, CaptureError> {
    Err(CaptureError::DeviceNotFound(format!(
        "{} (built without V4L2 support)",
        path
    )))
}
