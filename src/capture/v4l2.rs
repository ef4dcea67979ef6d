//! V4L2 memory-mapped capture
//!
//! The kernel owns its own mmap slots; every pool buffer handed to `enqueue`
//! shadows one of them and receives the frame bytes on `dequeue`. `STREAMON`
//! is issued by the first dequeue, so `start_stream` only reserves the kernel
//! buffers.

use super::{CaptureError, FrameBuffer, PixelFormat, VideoFormat, VideoSource};
use std::collections::VecDeque;
use std::io;
use std::time::Duration;
use tracing::{debug, info};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::mmap::Stream as MmapStream;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

pub struct V4l2Source {
    path: String,
    device: Device,
    stream: Option<MmapStream<'static>>,
    queued: VecDeque<FrameBuffer>,
}

impl V4l2Source {
    pub fn open(path: &str) -> Result<Self, CaptureError> {
        let device = Device::with_path(path)?;

        let caps = device.query_caps()?;
        info!(device = %path, card = %caps.card, driver = %caps.driver, "V4L2 device opened");

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(CaptureError::DeviceNotFound(format!(
                "{} does not support video capture",
                path
            )));
        }

        Ok(Self {
            path: path.to_string(),
            device,
            stream: None,
            queued: VecDeque::new(),
        })
    }
}

impl VideoSource for V4l2Source {
    fn set_format(&mut self, requested: &VideoFormat) -> Result<(), CaptureError> {
        let mut fmt = self.device.format()?;
        fmt.width = requested.width;
        fmt.height = requested.height;
        fmt.fourcc = FourCC::new(&requested.pixel_format.to_bytes());
        if requested.pitch > 0 {
            fmt.stride = requested.pitch;
        }

        let applied = self
            .device
            .set_format(&fmt)
            .map_err(|e| CaptureError::UnsupportedFormat {
                format: *requested,
                reason: e.to_string(),
            })?;

        if applied.fourcc != fmt.fourcc {
            return Err(CaptureError::UnsupportedFormat {
                format: *requested,
                reason: format!("device switched to {}", applied.fourcc),
            });
        }

        debug!(device = %self.path, format = %applied, "V4L2 format set");
        Ok(())
    }

    fn get_format(&mut self) -> Result<VideoFormat, CaptureError> {
        let fmt = self.device.format()?;
        Ok(VideoFormat::new(
            PixelFormat::from_bytes(fmt.fourcc.repr),
            fmt.width,
            fmt.height,
            fmt.stride,
        ))
    }

    fn enqueue(&mut self, mut buffer: FrameBuffer) {
        buffer.clear();
        self.queued.push_back(buffer);
    }

    fn dequeue(&mut self, timeout: Option<Duration>) -> Result<FrameBuffer, CaptureError> {
        let Some(stream) = self.stream.as_mut() else {
            return match (self.queued.pop_front(), timeout) {
                (Some(buffer), _) => Ok(buffer),
                (None, Some(_)) => Err(CaptureError::Timeout),
                (None, None) => Err(CaptureError::NotStreaming),
            };
        };

        let mut buffer = self.queued.pop_front().ok_or(CaptureError::NoBuffersQueued)?;

        match timeout {
            Some(wait) => stream.set_timeout(wait),
            None => stream.clear_timeout(),
        }

        let filled = match stream.next() {
            Ok((data, meta)) => {
                let len = (meta.bytesused as usize).min(data.len());
                buffer.fill_from(&data[..len]).map_err(CaptureError::from)
            }
            Err(e) => Err(match e.kind() {
                io::ErrorKind::TimedOut => CaptureError::Timeout,
                io::ErrorKind::BrokenPipe => CaptureError::StreamStopped,
                _ => CaptureError::Io(e),
            }),
        };

        match filled {
            Ok(_) => Ok(buffer),
            Err(e) => {
                self.queued.push_front(buffer);
                Err(e)
            }
        }
    }

    fn start_stream(&mut self) -> Result<(), CaptureError> {
        if self.queued.is_empty() {
            return Err(CaptureError::NoBuffersQueued);
        }
        if self.stream.is_some() {
            return Ok(());
        }

        let count = self.queued.len() as u32;
        let stream = MmapStream::with_buffers(&self.device, Type::VideoCapture, count)?;
        self.stream = Some(stream);

        info!(device = %self.path, buffers = %count, "V4L2 stream reserved");
        Ok(())
    }

    fn stop_stream(&mut self) -> Result<(), CaptureError> {
        // Dropping the stream issues STREAMOFF and releases the kernel buffers
        if self.stream.take().is_some() {
            info!(device = %self.path, "V4L2 stream stopped");
        } else {
            debug!(device = %self.path, "V4L2 stream already stopped");
        }
        Ok(())
    }
}
