//! Software test pattern source
//!
//! Produces scrolling colour bars at a fixed frame interval, so the whole
//! capture → transmit path can run without camera hardware.

use super::{CaptureError, FrameBuffer, PixelFormat, VideoFormat, VideoSource};
use std::collections::VecDeque;
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

/// White, yellow, cyan, green, magenta, red, blue, black
const BARS_RGB565: [u16; 8] = [
    0xFFFF, 0xFFE0, 0x07FF, 0x07E0, 0xF81F, 0xF800, 0x001F, 0x0000,
];

/// Same bars as (Y, U, V)
const BARS_YUV: [(u8, u8, u8); 8] = [
    (235, 128, 128),
    (210, 16, 146),
    (170, 166, 16),
    (145, 54, 34),
    (106, 202, 222),
    (81, 90, 240),
    (41, 240, 110),
    (16, 128, 128),
];

pub struct PatternGenerator {
    format: VideoFormat,
    interval: Duration,
    queued: VecDeque<FrameBuffer>,
    streaming: bool,
    next_frame: Instant,
    sequence: u64,
}

impl PatternGenerator {
    pub fn new(interval: Duration) -> Self {
        Self {
            format: VideoFormat::new(PixelFormat::RGB565, 320, 160, 640),
            interval,
            queued: VecDeque::new(),
            streaming: false,
            next_frame: Instant::now(),
            sequence: 0,
        }
    }

    /// Frames produced since creation
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    fn render(&self, buffer: &mut FrameBuffer) -> Result<(), CaptureError> {
        let size = self.format.frame_size();
        if buffer.capacity() < size {
            return Err(CaptureError::Overflow(super::BufferOverflow {
                len: size,
                capacity: buffer.capacity(),
            }));
        }

        let width = self.format.width as usize;
        let pitch = self.format.pitch as usize;
        let bar_width = (width / BARS_RGB565.len()).max(1);
        let shift = self.sequence as usize;
        let storage = buffer.storage_mut();

        let (first_row, rest) = storage[..size].split_at_mut(pitch);
        match self.format.pixel_format {
            PixelFormat::YUYV => {
                for (pair, px) in first_row[..width * 2].chunks_exact_mut(4).enumerate() {
                    let bar = (((pair * 2) + shift) / bar_width) % BARS_YUV.len();
                    let (y, u, v) = BARS_YUV[bar];
                    px.copy_from_slice(&[y, u, y, v]);
                }
            }
            _ => {
                for (x, px) in first_row[..width * 2].chunks_exact_mut(2).enumerate() {
                    let bar = ((x + shift) / bar_width) % BARS_RGB565.len();
                    px.copy_from_slice(&BARS_RGB565[bar].to_le_bytes());
                }
            }
        }

        for row in rest.chunks_exact_mut(pitch) {
            row.copy_from_slice(first_row);
        }

        buffer.set_used(size)?;
        Ok(())
    }
}

impl VideoSource for PatternGenerator {
    fn set_format(&mut self, requested: &VideoFormat) -> Result<(), CaptureError> {
        let bpp = requested
            .pixel_format
            .bytes_per_pixel()
            .ok_or_else(|| CaptureError::UnsupportedFormat {
                format: *requested,
                reason: "pattern generator only produces RGBP and YUYV".to_string(),
            })?;

        if requested.width == 0 || requested.height == 0 {
            return Err(CaptureError::UnsupportedFormat {
                format: *requested,
                reason: "width and height must be > 0".to_string(),
            });
        }

        if requested.pixel_format == PixelFormat::YUYV && requested.width % 2 != 0 {
            return Err(CaptureError::UnsupportedFormat {
                format: *requested,
                reason: "YUYV needs an even width".to_string(),
            });
        }

        let pitch = requested
            .width
            .checked_mul(bpp)
            .ok_or_else(|| CaptureError::UnsupportedFormat {
                format: *requested,
                reason: "row stride does not fit in 32 bits".to_string(),
            })?;

        self.format = VideoFormat::new(
            requested.pixel_format,
            requested.width,
            requested.height,
            pitch,
        );
        debug!(format = %self.format, "Generator format set");
        Ok(())
    }

    fn get_format(&mut self) -> Result<VideoFormat, CaptureError> {
        Ok(self.format)
    }

    fn enqueue(&mut self, mut buffer: FrameBuffer) {
        buffer.clear();
        self.queued.push_back(buffer);
    }

    fn dequeue(&mut self, timeout: Option<Duration>) -> Result<FrameBuffer, CaptureError> {
        if !self.streaming {
            return match (self.queued.pop_front(), timeout) {
                (Some(buffer), _) => Ok(buffer),
                (None, Some(wait)) => {
                    thread::sleep(wait);
                    Err(CaptureError::Timeout)
                }
                (None, None) => Err(CaptureError::NotStreaming),
            };
        }

        if self.queued.is_empty() {
            return Err(CaptureError::NoBuffersQueued);
        }

        let wait = self.next_frame.saturating_duration_since(Instant::now());
        if let Some(limit) = timeout {
            if limit < wait {
                thread::sleep(limit);
                return Err(CaptureError::Timeout);
            }
        }
        thread::sleep(wait);

        let mut buffer = self.queued.pop_front().ok_or(CaptureError::NoBuffersQueued)?;
        if let Err(e) = self.render(&mut buffer) {
            self.queued.push_front(buffer);
            return Err(e);
        }

        self.sequence += 1;
        let now = Instant::now();
        self.next_frame += self.interval;
        if self.next_frame < now {
            self.next_frame = now + self.interval;
        }

        Ok(buffer)
    }

    fn start_stream(&mut self) -> Result<(), CaptureError> {
        if self.queued.is_empty() {
            return Err(CaptureError::NoBuffersQueued);
        }
        self.streaming = true;
        self.next_frame = Instant::now();
        debug!(queued = %self.queued.len(), "Generator stream started");
        Ok(())
    }

    fn stop_stream(&mut self) -> Result<(), CaptureError> {
        self.streaming = false;
        Ok(())
    }
}
