//! Double-buffered video capture forwarded over UDP
//!
//! A [`VideoSource`] fills two reusable [`FrameBuffer`]s in turn; each filled
//! buffer is pushed to a fixed destination by a [`Transmitter`] and handed
//! straight back to the source, so one frame is captured while the previous
//! one is on the wire.
//!
//! # Example
//!
//! ```no_run
//! use frame_relay::capture::PatternGenerator;
//! use frame_relay::capture_loop::{CaptureLoop, LoopConfig};
//! use frame_relay::transmit::{Transmitter, TransmitterOptions, UdpConnector};
//! use frame_relay::{PixelFormat, VideoFormat};
//! use std::time::Duration;
//!
//! let source = PatternGenerator::new(Duration::from_millis(33));
//! let dest = "192.168.0.29:5000".parse().unwrap();
//! let transmitter =
//!     Transmitter::connect(UdpConnector::new(0, true), dest, TransmitterOptions::default())?;
//!
//! let mut relay = CaptureLoop::new(
//!     source,
//!     transmitter,
//!     LoopConfig {
//!         requested_format: VideoFormat::new(PixelFormat::RGB565, 160, 80, 0),
//!         dequeue_timeout: None,
//!         memory_limit: None,
//!     },
//! );
//! relay.run()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod capture;
pub mod capture_loop;
pub mod config;
pub mod stats;
pub mod transmit;

// Re-exports for convenience
pub use capture::{
    open_source, BufferPool, CaptureError, FrameBuffer, PixelFormat, VideoFormat, VideoSource,
};
pub use capture_loop::{CaptureLoop, LoopConfig, LoopError, LoopState, ShutdownHandle};
pub use config::{Config, ConfigError};
pub use stats::{RelayStats, StatsCounters};
pub use transmit::{send_all, SendError, SendFailurePolicy, Transmitter, UdpConnector};
