//! Capture → transmit → requeue orchestration
//!
//! The loop negotiates the format once, allocates a double buffer, then keeps
//! both buffers cycling between the video source and the transmitter. A buffer
//! is always handed back to the source after its send, whatever the outcome.

use crate::capture::{
    AllocationError, BufferPool, BufferState, CaptureError, FrameBuffer, VideoFormat, VideoSource,
};
use crate::stats::{RelayStats, StatsCounters};
use crate::transmit::{Connect, SendError, SendFailurePolicy, Transmission, Transmitter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

/// Buffers in the pool: one being filled while the other is sent
pub const POOL_SIZE: usize = 2;

/// Stream restarts tolerated in a row without a single captured frame
pub const MAX_IDLE_RESTARTS: u32 = 3;

#[derive(Error, Debug)]
pub enum LoopError {
    #[error("format negotiation failed: {0}")]
    FormatNegotiation(#[source] CaptureError),

    #[error("buffer allocation failed: {0}")]
    Allocation(#[from] AllocationError),

    #[error("unable to start stream: {0}")]
    StreamStart(#[source] CaptureError),

    #[error("unable to dequeue frame: {0}")]
    Dequeue(#[source] CaptureError),

    #[error("transmission aborted: {0}")]
    Transmit(#[source] SendError),
}

impl LoopError {
    /// Failed before any frame could be captured
    pub fn is_setup(&self) -> bool {
        matches!(
            self,
            Self::FormatNegotiation(_) | Self::Allocation(_) | Self::StreamStart(_)
        )
    }

    /// Process exit code for this failure
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::FormatNegotiation(_) => 10,
            Self::Allocation(_) => 11,
            Self::StreamStart(_) => 12,
            Self::Dequeue(_) => 13,
            Self::Transmit(_) => 14,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Init,
    FormatNegotiated,
    PoolAllocated,
    Streaming,
    /// Waiting for the source to fill a buffer
    Capturing,
    /// Sending a captured buffer
    Draining,
    /// Shutting down, reclaiming buffers from the source
    Stopping,
    Stopped,
}

/// Requests a graceful stop of a running [`CaptureLoop`]
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_shutdown(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub requested_format: VideoFormat,
    /// `None` waits forever for each frame
    pub dequeue_timeout: Option<Duration>,
    pub memory_limit: Option<usize>,
}

enum SessionEnd {
    Shutdown,
    Restart,
}

pub struct CaptureLoop<V: VideoSource, C: Connect> {
    source: V,
    transmitter: Transmitter<C>,
    config: LoopConfig,
    pool: BufferPool,
    format: Option<VideoFormat>,
    state: LoopState,
    shutdown: ShutdownHandle,
    stats: Arc<StatsCounters>,
}

impl<V: VideoSource, C: Connect> CaptureLoop<V, C> {
    pub fn new(source: V, transmitter: Transmitter<C>, config: LoopConfig) -> Self {
        let pool = match config.memory_limit {
            Some(limit) => BufferPool::with_memory_limit(limit),
            None => BufferPool::new(),
        };

        Self {
            source,
            transmitter,
            config,
            pool,
            format: None,
            state: LoopState::Init,
            shutdown: ShutdownHandle::default(),
            stats: Arc::new(StatsCounters::default()),
        }
    }

    /// Shares an existing handle instead of the loop's own
    pub fn with_shutdown(mut self, shutdown: ShutdownHandle) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn stats_handle(&self) -> Arc<StatsCounters> {
        Arc::clone(&self.stats)
    }

    pub fn stats(&self) -> RelayStats {
        self.stats.snapshot()
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Negotiated format, once past `FormatNegotiated`
    pub fn format(&self) -> Option<VideoFormat> {
        self.format
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn source(&self) -> &V {
        &self.source
    }

    pub fn transmitter(&self) -> &Transmitter<C> {
        &self.transmitter
    }

    /// Runs until shutdown is requested or a fatal error occurs.
    ///
    /// Setup failures and dequeue failures are fatal. Send failures are fatal
    /// only under [`SendFailurePolicy::Abort`].
    pub fn run(&mut self) -> Result<(), LoopError> {
        let format = self
            .source
            .negotiate_format(&self.config.requested_format)
            .map_err(LoopError::FormatNegotiation)?;
        self.format = Some(format);
        self.enter(LoopState::FormatNegotiated);

        info!(
            format = %format,
            frame_size = %format.frame_size(),
            "Video device detected"
        );

        let mut buffers = self.pool.allocate(POOL_SIZE, format.frame_size())?;
        self.enter(LoopState::PoolAllocated);

        let mut idle_restarts = 0u32;

        loop {
            if self.shutdown.is_shutdown() {
                break;
            }

            for mut buffer in buffers.drain(..) {
                buffer.set_state(BufferState::Queued);
                self.source.enqueue(buffer);
            }

            self.source.start_stream().map_err(LoopError::StreamStart)?;
            self.enter(LoopState::Streaming);
            info!(dest = %self.transmitter.destination(), "Stream started");

            let captured_before = self.stats.snapshot().frames_captured;
            let end = self.stream_frames();

            self.enter(LoopState::Stopping);
            buffers = self.reclaim_buffers();

            match end? {
                SessionEnd::Shutdown => break,
                SessionEnd::Restart => {
                    if self.stats.snapshot().frames_captured == captured_before {
                        idle_restarts += 1;
                    } else {
                        idle_restarts = 0;
                    }

                    if idle_restarts > MAX_IDLE_RESTARTS {
                        return Err(LoopError::Dequeue(CaptureError::StreamStopped));
                    }

                    StatsCounters::add(&self.stats.stream_restarts, 1);
                    buffers = self.replace_lost(buffers)?;
                    warn!(restarts = %idle_restarts, "Stream stopped by device, restarting");
                }
            }
        }

        drop(buffers);
        self.enter(LoopState::Stopped);

        let stats = self.stats();
        info!(
            captured = %stats.frames_captured,
            sent = %stats.frames_sent,
            dropped = %stats.frames_dropped,
            "Capture loop stopped"
        );

        Ok(())
    }

    /// Per-frame cycle. Returns normally only on shutdown or when the device
    /// stops the stream on its own.
    fn stream_frames(&mut self) -> Result<SessionEnd, LoopError> {
        loop {
            if self.shutdown.is_shutdown() {
                return Ok(SessionEnd::Shutdown);
            }

            self.enter(LoopState::Capturing);
            let mut buffer = match self.source.dequeue(self.config.dequeue_timeout) {
                Ok(buffer) => buffer,
                Err(CaptureError::StreamStopped) => return Ok(SessionEnd::Restart),
                Err(e) => {
                    error!(error = %e, "Unable to dequeue video buf");
                    return Err(LoopError::Dequeue(e));
                }
            };
            buffer.set_state(BufferState::Ready);
            StatsCounters::add(&self.stats.frames_captured, 1);

            self.enter(LoopState::Draining);
            buffer.set_state(BufferState::InFlight);
            let sent = self.transmitter.transmit(buffer.bytes());

            buffer.set_state(BufferState::Queued);
            self.source.enqueue(buffer);

            self.record(sent)?;
        }
    }

    fn record(&self, sent: Result<Transmission, SendError>) -> Result<(), LoopError> {
        let stats = &self.stats;

        match sent {
            Ok(Transmission::Sent {
                report,
                reconnected,
            }) => {
                StatsCounters::add(&stats.frames_sent, 1);
                StatsCounters::add(&stats.bytes_sent, report.bytes as u64);
                StatsCounters::add(&stats.datagrams_sent, u64::from(report.datagrams));
                StatsCounters::add(&stats.transient_retries, u64::from(report.retries));
                if reconnected {
                    StatsCounters::add(&stats.reconnects, 1);
                }
                trace!(bytes = %report.bytes, retries = %report.retries, "Frame sent");
                Ok(())
            }
            Ok(Transmission::Dropped) => {
                StatsCounters::add(&stats.frames_dropped, 1);
                Ok(())
            }
            Err(e) => {
                StatsCounters::add(&stats.send_errors, 1);
                if self.transmitter.policy() == SendFailurePolicy::Abort {
                    return Err(LoopError::Transmit(e));
                }
                warn!(error = %e, "Destination unreachable, capture continues");
                Ok(())
            }
        }
    }

    /// Stops the stream and takes back every buffer the source still holds
    fn reclaim_buffers(&mut self) -> Vec<FrameBuffer> {
        if let Err(e) = self.source.stop_stream() {
            warn!(error = %e, "Unable to stop video");
        }

        let mut reclaimed = Vec::with_capacity(POOL_SIZE);
        while reclaimed.len() < POOL_SIZE {
            match self.source.dequeue(Some(Duration::ZERO)) {
                Ok(mut buffer) => {
                    buffer.set_state(BufferState::Free);
                    buffer.clear();
                    reclaimed.push(buffer);
                }
                Err(_) => break,
            }
        }

        debug!(reclaimed = %reclaimed.len(), live = %self.pool.live(), "Buffers reclaimed");
        reclaimed
    }

    /// Tops the set back up to [`POOL_SIZE`] if the source dropped buffers
    fn replace_lost(&mut self, mut buffers: Vec<FrameBuffer>) -> Result<Vec<FrameBuffer>, LoopError> {
        let live = self.pool.live();
        if live < POOL_SIZE {
            let size = self.format.map(|f| f.frame_size()).unwrap_or_default();
            warn!(lost = %(POOL_SIZE - live), "Replacing buffers lost by the device");
            buffers.extend(self.pool.allocate(POOL_SIZE - live, size)?);
        }
        Ok(buffers)
    }

    fn enter(&mut self, state: LoopState) {
        if self.state != state {
            trace!(from = ?self.state, to = ?state, "Capture loop state");
            self.state = state;
        }
    }
}
