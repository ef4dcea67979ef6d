//! Fixed-capacity frame buffers and the pool that allocates them

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocationError {
    #[error("buffer size and count must be > 0 (count {count}, size {size})")]
    Empty { count: usize, size: usize },

    #[error("unable to reserve {size} bytes for buffer {index} of {count}")]
    Reserve {
        index: usize,
        count: usize,
        size: usize,
    },

    #[error("buffer {index} of {count} ({size} bytes) exceeds the {limit} byte memory limit")]
    LimitExceeded {
        index: usize,
        count: usize,
        size: usize,
        limit: usize,
    },
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("frame of {len} bytes does not fit buffer capacity {capacity}")]
pub struct BufferOverflow {
    pub len: usize,
    pub capacity: usize,
}

/// Who currently holds a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Owned by the loop, not handed to the device yet
    Free,
    /// Owned by the device, waiting to be filled
    Queued,
    /// Dequeued with a captured frame
    Ready,
    /// Payload is being transmitted
    InFlight,
}

#[derive(Debug, Default)]
struct Accounting {
    live: AtomicUsize,
    peak: AtomicUsize,
    live_bytes: AtomicUsize,
}

/// Reusable storage for one captured frame
pub struct FrameBuffer {
    index: usize,
    data: Box<[u8]>,
    used: usize,
    state: BufferState,
    accounting: Arc<Accounting>,
}

impl FrameBuffer {
    /// Pool slot index
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes filled by the last capture
    pub fn used(&self) -> usize {
        self.used
    }

    /// The captured payload
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.used]
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    pub fn set_state(&mut self, state: BufferState) {
        self.state = state;
    }

    /// Full backing storage, for sources that write in place
    pub fn storage_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn set_used(&mut self, len: usize) -> Result<(), BufferOverflow> {
        if len > self.data.len() {
            return Err(BufferOverflow {
                len,
                capacity: self.data.len(),
            });
        }
        self.used = len;
        Ok(())
    }

    /// Copies `frame` into the buffer and marks it as the used length
    pub fn fill_from(&mut self, frame: &[u8]) -> Result<usize, BufferOverflow> {
        if frame.len() > self.data.len() {
            return Err(BufferOverflow {
                len: frame.len(),
                capacity: self.data.len(),
            });
        }
        self.data[..frame.len()].copy_from_slice(frame);
        self.used = frame.len();
        Ok(frame.len())
    }

    /// Forgets the previous frame
    pub fn clear(&mut self) {
        self.used = 0;
    }
}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("index", &self.index)
            .field("capacity", &self.data.len())
            .field("used", &self.used)
            .field("state", &self.state)
            .finish()
    }
}

impl Drop for FrameBuffer {
    fn drop(&mut self) {
        self.accounting.live.fetch_sub(1, Ordering::Relaxed);
        self.accounting
            .live_bytes
            .fetch_sub(self.data.len(), Ordering::Relaxed);
    }
}

/// Allocates frame buffers and keeps count of how many are alive
#[derive(Debug, Clone, Default)]
pub struct BufferPool {
    memory_limit: Option<usize>,
    next_index: Arc<AtomicUsize>,
    accounting: Arc<Accounting>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pool whose live buffers may never exceed `limit` bytes in total
    pub fn with_memory_limit(limit: usize) -> Self {
        Self {
            memory_limit: Some(limit),
            ..Self::default()
        }
    }

    /// Allocates `count` zeroed buffers of `size` bytes each.
    ///
    /// All or nothing: if any buffer cannot be reserved, the buffers already
    /// allocated by this call are released before the error is returned.
    pub fn allocate(&self, count: usize, size: usize) -> Result<Vec<FrameBuffer>, AllocationError> {
        if count == 0 || size == 0 {
            return Err(AllocationError::Empty { count, size });
        }

        let mut buffers = Vec::with_capacity(count);

        for i in 0..count {
            if let Some(limit) = self.memory_limit {
                let live_bytes = self.accounting.live_bytes.load(Ordering::Relaxed);
                if live_bytes.saturating_add(size) > limit {
                    return Err(AllocationError::LimitExceeded {
                        index: i,
                        count,
                        size,
                        limit,
                    });
                }
            }

            let mut storage = Vec::new();
            storage
                .try_reserve_exact(size)
                .map_err(|_| AllocationError::Reserve {
                    index: i,
                    count,
                    size,
                })?;
            storage.resize(size, 0);

            buffers.push(self.track(storage.into_boxed_slice()));
        }

        debug!(count = %count, size = %size, live = %self.live(), "Frame buffers allocated");

        Ok(buffers)
    }

    fn track(&self, data: Box<[u8]>) -> FrameBuffer {
        let live = self.accounting.live.fetch_add(1, Ordering::Relaxed) + 1;
        self.accounting.peak.fetch_max(live, Ordering::Relaxed);
        self.accounting
            .live_bytes
            .fetch_add(data.len(), Ordering::Relaxed);

        FrameBuffer {
            index: self.next_index.fetch_add(1, Ordering::Relaxed),
            data,
            used: 0,
            state: BufferState::Free,
            accounting: Arc::clone(&self.accounting),
        }
    }

    /// Buffers currently alive, wherever they are
    pub fn live(&self) -> usize {
        self.accounting.live.load(Ordering::Relaxed)
    }

    /// Highest number of buffers alive at once
    pub fn peak(&self) -> usize {
        self.accounting.peak.load(Ordering::Relaxed)
    }

    pub fn live_bytes(&self) -> usize {
        self.accounting.live_bytes.load(Ordering::Relaxed)
    }
}
