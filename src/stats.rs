//! Capture and transmission statistics

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters, shared between the capture loop and whoever reports on it
#[derive(Debug, Default)]
pub struct StatsCounters {
    pub frames_captured: AtomicU64,
    pub frames_sent: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub send_errors: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub datagrams_sent: AtomicU64,
    pub transient_retries: AtomicU64,
    pub reconnects: AtomicU64,
    pub stream_restarts: AtomicU64,
}

impl StatsCounters {
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RelayStats {
        RelayStats {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            datagrams_sent: self.datagrams_sent.load(Ordering::Relaxed),
            transient_retries: self.transient_retries.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            stream_restarts: self.stream_restarts.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`StatsCounters`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStats {
    /// Frames dequeued from the video source
    pub frames_captured: u64,

    /// Frames fully handed to the transport
    pub frames_sent: u64,

    /// Frames captured while the channel was closed
    pub frames_dropped: u64,

    /// Fatal send errors
    pub send_errors: u64,

    pub bytes_sent: u64,

    pub datagrams_sent: u64,

    /// Sends retried because the transport was busy
    pub transient_retries: u64,

    pub reconnects: u64,

    pub stream_restarts: u64,
}

impl RelayStats {
    /// Calculates frame rate based on delta
    pub fn calculate_fps(&self, previous: &Self, elapsed_secs: f64) -> f64 {
        if elapsed_secs == 0.0 {
            return 0.0;
        }

        let frames_delta = self.frames_sent.saturating_sub(previous.frames_sent);
        frames_delta as f64 / elapsed_secs
    }

    /// Calculates bitrate in kbps based on delta
    pub fn calculate_bitrate_kbps(&self, previous: &Self, elapsed_secs: f64) -> f64 {
        if elapsed_secs == 0.0 {
            return 0.0;
        }

        let bytes_delta = self.bytes_sent.saturating_sub(previous.bytes_sent);
        (bytes_delta as f64 * 8.0) / elapsed_secs / 1000.0
    }

    /// Share of captured frames that never reached the transport
    pub fn drop_rate(&self) -> f64 {
        if self.frames_captured == 0 {
            return 0.0;
        }

        let lost = self.frames_dropped + self.send_errors;
        lost as f64 / self.frames_captured as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculate_fps() {
        let prev = RelayStats {
            frames_sent: 100,
            ..Default::default()
        };

        let current = RelayStats {
            frames_sent: 130,
            ..Default::default()
        };

        assert_eq!(current.calculate_fps(&prev, 1.0), 30.0);
        assert_eq!(current.calculate_fps(&prev, 0.0), 0.0);
    }

    #[test]
    fn test_calculate_bitrate() {
        let prev = RelayStats::default();

        let current = RelayStats {
            bytes_sent: 125_000, // 125KB in 1 second = 1000 kbps
            ..Default::default()
        };

        assert_eq!(current.calculate_bitrate_kbps(&prev, 1.0), 1000.0);
    }

    #[test]
    fn test_drop_rate() {
        let stats = RelayStats {
            frames_captured: 100,
            frames_sent: 89,
            frames_dropped: 10,
            send_errors: 1,
            ..Default::default()
        };

        assert!((stats.drop_rate() - 0.11).abs() < f64::EPSILON);
        assert_eq!(RelayStats::default().drop_rate(), 0.0);
    }

    #[test]
    fn test_snapshot() {
        let counters = StatsCounters::default();
        StatsCounters::add(&counters.frames_captured, 3);
        StatsCounters::add(&counters.bytes_sent, 76_800);

        let stats = counters.snapshot();
        assert_eq!(stats.frames_captured, 3);
        assert_eq!(stats.bytes_sent, 76_800);
        assert_eq!(stats.frames_sent, 0);
    }
}
