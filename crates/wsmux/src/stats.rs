//! # Session Statistics
//!
//! Lock-free counters updated by the session's reader and writer tasks and by
//! stream handles, plus a serializable snapshot for export.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Point-in-time view of a session's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    /// Frames written to the underlying connection.
    pub frames_sent: u64,
    /// Encoded bytes written, headers included.
    pub bytes_sent: u64,
    /// Messages read from the underlying connection.
    pub frames_received: u64,
    /// Encoded bytes read, headers included.
    pub bytes_received: u64,
    /// Inbound frames discarded as malformed or addressed to unknown streams.
    pub frames_dropped: u64,
    /// Streams created by `open`.
    pub streams_opened: u64,
    /// Streams handed out by `accept`.
    pub streams_accepted: u64,
    /// Inbound SYNs refused because the accept backlog was full.
    pub streams_refused: u64,
    /// Streams reset locally, remotely or for protocol violations.
    pub streams_reset: u64,
}

impl SessionStats {
    /// Share of inbound frames that were dropped.
    pub fn drop_rate(&self) -> f64 {
        if self.frames_received == 0 {
            0.0
        } else {
            self.frames_dropped as f64 / self.frames_received as f64
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    frames_sent: AtomicU64,
    bytes_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_received: AtomicU64,
    frames_dropped: AtomicU64,
    pub(crate) streams_opened: AtomicU64,
    pub(crate) streams_accepted: AtomicU64,
    pub(crate) streams_refused: AtomicU64,
    pub(crate) streams_reset: AtomicU64,
}

impl Counters {
    pub(crate) fn record_sent(&self, len: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self, len: usize) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> SessionStats {
        SessionStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            streams_opened: self.streams_opened.load(Ordering::Relaxed),
            streams_accepted: self.streams_accepted.load(Ordering::Relaxed),
            streams_refused: self.streams_refused.load(Ordering::Relaxed),
            streams_reset: self.streams_reset.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_rate_handles_zero() {
        assert_eq!(SessionStats::default().drop_rate(), 0.0);
    }

    #[test]
    fn snapshot_reflects_counters() {
        let c = Counters::default();
        c.record_sent(13);
        c.record_sent(9);
        c.record_received(9);
        c.record_received(9);
        c.record_dropped();
        Counters::bump(&c.streams_opened);

        let s = c.snapshot();
        assert_eq!(s.frames_sent, 2);
        assert_eq!(s.bytes_sent, 22);
        assert_eq!(s.frames_received, 2);
        assert_eq!(s.frames_dropped, 1);
        assert_eq!(s.streams_opened, 1);
        assert!((s.drop_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn stats_serialize_to_json() {
        let s = SessionStats {
            frames_sent: 3,
            ..Default::default()
        };
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["frames_sent"], 3);
        assert_eq!(json["streams_reset"], 0);
    }
}
