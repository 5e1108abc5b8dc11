//! # Flow-Control Windows
//!
//! Per-stream credit accounting. Both peers start every stream with the same
//! initial window, so a freshly opened stream can send immediately without a
//! negotiation round trip.
//!
//! The receiver does not acknowledge every byte. Bytes handed to the
//! application accumulate until they reach the update threshold, then the
//! whole batch is returned to the sender in one WINDOW_UPDATE.
//!
//! ```text
//!   initial = remaining + buffered + unacknowledged
//! ```

use thiserror::Error;

/// Threshold for batching WINDOW_UPDATEs: `percent` of the initial window,
/// never less than one byte.
pub fn update_threshold(initial_window: u32, percent: u8) -> u32 {
    let t = (initial_window as u64 * percent as u64) / 100;
    (t as u32).max(1)
}

// ─── Send Window ─────────────────────────────────────────────────────────────

/// Credit the local side may still spend on DATA frames.
#[derive(Debug, Clone)]
pub struct SendWindow {
    credit: u32,
}

impl SendWindow {
    pub fn new(initial: u32) -> Self {
        SendWindow { credit: initial }
    }

    /// Bytes that may be sent right now.
    pub fn available(&self) -> u32 {
        self.credit
    }

    /// Spend up to `want` bytes of credit. Returns the amount actually
    /// reserved, which is zero when the window is exhausted.
    pub fn reserve(&mut self, want: usize) -> usize {
        let n = want.min(self.credit as usize);
        self.credit -= n as u32;
        n
    }

    /// Apply a WINDOW_UPDATE. Returns `false` if the grant would overflow;
    /// the credit saturates at `u32::MAX` in that case.
    pub fn grant(&mut self, delta: u32) -> bool {
        match self.credit.checked_add(delta) {
            Some(c) => {
                self.credit = c;
                true
            }
            None => {
                self.credit = u32::MAX;
                false
            }
        }
    }
}

// ─── Receive Window ──────────────────────────────────────────────────────────

/// The peer sent more than the window it was granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("received {len} bytes with only {remaining} bytes of window left")]
pub struct WindowOverrun {
    pub len: usize,
    pub remaining: u32,
}

/// Credit the peer may still spend on this stream, plus the consumed bytes
/// not yet advertised back.
#[derive(Debug, Clone)]
pub struct RecvWindow {
    remaining: u32,
    unacked: u32,
    threshold: u32,
}

impl RecvWindow {
    pub fn new(initial: u32, threshold: u32) -> Self {
        RecvWindow {
            remaining: initial,
            unacked: 0,
            threshold: threshold.max(1),
        }
    }

    /// Bytes the peer may still send before it must wait for an update.
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Consumed bytes waiting to be advertised.
    pub fn unacked(&self) -> u32 {
        self.unacked
    }

    /// Account for an inbound DATA payload of `len` bytes.
    pub fn admit(&mut self, len: usize) -> Result<(), WindowOverrun> {
        if len > self.remaining as usize {
            return Err(WindowOverrun {
                len,
                remaining: self.remaining,
            });
        }
        self.remaining -= len as u32;
        Ok(())
    }

    /// Record `n` bytes handed to the application. Returns the credit to
    /// advertise once the batched total reaches the threshold.
    pub fn consume(&mut self, n: usize) -> Option<u32> {
        self.unacked = self.unacked.saturating_add(n as u32);
        if self.unacked < self.threshold {
            return None;
        }
        let credit = self.unacked;
        self.unacked = 0;
        self.remaining = self.remaining.saturating_add(credit);
        Some(credit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_is_fraction_of_window() {
        assert_eq!(update_threshold(4096, 25), 1024);
        assert_eq!(update_threshold(256 * 1024, 50), 128 * 1024);
        assert_eq!(update_threshold(3, 25), 1);
        assert_eq!(update_threshold(u32::MAX, 100), u32::MAX);
    }

    #[test]
    fn send_window_never_goes_negative() {
        let mut w = SendWindow::new(100);
        assert_eq!(w.reserve(60), 60);
        assert_eq!(w.reserve(60), 40);
        assert_eq!(w.reserve(1), 0);
        assert_eq!(w.available(), 0);

        assert!(w.grant(10));
        assert_eq!(w.reserve(usize::MAX), 10);
    }

    #[test]
    fn send_window_grant_overflow_saturates() {
        let mut w = SendWindow::new(u32::MAX - 1);
        assert!(!w.grant(5));
        assert_eq!(w.available(), u32::MAX);
    }

    #[test]
    fn recv_window_rejects_overrun() {
        let mut w = RecvWindow::new(100, 25);
        w.admit(100).unwrap();
        let err = w.admit(1).unwrap_err();
        assert_eq!(err, WindowOverrun { len: 1, remaining: 0 });
    }

    #[test]
    fn updates_are_batched() {
        let mut w = RecvWindow::new(4096, 1024);
        w.admit(4096).unwrap();

        assert_eq!(w.consume(500), None);
        assert_eq!(w.consume(500), None);
        assert_eq!(w.unacked(), 1000);
        assert_eq!(w.consume(100), Some(1100));
        assert_eq!(w.unacked(), 0);
        assert_eq!(w.remaining(), 1100);
    }

    /// Ten 1000-byte chunks through a 4096-byte window with a 25% threshold:
    /// the sender is never starved for good and the receiver sees all 10000
    /// bytes.
    #[test]
    fn ten_chunks_through_small_window() {
        let mut tx = SendWindow::new(4096);
        let mut rx = RecvWindow::new(4096, update_threshold(4096, 25));

        let mut sent = 0usize;
        let mut delivered = 0usize;
        let mut updates = 0;
        let mut in_flight: Vec<usize> = Vec::new();

        while delivered < 10_000 {
            // Sender: push what credit allows, up to 1000 bytes per frame.
            while sent < 10_000 {
                let want = (10_000 - sent).min(1000);
                let n = tx.reserve(want);
                if n == 0 {
                    break;
                }
                rx.admit(n).unwrap();
                in_flight.push(n);
                sent += n;
            }

            // Receiver: the application drains one frame at a time.
            assert!(!in_flight.is_empty(), "sender stalled with {sent} bytes sent");
            let n = in_flight.remove(0);
            delivered += n;
            if let Some(credit) = rx.consume(n) {
                updates += 1;
                assert!(tx.grant(credit));
            }
        }

        assert_eq!(sent, 10_000);
        assert!(updates >= 3, "expected several window updates, got {updates}");
    }
}
