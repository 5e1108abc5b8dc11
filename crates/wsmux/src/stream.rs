//! # Streams
//!
//! A [`Stream`] is one virtual, ordered, flow-controlled byte channel inside a
//! [`crate::Session`]. It implements tokio's [`AsyncRead`] and [`AsyncWrite`],
//! so the usual `read`, `write_all` and `shutdown` helpers apply.
//!
//! State lives in [`StreamShared`], shared between the handle and the
//! session's reader loop and guarded by a stream-local mutex. No two streams
//! ever contend on each other's state.
//!
//! ```text
//!   Open ──local FIN──▶ HalfClosedLocal ──remote FIN──┐
//!    │                                                ▼
//!    └──remote FIN──▶ HalfClosedRemote ──local FIN──▶ Closed
//!
//!   any non-closed state ──RST / session teardown──▶ Reset
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep};

use crate::config::Config;
use crate::error::MuxError;
use crate::frame::Frame;
use crate::session::SessionShared;
use crate::window::{RecvWindow, SendWindow};

// ─── Phase ───────────────────────────────────────────────────────────────────

/// Observable lifecycle state of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    /// Both directions open.
    Open,
    /// FIN sent; the peer may still send.
    HalfClosedLocal,
    /// FIN received; the local side may still send.
    HalfClosedRemote,
    /// Both FINs exchanged. Terminal.
    Closed,
    /// Aborted by RST or session teardown. Terminal.
    Reset,
}

/// Why a stream was reset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ResetCause {
    /// `Stream::reset` or a refused SYN.
    Local,
    /// The peer sent RST.
    Remote,
    /// The peer broke the window or close rules on this stream.
    Violation,
    /// The session went away. Already-admitted data stays readable.
    Session(MuxError),
}

impl ResetCause {
    fn discards_data(&self) -> bool {
        !matches!(self, ResetCause::Session(_))
    }

    fn to_error(&self, id: u32) -> MuxError {
        match self {
            ResetCause::Session(err) => err.clone(),
            _ => MuxError::StreamReset(id),
        }
    }
}

/// What the reader loop should do after routing a DATA payload.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum DataOutcome {
    Buffered,
    /// The handle is gone; the bytes were dropped and this much credit should
    /// go straight back to the peer.
    Discarded(Option<u32>),
    /// The stream is already being torn down.
    Ignored,
    Violation(String),
}

// ─── Shared State ────────────────────────────────────────────────────────────

struct StreamState {
    send: SendWindow,
    recv: RecvWindow,
    buffer: VecDeque<Bytes>,
    buffered: usize,
    local_closed: bool,
    remote_closed: bool,
    reset: Option<ResetCause>,
    /// The application dropped its handle.
    detached: bool,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

impl StreamState {
    fn phase(&self) -> StreamPhase {
        if self.reset.is_some() {
            return StreamPhase::Reset;
        }
        match (self.local_closed, self.remote_closed) {
            (false, false) => StreamPhase::Open,
            (true, false) => StreamPhase::HalfClosedLocal,
            (false, true) => StreamPhase::HalfClosedRemote,
            (true, true) => StreamPhase::Closed,
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self.phase(), StreamPhase::Closed | StreamPhase::Reset)
    }

    /// Whether the session may forget this stream.
    fn retirable(&self) -> bool {
        self.reset.is_some()
            || (self.local_closed && self.remote_closed && (self.buffered == 0 || self.detached))
    }

    fn wake_reader(&mut self) {
        if let Some(w) = self.read_waker.take() {
            w.wake();
        }
    }

    fn wake_writer(&mut self) {
        if let Some(w) = self.write_waker.take() {
            w.wake();
        }
    }

    fn clear_buffer(&mut self) {
        self.buffer.clear();
        self.buffered = 0;
    }

    /// Move buffered bytes into `buf` in arrival order.
    fn drain_into(&mut self, buf: &mut ReadBuf<'_>) -> usize {
        let mut n = 0;
        while buf.remaining() > 0 {
            let Some(chunk) = self.buffer.front_mut() else {
                break;
            };
            let take = chunk.len().min(buf.remaining());
            buf.put_slice(&chunk[..take]);
            chunk.advance(take);
            n += take;
            if chunk.is_empty() {
                self.buffer.pop_front();
            }
        }
        self.buffered -= n;
        n
    }

    /// Apply a reset. `Closed` and `Reset` are terminal, so this is a no-op
    /// for them.
    fn apply_reset(&mut self, cause: ResetCause) -> bool {
        if self.is_terminal() {
            return false;
        }
        if cause.discards_data() {
            self.clear_buffer();
        }
        self.reset = Some(cause);
        self.wake_reader();
        self.wake_writer();
        true
    }
}

/// Stream state shared between the application handle and the session.
pub(crate) struct StreamShared {
    pub(crate) id: u32,
    state: Mutex<StreamState>,
}

impl StreamShared {
    pub(crate) fn new(id: u32, config: &Config) -> Self {
        StreamShared {
            id,
            state: Mutex::new(StreamState {
                send: SendWindow::new(config.initial_window),
                recv: RecvWindow::new(config.initial_window, config.update_threshold()),
                buffer: VecDeque::new(),
                buffered: 0,
                local_closed: false,
                remote_closed: false,
                reset: None,
                detached: false,
                read_waker: None,
                write_waker: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn phase(&self) -> StreamPhase {
        self.lock().phase()
    }

    // ─── Inbound (reader loop) ──────────────────────────────────────────

    pub(crate) fn on_data(&self, payload: Bytes) -> DataOutcome {
        let mut st = self.lock();
        if st.reset.is_some() {
            return DataOutcome::Ignored;
        }
        if st.remote_closed {
            return DataOutcome::Violation("DATA after FIN".into());
        }
        if let Err(overrun) = st.recv.admit(payload.len()) {
            return DataOutcome::Violation(overrun.to_string());
        }
        if st.detached {
            return DataOutcome::Discarded(st.recv.consume(payload.len()));
        }
        if !payload.is_empty() {
            st.buffered += payload.len();
            st.buffer.push_back(payload);
            st.wake_reader();
        }
        DataOutcome::Buffered
    }

    /// Returns `false` if the grant overflowed the window.
    pub(crate) fn on_window_update(&self, credit: u32) -> bool {
        let mut st = self.lock();
        if st.is_terminal() {
            return true;
        }
        let ok = st.send.grant(credit);
        st.wake_writer();
        ok
    }

    /// Returns whether the stream can now be retired.
    pub(crate) fn on_fin(&self) -> bool {
        let mut st = self.lock();
        if st.reset.is_none() && !st.remote_closed {
            st.remote_closed = true;
            st.wake_reader();
        }
        st.retirable()
    }

    pub(crate) fn on_rst(&self) {
        self.lock().apply_reset(ResetCause::Remote);
    }

    /// Reset from the session side. Returns whether the reset took effect
    /// (and an RST should be sent, if the cause calls for one).
    pub(crate) fn reset(&self, cause: ResetCause) -> bool {
        self.lock().apply_reset(cause)
    }
}

impl fmt::Debug for StreamShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamShared")
            .field("id", &self.id)
            .field("phase", &self.phase())
            .finish()
    }
}

// ─── Stream Handle ───────────────────────────────────────────────────────────

/// Application handle to one multiplexed stream.
///
/// Dropping the handle without closing it sends FIN and discards anything the
/// peer still sends; the stream is forgotten once the peer's FIN arrives.
pub struct Stream {
    shared: Arc<StreamShared>,
    session: Arc<SessionShared>,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
}

impl Stream {
    pub(crate) fn new(shared: Arc<StreamShared>, session: Arc<SessionShared>) -> Self {
        Stream {
            shared,
            session,
            read_deadline: None,
            write_deadline: None,
        }
    }

    /// Stream identifier. Odd ids were opened by the client, even ids by the
    /// server.
    pub fn id(&self) -> u32 {
        self.shared.id
    }

    pub fn phase(&self) -> StreamPhase {
        self.shared.phase()
    }

    /// Send credit currently available.
    pub fn send_window(&self) -> u32 {
        self.shared.lock().send.available()
    }

    /// Fail reads that are still blocked at `deadline` with `TimedOut`.
    /// `None` clears the deadline.
    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.read_deadline = deadline.map(|d| Box::pin(tokio::time::sleep_until(d)));
    }

    /// Fail writes that are still waiting for credit at `deadline` with
    /// `TimedOut`. `None` clears the deadline.
    pub fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write_deadline = deadline.map(|d| Box::pin(tokio::time::sleep_until(d)));
    }

    /// Send FIN, ending the local write direction. Reading continues until
    /// the peer's FIN. Calling it again is a no-op.
    pub async fn close(&mut self) -> Result<(), MuxError> {
        self.close_write()
    }

    /// Abort the stream: send RST and drop unread data.
    pub fn reset(&mut self) {
        let id = self.shared.id;
        if self.shared.reset(ResetCause::Local) {
            self.session.note_reset();
            let _ = self.session.send_frame(Frame::rst(id));
            tracing::debug!(parent: self.session.span(), stream_id = id, "stream reset locally");
        }
        self.session.retire(id);
    }

    fn close_write(&self) -> Result<(), MuxError> {
        let id = self.shared.id;
        let retire = {
            let mut st = self.shared.lock();
            if st.local_closed || st.reset.is_some() {
                return Ok(());
            }
            st.local_closed = true;
            st.wake_writer();
            self.session.send_frame(Frame::fin(id))?;
            st.retirable()
        };
        if retire {
            self.session.retire(id);
        }
        Ok(())
    }
}

/// Poll an optional deadline; resolves to a `TimedOut` error once it passes.
fn poll_deadline(deadline: &mut Option<Pin<Box<Sleep>>>, cx: &mut Context<'_>) -> Poll<io::Error> {
    match deadline {
        Some(sleep) => sleep.as_mut().poll(cx).map(|()| MuxError::Timeout.into()),
        None => Poll::Pending,
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let id = this.shared.id;
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let retire = {
            let mut st = this.shared.lock();
            if let Some(cause) = st.reset.as_ref().filter(|c| c.discards_data()) {
                return Poll::Ready(Err(cause.to_error(id).into()));
            }

            if st.buffered == 0 {
                if st.remote_closed {
                    return Poll::Ready(Ok(()));
                }
                if let Some(cause) = &st.reset {
                    return Poll::Ready(Err(cause.to_error(id).into()));
                }
                st.read_waker = Some(cx.waker().clone());
                drop(st);
                return poll_deadline(&mut this.read_deadline, cx).map(Err);
            }

            let n = st.drain_into(buf);
            if let Some(credit) = st.recv.consume(n) {
                if !st.remote_closed && st.reset.is_none() {
                    // A failure here means the session is gone; the next
                    // read reports it.
                    let _ = this.session.send_frame(Frame::window_update(id, credit));
                }
            }
            st.retirable()
        };

        if retire {
            this.session.retire(id);
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let id = this.shared.id;

        let mut st = this.shared.lock();
        if let Some(cause) = &st.reset {
            return Poll::Ready(Err(cause.to_error(id).into()));
        }
        if st.local_closed {
            return Poll::Ready(Err(MuxError::StreamClosed(id).into()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let want = buf.len().min(this.session.max_frame_payload());
        let n = st.send.reserve(want);
        if n == 0 {
            st.write_waker = Some(cx.waker().clone());
            drop(st);
            return poll_deadline(&mut this.write_deadline, cx).map(Err);
        }

        let frame = Frame::data(id, Bytes::copy_from_slice(&buf[..n]));
        match this.session.send_frame(frame) {
            Ok(()) => Poll::Ready(Ok(n)),
            Err(e) => Poll::Ready(Err(e.into())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(self.close_write().map_err(io::Error::from))
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        let id = self.shared.id;
        let retire = {
            let mut st = self.shared.lock();
            st.detached = true;
            st.read_waker = None;
            st.write_waker = None;
            if st.reset.is_none() {
                // Hand the credit for unread bytes back so the peer is not
                // left blocked on a window nobody will drain.
                let unread = st.buffered;
                st.clear_buffer();
                if !st.remote_closed {
                    if let Some(credit) = st.recv.consume(unread) {
                        let _ = self.session.send_frame(Frame::window_update(id, credit));
                    }
                }
                if !st.local_closed {
                    st.local_closed = true;
                    let _ = self.session.send_frame(Frame::fin(id));
                }
            }
            st.retirable()
        };
        if retire {
            self.session.retire(id);
        }
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.shared.id)
            .field("phase", &self.phase())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared(window: u32) -> StreamShared {
        let config = Config {
            initial_window: window,
            max_frame_payload: window,
            ..Config::default()
        };
        StreamShared::new(1, &config)
    }

    #[test]
    fn phases_follow_fins() {
        let s = shared(1024);
        assert_eq!(s.phase(), StreamPhase::Open);

        assert!(!s.on_fin());
        assert_eq!(s.phase(), StreamPhase::HalfClosedRemote);

        s.lock().local_closed = true;
        assert_eq!(s.phase(), StreamPhase::Closed);
    }

    #[test]
    fn closed_is_terminal() {
        let s = shared(1024);
        s.lock().local_closed = true;
        assert!(s.on_fin());
        assert_eq!(s.phase(), StreamPhase::Closed);

        s.on_rst();
        assert_eq!(s.phase(), StreamPhase::Closed);
        assert!(!s.reset(ResetCause::Local));
    }

    #[test]
    fn data_is_buffered_in_order() {
        let s = shared(1024);
        assert_eq!(s.on_data(Bytes::from_static(b"abc")), DataOutcome::Buffered);
        assert_eq!(s.on_data(Bytes::from_static(b"def")), DataOutcome::Buffered);

        let mut out = [0u8; 4];
        let mut buf = ReadBuf::new(&mut out);
        let n = s.lock().drain_into(&mut buf);
        assert_eq!(n, 4);
        assert_eq!(buf.filled(), b"abcd");
        assert_eq!(s.lock().buffered, 2);
    }

    #[test]
    fn overrun_and_data_after_fin_are_violations() {
        let s = shared(4);
        assert!(matches!(
            s.on_data(Bytes::from_static(b"12345")),
            DataOutcome::Violation(_)
        ));

        let s = shared(1024);
        s.on_fin();
        assert!(matches!(
            s.on_data(Bytes::from_static(b"late")),
            DataOutcome::Violation(_)
        ));
    }

    #[test]
    fn remote_reset_discards_buffer() {
        let s = shared(1024);
        s.on_data(Bytes::from_static(b"unread"));
        s.on_rst();
        assert_eq!(s.phase(), StreamPhase::Reset);
        assert_eq!(s.lock().buffered, 0);
        assert_eq!(s.on_data(Bytes::from_static(b"more")), DataOutcome::Ignored);
    }

    #[test]
    fn session_teardown_keeps_admitted_data() {
        let s = shared(1024);
        s.on_data(Bytes::from_static(b"kept"));
        assert!(s.reset(ResetCause::Session(MuxError::SessionClosed)));
        assert_eq!(s.phase(), StreamPhase::Reset);
        assert_eq!(s.lock().buffered, 4);
    }

    #[test]
    fn detached_stream_returns_credit() {
        let s = shared(100);
        s.lock().detached = true;
        assert_eq!(s.on_data(Bytes::from(vec![0u8; 10])), DataOutcome::Discarded(None));
        assert_eq!(
            s.on_data(Bytes::from(vec![0u8; 20])),
            DataOutcome::Discarded(Some(30))
        );
    }
}
