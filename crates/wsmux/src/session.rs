//! # Session
//!
//! A [`Session`] multiplexes [`Stream`]s over one message-oriented
//! connection. It owns two tasks:
//!
//! ```text
//!   connection ──▶ reader task ──▶ stream buffers / windows / accept queue
//!                                                  │
//!   stream writes, control frames ──▶ outbound queue ──▶ writer task ──▶ connection
//! ```
//!
//! The reader task is the only consumer of inbound messages; the writer task
//! is the only producer of outbound ones, so frames never interleave. The
//! amount of queued DATA is bounded by the streams' send windows.
//!
//! Stream ids are partitioned by [`Role`]: the client allocates odd ids, the
//! server even ids, so both sides open streams without coordinating.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures::{Sink, SinkExt, Stream as MessageStream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::config::{Config, ConfigError};
use crate::error::MuxError;
use crate::frame::{Frame, FrameType};
use crate::stats::{Counters, SessionStats};
use crate::stream::{DataOutcome, ResetCause, Stream, StreamShared};

/// How long `close` waits for queued frames to drain before dropping the
/// connection.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

// ─── Role ────────────────────────────────────────────────────────────────────

/// Which side of the connection this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Allocates odd stream ids (1, 3, 5, ...).
    Client,
    /// Allocates even stream ids (2, 4, 6, ...).
    Server,
}

impl Role {
    fn first_id(self) -> u32 {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }

    /// Whether `id` belongs to this side's partition.
    pub fn owns(self, id: u32) -> bool {
        id != 0 && (id % 2 == 1) == (self == Role::Client)
    }
}

// ─── Shared State ────────────────────────────────────────────────────────────

/// The id-keyed stream table. Allocation and insertion happen under the same
/// lock, so SYNs are queued in id order.
struct StreamTable {
    streams: HashMap<u32, Arc<StreamShared>>,
    next_id: Option<u32>,
}

pub(crate) struct SessionShared {
    role: Role,
    config: Config,
    span: tracing::Span,
    table: Mutex<StreamTable>,
    outbound: mpsc::UnboundedSender<Frame>,
    closed: AtomicBool,
    teardown: Mutex<Option<MuxError>>,
    shutdown: watch::Sender<bool>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Arc<StreamShared>>>,
    counters: Counters,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SessionShared {
    pub(crate) fn span(&self) -> &tracing::Span {
        &self.span
    }

    pub(crate) fn max_frame_payload(&self) -> usize {
        self.config.max_frame_payload as usize
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn teardown_cause(&self) -> MuxError {
        lock(&self.teardown).clone().unwrap_or(MuxError::SessionClosed)
    }

    /// Queue a frame for the writer task.
    pub(crate) fn send_frame(&self, frame: Frame) -> Result<(), MuxError> {
        if self.is_closed() {
            return Err(self.teardown_cause());
        }
        self.outbound.send(frame).map_err(|_| self.teardown_cause())
    }

    pub(crate) fn note_reset(&self) {
        Counters::bump(&self.counters.streams_reset);
    }

    fn lookup(&self, id: u32) -> Option<Arc<StreamShared>> {
        lock(&self.table).streams.get(&id).cloned()
    }

    /// Forget a stream. Its id is never handed out again.
    pub(crate) fn retire(&self, id: u32) {
        if lock(&self.table).streams.remove(&id).is_some() {
            tracing::debug!(parent: &self.span, stream_id = id, "stream retired");
        }
    }

    /// Reset a stream on the session's initiative and tell the peer.
    fn reset_stream(&self, stream: &StreamShared, cause: ResetCause) {
        if stream.reset(cause) {
            self.note_reset();
            let _ = self.send_frame(Frame::rst(stream.id));
        }
        self.retire(stream.id);
    }

    /// Allocate an id, register the stream and queue its SYN.
    fn open_stream(&self) -> Result<Arc<StreamShared>, MuxError> {
        let mut table = lock(&self.table);
        if self.is_closed() {
            return Err(self.teardown_cause());
        }
        let id = table.next_id.ok_or(MuxError::IdsExhausted)?;
        table.next_id = id.checked_add(2);

        let stream = Arc::new(StreamShared::new(id, &self.config));
        table.streams.insert(id, stream.clone());
        if let Err(e) = self.send_frame(Frame::syn(id)) {
            table.streams.remove(&id);
            return Err(e);
        }
        Ok(stream)
    }

    /// Register a stream created by an inbound SYN. Fails once the session
    /// is closed.
    fn register_remote(&self, stream: Arc<StreamShared>) -> bool {
        let mut table = lock(&self.table);
        if self.is_closed() {
            return false;
        }
        table.streams.insert(stream.id, stream);
        true
    }

    /// Tear the session down: every tracked stream is reset with `cause`,
    /// blocked callers wake up, and both tasks are told to stop. Only the
    /// first call has any effect.
    fn terminate(&self, cause: MuxError) {
        {
            // The cause is in place before anyone can observe `closed`.
            let mut teardown = lock(&self.teardown);
            if teardown.is_some() {
                return;
            }
            *teardown = Some(cause.clone());
            self.closed.store(true, Ordering::Release);
        }

        let streams: Vec<Arc<StreamShared>> = {
            let mut table = lock(&self.table);
            table.streams.drain().map(|(_, s)| s).collect()
        };
        for stream in &streams {
            stream.reset(ResetCause::Session(cause.clone()));
        }
        self.shutdown.send_replace(true);

        match &cause {
            MuxError::SessionClosed => {
                tracing::info!(parent: &self.span, streams = streams.len(), "session closed")
            }
            other => {
                tracing::warn!(parent: &self.span, error = %other, streams = streams.len(), "session terminated")
            }
        }
    }
}

/// Resolve once the shutdown flag is set.
async fn shutdown_signal(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closed| *closed).await;
}

// ─── Session ─────────────────────────────────────────────────────────────────

/// One multiplexing endpoint over one connection.
///
/// Dropping the session tears it down like [`Session::close`], without
/// waiting for the connection to finish closing.
pub struct Session {
    shared: Arc<SessionShared>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Start a session over `conn`, which must carry exactly one frame per
    /// message in each direction. Spawns the reader and writer tasks, so it
    /// must be called from within a tokio runtime.
    pub fn new<T, E>(conn: T, role: Role, config: Config) -> Result<Session, ConfigError>
    where
        T: MessageStream<Item = Result<Bytes, E>> + Sink<Bytes, Error = E> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        config.validate()?;

        let span = match &config.span {
            Some(parent) => tracing::info_span!(parent: parent, "wsmux.session", ?role),
            None => tracing::info_span!("wsmux.session", ?role),
        };

        let (sink, inbound) = conn.split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog);
        let (shutdown, _) = watch::channel(false);
        let reader_shutdown = shutdown.subscribe();
        let writer_shutdown = shutdown.subscribe();

        let shared = Arc::new(SessionShared {
            role,
            table: Mutex::new(StreamTable {
                streams: HashMap::new(),
                next_id: Some(role.first_id()),
            }),
            config,
            span: span.clone(),
            outbound: outbound_tx,
            closed: AtomicBool::new(false),
            teardown: Mutex::new(None),
            shutdown,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            counters: Counters::default(),
        });

        tokio::spawn(
            read_loop(shared.clone(), inbound, accept_tx, reader_shutdown).instrument(span.clone()),
        );
        let writer = tokio::spawn(
            write_loop(shared.clone(), sink, outbound_rx, writer_shutdown).instrument(span.clone()),
        );

        tracing::debug!(parent: &span, "session started");

        Ok(Session {
            shared,
            writer: Mutex::new(Some(writer)),
        })
    }

    /// Start the active-opening side (odd stream ids).
    pub fn client<T, E>(conn: T, config: Config) -> Result<Session, ConfigError>
    where
        T: MessageStream<Item = Result<Bytes, E>> + Sink<Bytes, Error = E> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        Session::new(conn, Role::Client, config)
    }

    /// Start the passive-accepting side (even stream ids).
    pub fn server<T, E>(conn: T, config: Config) -> Result<Session, ConfigError>
    where
        T: MessageStream<Item = Result<Bytes, E>> + Sink<Bytes, Error = E> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        Session::new(conn, Role::Server, config)
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Open a new stream. Never waits: the SYN is queued and the stream can
    /// be written to immediately, within the initial window.
    pub fn open(&self) -> Result<Stream, MuxError> {
        let stream = self.shared.open_stream()?;
        Counters::bump(&self.shared.counters.streams_opened);
        tracing::debug!(parent: &self.shared.span, stream_id = stream.id, "stream opened");
        Ok(Stream::new(stream, self.shared.clone()))
    }

    /// Wait for the peer to open a stream. Cancel-safe: dropping the future
    /// leaves queued streams for the next call.
    pub async fn accept(&self) -> Result<Stream, MuxError> {
        let mut rx = self.shared.accept_rx.lock().await;
        if self.shared.is_closed() {
            return Err(self.shared.teardown_cause());
        }
        match rx.recv().await {
            Some(stream) if !self.shared.is_closed() => {
                Counters::bump(&self.shared.counters.streams_accepted);
                Ok(Stream::new(stream, self.shared.clone()))
            }
            _ => Err(self.shared.teardown_cause()),
        }
    }

    /// Close the session: reset every stream, wake every blocked caller,
    /// flush queued frames and close the connection. Idempotent.
    pub async fn close(&self) -> Result<(), MuxError> {
        self.shared.terminate(MuxError::SessionClosed);

        let writer = lock(&self.writer).take();
        if let Some(mut handle) = writer {
            if tokio::time::timeout(CLOSE_GRACE, &mut handle).await.is_err() {
                tracing::warn!(parent: &self.shared.span, "connection did not close in time, dropping it");
                handle.abort();
            }
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Resolve once the session has terminated, for whatever reason.
    pub async fn closed(&self) -> MuxError {
        let mut rx = self.shared.shutdown.subscribe();
        shutdown_signal(&mut rx).await;
        self.shared.teardown_cause()
    }

    /// Streams currently tracked (not yet retired).
    pub fn stream_count(&self) -> usize {
        lock(&self.shared.table).streams.len()
    }

    pub fn stats(&self) -> SessionStats {
        self.shared.counters.snapshot()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.terminate(MuxError::SessionClosed);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.shared.role)
            .field("closed", &self.is_closed())
            .field("streams", &self.stream_count())
            .finish()
    }
}

// ─── Reader Task ─────────────────────────────────────────────────────────────

/// Routes decoded frames to their streams. Owned by the reader task.
struct Demux<'a> {
    shared: &'a SessionShared,
    accept_tx: mpsc::Sender<Arc<StreamShared>>,
    /// Highest id the peer has opened; SYNs must arrive in increasing order.
    last_remote_id: u32,
}

impl Demux<'_> {
    fn dispatch(&mut self, frame: Frame) {
        let id = frame.stream_id;
        match frame.frame_type {
            FrameType::Syn => self.on_syn(id),
            FrameType::Data => self.on_data(id, frame.payload),
            FrameType::WindowUpdate => {
                let credit = frame.credit().unwrap_or(0);
                match self.shared.lookup(id) {
                    Some(stream) => {
                        if !stream.on_window_update(credit) {
                            tracing::warn!(stream_id = id, credit, "window update overflowed send window");
                        }
                    }
                    None => self.unknown(id, "WINDOW_UPDATE"),
                }
            }
            FrameType::Fin => match self.shared.lookup(id) {
                Some(stream) => {
                    if stream.on_fin() {
                        self.shared.retire(id);
                    }
                }
                None => self.unknown(id, "FIN"),
            },
            FrameType::Rst => match self.shared.lookup(id) {
                Some(stream) => {
                    stream.on_rst();
                    self.shared.note_reset();
                    self.shared.retire(id);
                    tracing::debug!(stream_id = id, "stream reset by peer");
                }
                None => self.unknown(id, "RST"),
            },
        }
    }

    fn on_syn(&mut self, id: u32) {
        if id == 0 || self.shared.role.owns(id) || id <= self.last_remote_id {
            self.shared.counters.record_dropped();
            tracing::warn!(stream_id = id, "ignoring SYN for an invalid or reused stream id");
            return;
        }
        self.last_remote_id = id;

        let stream = Arc::new(StreamShared::new(id, &self.shared.config));
        if !self.shared.register_remote(stream.clone()) {
            return;
        }
        match self.accept_tx.try_send(stream.clone()) {
            Ok(()) => tracing::debug!(stream_id = id, "stream queued for accept"),
            Err(_) => {
                Counters::bump(&self.shared.counters.streams_refused);
                tracing::warn!(stream_id = id, "accept backlog full, refusing stream");
                self.shared.reset_stream(&stream, ResetCause::Local);
            }
        }
    }

    fn on_data(&mut self, id: u32, payload: Bytes) {
        let Some(stream) = self.shared.lookup(id) else {
            self.shared.counters.record_dropped();
            tracing::warn!(stream_id = id, len = payload.len(), "dropping DATA for unknown stream");
            return;
        };
        match stream.on_data(payload) {
            DataOutcome::Buffered => {}
            DataOutcome::Discarded(credit) => {
                if let Some(credit) = credit {
                    let _ = self.shared.send_frame(Frame::window_update(id, credit));
                }
            }
            DataOutcome::Ignored => self.shared.counters.record_dropped(),
            DataOutcome::Violation(reason) => {
                self.shared.counters.record_dropped();
                tracing::warn!(stream_id = id, %reason, "resetting stream after protocol violation");
                self.shared.reset_stream(&stream, ResetCause::Violation);
            }
        }
    }

    /// A DATA frame for `id` was lost to a malformed message. The stream now
    /// has a gap in it, so it cannot continue.
    fn on_damaged_data(&self, id: u32) {
        if let Some(stream) = self.shared.lookup(id) {
            tracing::warn!(stream_id = id, "resetting stream after losing a DATA frame");
            self.shared.reset_stream(&stream, ResetCause::Violation);
        }
    }

    /// Control frames for retired streams are routine races; log quietly.
    fn unknown(&self, id: u32, kind: &'static str) {
        self.shared.counters.record_dropped();
        tracing::debug!(stream_id = id, kind, "dropping frame for unknown stream");
    }
}

async fn read_loop<S, E>(
    shared: Arc<SessionShared>,
    mut inbound: S,
    accept_tx: mpsc::Sender<Arc<StreamShared>>,
    mut shutdown: watch::Receiver<bool>,
) where
    S: MessageStream<Item = Result<Bytes, E>> + Unpin,
    E: fmt::Display,
{
    let max_payload = shared.config.max_frame_payload;
    let mut demux = Demux {
        shared: &shared,
        accept_tx,
        last_remote_id: 0,
    };

    let cause = loop {
        let msg = tokio::select! {
            _ = shutdown_signal(&mut shutdown) => return,
            msg = inbound.next() => msg,
        };
        match msg {
            Some(Ok(msg)) => {
                shared.counters.record_received(msg.len());
                match Frame::decode(msg, max_payload) {
                    Ok(frame) => demux.dispatch(frame),
                    Err(e) if e.is_fatal() => break MuxError::Protocol(e.to_string()),
                    Err(e) => {
                        shared.counters.record_dropped();
                        tracing::warn!(error = %e, "dropping malformed frame");
                        if let Some(id) = e.damaged_data_stream() {
                            demux.on_damaged_data(id);
                        }
                    }
                }
            }
            Some(Err(e)) => break MuxError::Connection(e.to_string()),
            None => break MuxError::Connection("connection closed by peer".into()),
        }
    };

    shared.terminate(cause);
}

// ─── Writer Task ─────────────────────────────────────────────────────────────

async fn write_loop<K, E>(
    shared: Arc<SessionShared>,
    mut sink: K,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    mut shutdown: watch::Receiver<bool>,
) where
    K: Sink<Bytes, Error = E> + Unpin,
    E: fmt::Display,
{
    loop {
        let frame = tokio::select! {
            biased;
            frame = outbound.recv() => frame,
            _ = shutdown_signal(&mut shutdown) => None,
        };
        let Some(frame) = frame else { break };

        let msg = frame.encode();
        let len = msg.len();
        // A peer that stops reading must not pin the writer past shutdown.
        let sent = tokio::select! {
            biased;
            sent = sink.send(msg) => sent,
            _ = shutdown_signal(&mut shutdown) => break,
        };
        if let Err(e) = sent {
            shared.terminate(MuxError::Connection(e.to_string()));
            return;
        }
        shared.counters.record_sent(len);
    }

    // Frames queued before teardown still go out, then the connection closes.
    let flush = async {
        while let Ok(frame) = outbound.try_recv() {
            let msg = frame.encode();
            let len = msg.len();
            if let Err(e) = sink.send(msg).await {
                return Err(e);
            }
            shared.counters.record_sent(len);
        }
        sink.close().await
    };
    match tokio::time::timeout(CLOSE_GRACE, flush).await {
        Ok(Ok(())) => tracing::debug!("connection closed"),
        Ok(Err(e)) => tracing::debug!(error = %e, "connection close failed"),
        Err(_) => tracing::debug!("connection close timed out"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use crate::transport::{MemoryClosed, MemoryTransport};

    /// A connection whose peer never reads and never writes.
    struct Stalled {
        dropped: Arc<AtomicBool>,
    }

    impl MessageStream for Stalled {
        type Item = Result<Bytes, MemoryClosed>;

        fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            Poll::Pending
        }
    }

    impl Sink<Bytes> for Stalled {
        type Error = MemoryClosed;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }

        fn start_send(self: Pin<&mut Self>, _item: Bytes) -> Result<(), Self::Error> {
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }
    }

    impl Drop for Stalled {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn dropped_session_releases_a_stalled_connection() {
        let dropped = Arc::new(AtomicBool::new(false));
        let session = Session::client(
            Stalled {
                dropped: dropped.clone(),
            },
            Config::default(),
        )
        .unwrap();
        let _stream = session.open().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!dropped.load(Ordering::SeqCst));

        drop(session);
        let released = tokio::time::timeout(CLOSE_GRACE * 2, async {
            while !dropped.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(released.is_ok(), "connection outlived the session");
    }

    #[tokio::test]
    async fn teardown_cause_is_visible_once_closed() {
        let (a, _b) = MemoryTransport::pair();
        let session = Session::client(a, Config::default()).unwrap();

        session.shared.terminate(MuxError::Protocol("bad header".into()));
        session.shared.terminate(MuxError::SessionClosed);

        assert!(session.is_closed());
        let cause = MuxError::Protocol("bad header".into());
        assert_eq!(session.open().unwrap_err(), cause);
        assert_eq!(session.accept().await.unwrap_err(), cause);
        assert_eq!(session.closed().await, cause);
    }

    #[test]
    fn roles_partition_ids() {
        assert!(Role::Client.owns(1));
        assert!(Role::Client.owns(u32::MAX));
        assert!(!Role::Client.owns(2));
        assert!(Role::Server.owns(2));
        assert!(!Role::Server.owns(3));
        assert!(!Role::Client.owns(0));
        assert!(!Role::Server.owns(0));
    }

    #[test]
    fn first_ids() {
        assert_eq!(Role::Client.first_id(), 1);
        assert_eq!(Role::Server.first_id(), 2);
    }
}
