//! # Message Transports
//!
//! A session runs over anything that is both a `futures` [`Stream`] of
//! inbound messages and a [`Sink`] of outbound ones, one frame per message.
//!
//! - [`MemoryTransport`]: an in-process pair, for tests and for wiring two
//!   sessions together inside one program.
//! - [`WsTransport`]: binary WebSocket messages over
//!   `tokio-tungstenite` (feature `websocket`, on by default).

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::channel::mpsc;
use futures::{Sink, Stream, StreamExt};
use thiserror::Error;

// ─── In-Memory ───────────────────────────────────────────────────────────────

/// The other end of a [`MemoryTransport`] has gone away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("memory transport peer is gone")]
pub struct MemoryClosed;

/// One end of an in-process message pipe. Closing the sink ends the peer's
/// inbound stream, just like closing a socket.
#[derive(Debug)]
pub struct MemoryTransport {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl MemoryTransport {
    /// Two connected ends.
    pub fn pair() -> (MemoryTransport, MemoryTransport) {
        let (a_tx, b_rx) = mpsc::unbounded();
        let (b_tx, a_rx) = mpsc::unbounded();
        (
            MemoryTransport { tx: a_tx, rx: a_rx },
            MemoryTransport { tx: b_tx, rx: b_rx },
        )
    }
}

impl Stream for MemoryTransport {
    type Item = Result<Bytes, MemoryClosed>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_next_unpin(cx).map(|msg| msg.map(Ok))
    }
}

impl Sink<Bytes> for MemoryTransport {
    type Error = MemoryClosed;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.tx.poll_ready(cx).map_err(|_| MemoryClosed)
    }

    fn start_send(self: Pin<&mut Self>, item: Bytes) -> Result<(), Self::Error> {
        self.tx.unbounded_send(item).map_err(|_| MemoryClosed)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.tx.close_channel();
        Poll::Ready(Ok(()))
    }
}

// ─── WebSocket ───────────────────────────────────────────────────────────────

#[cfg(feature = "websocket")]
pub use self::ws::WsTransport;

#[cfg(feature = "websocket")]
mod ws {
    use std::pin::Pin;
    use std::task::{ready, Context, Poll};

    use bytes::Bytes;
    use futures::{Sink, Stream};
    use tokio::io::{AsyncRead, AsyncWrite};
    use tokio_tungstenite::tungstenite::{Error as WsError, Message};
    use tokio_tungstenite::WebSocketStream;

    /// Carries one frame per binary WebSocket message.
    ///
    /// Text messages are ignored. Pings are answered by tungstenite itself
    /// and pongs are ignored. A close message ends the inbound stream.
    pub struct WsTransport<S> {
        inner: WebSocketStream<S>,
    }

    impl<S> WsTransport<S> {
        pub fn new(inner: WebSocketStream<S>) -> Self {
            WsTransport { inner }
        }

        pub fn get_ref(&self) -> &WebSocketStream<S> {
            &self.inner
        }

        pub fn into_inner(self) -> WebSocketStream<S> {
            self.inner
        }
    }

    impl<S> Stream for WsTransport<S>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        type Item = Result<Bytes, WsError>;

        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            loop {
                match ready!(Pin::new(&mut self.inner).poll_next(cx)) {
                    Some(Ok(Message::Binary(data))) => return Poll::Ready(Some(Ok(data))),
                    Some(Ok(Message::Close(_))) | None => return Poll::Ready(None),
                    Some(Ok(_)) => tracing::trace!("ignoring non-binary websocket message"),
                    Some(Err(e)) => return Poll::Ready(Some(Err(e))),
                }
            }
        }
    }

    impl<S> Sink<Bytes> for WsTransport<S>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        type Error = WsError;

        fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Pin::new(&mut self.inner).poll_ready(cx)
        }

        fn start_send(mut self: Pin<&mut Self>, item: Bytes) -> Result<(), Self::Error> {
            Pin::new(&mut self.inner).start_send(Message::Binary(item))
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Pin::new(&mut self.inner).poll_close(cx)
        }
    }
}
