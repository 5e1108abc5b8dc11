//! # Errors
//!
//! Session- and stream-level failures. Frame decoding failures live in
//! [`crate::frame::FrameError`], configuration failures in
//! [`crate::config::ConfigError`].

use std::io;

use thiserror::Error;

/// Errors surfaced by [`crate::Session`] and [`crate::Stream`] operations.
///
/// Cloneable so that one session teardown cause can be handed to every stream
/// it terminates.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MuxError {
    /// The session was closed locally.
    #[error("session closed")]
    SessionClosed,
    /// The underlying connection failed or ended.
    #[error("connection error: {0}")]
    Connection(String),
    /// The peer violated the framing protocol badly enough to end the session.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The local write direction of the stream has already been closed.
    #[error("stream {0} closed for writing")]
    StreamClosed(u32),
    /// The stream was reset by either side.
    #[error("stream {0} reset")]
    StreamReset(u32),
    /// A read or write deadline elapsed before the operation could complete.
    #[error("deadline elapsed")]
    Timeout,
    /// Every identifier in this side's partition has been handed out.
    #[error("stream ids exhausted")]
    IdsExhausted,
}

impl MuxError {
    /// Whether this error ended the whole session rather than one stream.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            MuxError::SessionClosed | MuxError::Connection(_) | MuxError::Protocol(_)
        )
    }

    fn io_kind(&self) -> io::ErrorKind {
        match self {
            MuxError::SessionClosed => io::ErrorKind::NotConnected,
            MuxError::Connection(_) => io::ErrorKind::ConnectionAborted,
            MuxError::Protocol(_) => io::ErrorKind::InvalidData,
            MuxError::StreamClosed(_) => io::ErrorKind::BrokenPipe,
            MuxError::StreamReset(_) => io::ErrorKind::ConnectionReset,
            MuxError::Timeout => io::ErrorKind::TimedOut,
            MuxError::IdsExhausted => io::ErrorKind::Other,
        }
    }
}

impl From<MuxError> for io::Error {
    fn from(err: MuxError) -> Self {
        io::Error::new(err.io_kind(), err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_conversion_keeps_kind_and_source() {
        let err: io::Error = MuxError::StreamReset(7).into();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(err.to_string(), "stream 7 reset");

        let inner = err.into_inner().unwrap();
        let mux = inner.downcast_ref::<MuxError>().unwrap();
        assert_eq!(mux, &MuxError::StreamReset(7));
    }

    #[test]
    fn session_fatal_classification() {
        assert!(MuxError::SessionClosed.is_session_fatal());
        assert!(MuxError::Connection("eof".into()).is_session_fatal());
        assert!(!MuxError::StreamClosed(1).is_session_fatal());
        assert!(!MuxError::Timeout.is_session_fatal());
    }
}
