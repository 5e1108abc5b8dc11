//! # wsmux
//!
//! Many independent, ordered, flow-controlled byte streams over one
//! message-oriented connection such as a WebSocket.
//!
//! Each side wraps its end of the connection in a [`Session`]. Streams are
//! opened with [`Session::open`] and received with [`Session::accept`]; a
//! [`Stream`] is an ordinary tokio `AsyncRead + AsyncWrite`.
//!
//! ```no_run
//! # async fn demo(ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>) -> Result<(), Box<dyn std::error::Error>> {
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//! use wsmux::{Config, Session, WsTransport};
//!
//! let session = Session::client(WsTransport::new(ws), Config::default())?;
//! let mut stream = session.open()?;
//! stream.write_all(b"hello").await?;
//! stream.close().await?;
//!
//! let mut reply = Vec::new();
//! stream.read_to_end(&mut reply).await?;
//! session.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Crate structure
//!
//! - [`frame`] — Wire format: one frame per message
//! - [`window`] — Per-stream send/receive credit
//! - [`stream`] — Stream state machine and the `AsyncRead`/`AsyncWrite` handle
//! - [`session`] — Reader/writer tasks, id allocation, accept queue
//! - [`transport`] — In-memory and WebSocket message transports
//! - [`config`] — Session settings and TOML loading
//! - [`stats`] — Session counters

pub mod config;
pub mod error;
pub mod frame;
pub mod session;
pub mod stats;
pub mod stream;
pub mod transport;
pub mod window;

pub use config::{Config, ConfigError};
pub use error::MuxError;
pub use session::{Role, Session};
pub use stats::SessionStats;
pub use stream::{Stream, StreamPhase};
pub use transport::{MemoryClosed, MemoryTransport};
#[cfg(feature = "websocket")]
pub use transport::WsTransport;
