//! Echo relay: one server session per WebSocket connection, one task per
//! accepted stream.

use std::net::SocketAddr;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use wsmux::{Config, Session, Stream, WsTransport};

/// Accept connections until `shutdown` changes.
pub async fn run(
    listener: TcpListener,
    config: Config,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    loop {
        let (tcp, peer) = tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => accepted?,
        };
        let config = config.clone().with_span(tracing::info_span!("conn", %peer));
        tokio::spawn(async move {
            if let Err(e) = handle(tcp, peer, config).await {
                tracing::warn!(%peer, "connection failed: {e:#}");
            }
        });
    }
    Ok(())
}

async fn handle(tcp: TcpStream, peer: SocketAddr, config: Config) -> anyhow::Result<()> {
    let ws = tokio_tungstenite::accept_async(tcp).await?;
    let session = Session::server(WsTransport::new(ws), config)?;
    tracing::info!(%peer, "session established");

    while let Ok(stream) = session.accept().await {
        tokio::spawn(echo(stream));
    }

    let cause = session.closed().await;
    let stats = session.stats();
    tracing::info!(
        %peer,
        %cause,
        streams = stats.streams_accepted,
        bytes_in = stats.bytes_received,
        bytes_out = stats.bytes_sent,
        dropped = stats.frames_dropped,
        "session ended"
    );
    Ok(())
}

/// Copy the stream back onto itself until the peer's FIN, then half-close.
async fn echo(stream: Stream) {
    let id = stream.id();
    let (mut rd, mut wr) = tokio::io::split(stream);
    let result = async {
        let n = tokio::io::copy(&mut rd, &mut wr).await?;
        wr.shutdown().await?;
        Ok::<_, std::io::Error>(n)
    }
    .await;

    match result {
        Ok(n) => tracing::debug!(stream_id = id, bytes = n, "stream echoed"),
        Err(e) => tracing::debug!(stream_id = id, error = %e, "echo aborted"),
    }
}
