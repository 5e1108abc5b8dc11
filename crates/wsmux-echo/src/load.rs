//! Load check: many concurrent streams over one client session, each
//! verified against its own payload.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinSet;
use tokio::time::Instant;
use wsmux::{Config, Session, SessionStats, WsTransport};

#[derive(Debug, Clone)]
pub struct LoadParams {
    pub streams: usize,
    pub size: usize,
    pub read_timeout: Duration,
}

/// Run the load check and return the client session's final counters. Fails if
/// any stream did not come back intact.
pub async fn run(url: &str, params: LoadParams, config: Config) -> anyhow::Result<SessionStats> {
    let (ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .with_context(|| format!("connecting to {url}"))?;
    let session = Arc::new(Session::client(WsTransport::new(ws), config)?);
    tracing::info!(url, streams = params.streams, size = params.size, "load check started");

    let started = Instant::now();
    let mut tasks = JoinSet::new();
    for seed in 0..params.streams {
        let session = session.clone();
        let params = params.clone();
        tasks.spawn(async move { check_stream(&session, seed, &params).await });
    }

    let mut failures = 0usize;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                failures += 1;
                tracing::error!("stream failed: {e:#}");
            }
            Err(e) => {
                failures += 1;
                tracing::error!("load task failed: {e}");
            }
        }
    }

    let stats = session.stats();
    tracing::info!(
        streams = params.streams,
        failures,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "load check finished"
    );
    session.close().await?;

    anyhow::ensure!(failures == 0, "{failures} of {} streams failed", params.streams);
    Ok(stats)
}

async fn check_stream(session: &Session, seed: usize, params: &LoadParams) -> anyhow::Result<()> {
    let payload = payload(seed, params.size);
    let mut stream = session.open()?;
    let id = stream.id();
    stream.set_read_deadline(Some(Instant::now() + params.read_timeout));

    let (mut rd, mut wr) = tokio::io::split(stream);
    let writer = async {
        wr.write_all(&payload).await?;
        wr.shutdown().await
    };
    let reader = async {
        let mut back = Vec::with_capacity(payload.len());
        rd.read_to_end(&mut back).await.map(|_| back)
    };
    let ((), back) = tokio::try_join!(writer, reader).with_context(|| format!("stream {id}"))?;

    anyhow::ensure!(
        back == payload,
        "stream {id}: echo mismatch ({} of {} bytes)",
        back.len(),
        payload.len()
    );
    tracing::debug!(stream_id = id, bytes = payload.len(), "stream verified");
    Ok(())
}

/// Deterministic per-stream payload, so crossed streams show up as
/// mismatches.
fn payload(seed: usize, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (i.wrapping_mul(31) ^ seed.wrapping_mul(0x9E)) as u8)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::sync::watch;

    #[test]
    fn payloads_differ_per_stream() {
        assert_eq!(payload(3, 100), payload(3, 100));
        assert_ne!(payload(1, 100), payload(2, 100));
        assert!(payload(0, 0).is_empty());
    }

    #[tokio::test]
    async fn load_against_local_relay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let relay = tokio::spawn(crate::serve::run(listener, Config::default(), shutdown_rx));

        let params = LoadParams {
            streams: 20,
            size: 100_000,
            read_timeout: Duration::from_secs(10),
        };
        let stats = run(&format!("ws://{addr}"), params, Config::default())
            .await
            .unwrap();
        assert_eq!(stats.streams_opened, 20);
        assert_eq!(stats.frames_dropped, 0);

        shutdown_tx.send(true).unwrap();
        relay.await.unwrap().unwrap();
    }
}
