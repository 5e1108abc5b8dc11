//! Sessions over a real WebSocket on a loopback TCP socket.

#![cfg(feature = "websocket")]

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;
use wsmux::{Config, MuxError, Session, WsTransport};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn echo_over_websocket() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        let session = Session::server(WsTransport::new(ws), Config::default()).unwrap();
        while let Ok(mut stream) = session.accept().await {
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
            stream.close().await.unwrap();
        }
        session.closed().await
    });

    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .unwrap();
    let session = Session::client(WsTransport::new(ws), Config::default()).unwrap();

    for i in 0..3u8 {
        let payload = vec![i; 40_000];
        let mut stream = session.open().unwrap();
        stream.write_all(&payload).await.unwrap();
        stream.close().await.unwrap();
        let mut back = Vec::new();
        timeout(WAIT, stream.read_to_end(&mut back))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(back, payload);
    }

    session.close().await.unwrap();
    let cause = timeout(WAIT, server).await.unwrap().unwrap();
    assert!(matches!(cause, MuxError::Connection(_)), "got {cause:?}");
}
