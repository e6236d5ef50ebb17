//! Framebuffer WS↔TCP byte pump: split sink/stream over the upgraded
//! socket, raced against the TCP read/write halves with `tokio::select!`.
//! The wire surface carries binary frames only, so there's no encoding-mode
//! tracking to do here.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const TCP_READ_BUF_SIZE: usize = 8192;

#[derive(Debug, Clone)]
pub struct FramebufferTarget {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
}

impl FramebufferTarget {
    pub fn new(host: String, port: u16) -> Self {
        Self {
            host,
            port,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    Ws(#[from] axum::Error),
}

/// Drives one framebuffer session from upgraded socket to completion.
/// Failure to reach the upstream is reported by simply closing the
/// WebSocket rather than an HTTP-level error.
pub async fn run_session(socket: WebSocket, target: Arc<FramebufferTarget>, remote: SocketAddr) {
    if let Err(err) = pump(socket, target, remote).await {
        tracing::warn!(%remote, %err, "framebuffer session ended with error");
    }
}

async fn pump(
    socket: WebSocket,
    target: Arc<FramebufferTarget>,
    remote: SocketAddr,
) -> Result<(), ProxyError> {
    let tcp = timeout(
        target.connect_timeout,
        TcpStream::connect((target.host.as_str(), target.port)),
    )
    .await
    .map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "timed out connecting to framebuffer upstream",
        )
    })??;

    tracing::info!(
        %remote,
        target = %format!("{}:{}", target.host, target.port),
        "framebuffer session upstream connected"
    );

    let (tcp_reader, tcp_writer) = tcp.into_split();
    let (ws_sink, mut ws_stream) = socket.split();
    let ws_sink: Arc<Mutex<SplitSink<WebSocket, Message>>> = Arc::new(Mutex::new(ws_sink));

    let ws_to_tcp = {
        let ws_sink = ws_sink.clone();
        let mut tcp_writer = tcp_writer;
        async move {
            while let Some(msg) = ws_stream.next().await {
                match msg? {
                    // Both variants are coalesced to a contiguous byte
                    // buffer before the upstream write —
                    // axum delivers one message at a time regardless of
                    // how the client framed it, so there is no separate
                    // "array of binaries" shape to reassemble here.
                    Message::Binary(data) => tcp_writer.write_all(&data).await?,
                    Message::Text(text) => tcp_writer.write_all(text.as_bytes()).await?,
                    Message::Ping(payload) => {
                        ws_sink.lock().await.send(Message::Pong(payload)).await?;
                    }
                    Message::Pong(_) => {}
                    Message::Close(_) => break,
                }
            }
            tcp_writer.shutdown().await.ok();
            Ok::<_, ProxyError>(())
        }
    };

    let tcp_to_ws = {
        let ws_sink = ws_sink.clone();
        let mut tcp_reader = tcp_reader;
        async move {
            let mut buf = [0u8; TCP_READ_BUF_SIZE];
            loop {
                let n = tcp_reader.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                ws_sink
                    .lock()
                    .await
                    .send(Message::Binary(buf[..n].to_vec()))
                    .await?;
            }
            Ok::<_, ProxyError>(())
        }
    };

    // Symmetric teardown: whichever side closes or errors first wins the
    // race and the other side is abandoned immediately rather than waited
    // on to finish naturally (a peer that never closes its half would
    // otherwise pin this task open forever after the other side is gone).
    // Both halves of the TCP stream are dropped when their futures are
    // dropped here, which closes the socket; the close frame below handles
    // the WebSocket side.
    let result = tokio::select! {
        res = ws_to_tcp => res,
        res = tcp_to_ws => res,
    };

    let _ = ws_sink.lock().await.send(Message::Close(None)).await;

    tracing::info!(%remote, "framebuffer session closed");
    result
}
