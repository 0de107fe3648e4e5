//! Relay listener. One port serves native TCP framing and WebSocket; the
//! first bytes of a connection decide which.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{Sink, SinkExt, StreamExt};
use mug_proto::codec::encode_message;
use mug_proto::messages::session::{ErrorCode, ErrorMsg};
use mug_proto::packet::FrameReader;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite};
use tokio_util::codec::{BytesCodec, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::inbound::{ConnId, InboundEvent, TransportKind, next_conn_id};
use super::outbound::spawn_writer;
use super::rate_limit::IpRateLimiter;
use super::websocket::WsByteStream;

/// Frames queued per connection before the server loop waits on it.
const OUTBOUND_QUEUE: usize = 1024;

pub async fn run_tcp_listener(
    bind: SocketAddr,
    tx: mpsc::Sender<InboundEvent>,
    ip_rate_limiter: Option<Arc<IpRateLimiter>>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "Relay listening");
    run_tcp_listener_with_listener(listener, tx, ip_rate_limiter).await
}

/// Accept loop on an already bound listener (tests bind port 0).
pub async fn run_tcp_listener_with_listener(
    listener: TcpListener,
    tx: mpsc::Sender<InboundEvent>,
    ip_rate_limiter: Option<Arc<IpRateLimiter>>,
) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let allowed = ip_rate_limiter
            .as_ref()
            .is_none_or(|limiter| limiter.allow(peer.ip()));
        if !allowed {
            warn!(%peer, "Connection refused: too many connections from this address");
            tokio::spawn(refuse(stream));
            continue;
        }
        let conn_id = next_conn_id();
        tokio::spawn(handle_tcp_connection(stream, peer, conn_id, tx.clone()));
    }
}

/// Browsers open with an HTTP upgrade request; native clients open with a
/// binary length prefix.
async fn detect_transport(stream: &TcpStream) -> std::io::Result<TransportKind> {
    let mut head = [0u8; 4];
    let n = stream.peek(&mut head).await?;
    Ok(if head[..n] == *b"GET " {
        TransportKind::WebSocket
    } else {
        TransportKind::Tcp
    })
}

pub async fn handle_tcp_connection(
    stream: TcpStream,
    peer: SocketAddr,
    conn_id: ConnId,
    tx: mpsc::Sender<InboundEvent>,
) {
    let _ = stream.set_nodelay(true);
    let transport = match detect_transport(&stream).await {
        Ok(t) => t,
        Err(e) => {
            debug!(%peer, error = %e, "Connection closed before first bytes");
            return;
        }
    };

    match transport {
        TransportKind::Tcp => {
            let (read, write) = stream.into_split();
            let sink = FramedWrite::new(write, BytesCodec::new());
            serve(read, sink, peer, conn_id, transport, tx).await;
        }
        TransportKind::WebSocket => {
            let ws = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!(%peer, error = %e, "WebSocket upgrade failed");
                    return;
                }
            };
            let (write, read) = ws.split();
            let sink = write
                .sink_map_err(std::io::Error::other)
                .with(|frame: Bytes| std::future::ready(Ok(tungstenite::Message::Binary(frame))));
            serve(WsByteStream::new(read), sink, peer, conn_id, transport, tx).await;
        }
    }
}

/// Tell a refused client why, in whichever dialect it speaks, and hang up.
async fn refuse(mut stream: TcpStream) {
    let reply = match detect_transport(&stream).await {
        Ok(TransportKind::WebSocket) => {
            b"HTTP/1.1 429 Too Many Requests\r\nConnection: close\r\n\r\n".to_vec()
        }
        Ok(TransportKind::Tcp) => encode_message(&ErrorMsg {
            code: ErrorCode::RateLimited,
        })
        .unwrap_or_default(),
        Err(_) => return,
    };
    let _ = stream.write_all(&reply).await;
    let _ = stream.shutdown().await;
}

async fn serve<R, S>(
    mut read: R,
    write: S,
    peer: SocketAddr,
    conn_id: ConnId,
    transport: TransportKind,
    tx: mpsc::Sender<InboundEvent>,
) where
    R: AsyncRead + Unpin,
    S: Sink<Bytes, Error = std::io::Error> + Unpin + Send + 'static,
{
    let (out_tx, out_rx) = mpsc::channel::<Bytes>(OUTBOUND_QUEUE);
    let writer = spawn_writer(write, out_rx);
    let cancel_token = CancellationToken::new();

    let connected = InboundEvent::Connected {
        conn_id,
        peer,
        transport,
        outbound: out_tx.clone(),
        cancel_token: cancel_token.clone(),
    };
    if tx.send(connected).await.is_err() {
        return;
    }
    debug!(conn_id, %peer, ?transport, "Relay connection open");

    let reason = read_frames(&mut read, peer, conn_id, &tx, &cancel_token).await;
    let _ = tx
        .send(InboundEvent::Disconnected {
            conn_id,
            peer,
            reason,
        })
        .await;

    // The writer stops once the server loop has dropped its sender too.
    drop(out_tx);
    let _ = writer.await;
}

/// Forward decoded frames until the connection ends; returns why it ended.
async fn read_frames<R: AsyncRead + Unpin>(
    read: &mut R,
    peer: SocketAddr,
    conn_id: ConnId,
    tx: &mpsc::Sender<InboundEvent>,
    cancel_token: &CancellationToken,
) -> String {
    let mut frames = FrameReader::new();
    loop {
        if frames.is_overfull() {
            return format!("{} unconsumed bytes buffered", frames.buffered());
        }
        let read_res = tokio::select! {
            res = read.read_buf(frames.read_buf()) => res,
            _ = cancel_token.cancelled() => return "closed by server".to_string(),
        };
        match read_res {
            Ok(0) => return "eof".to_string(),
            Ok(_) => {}
            Err(e) => return format!("read error: {e}"),
        }
        let packets = match frames.drain() {
            Ok(p) => p,
            Err(e) => return format!("protocol error: {e}"),
        };
        for packet in packets {
            let event = InboundEvent::Packet {
                conn_id,
                peer,
                packet,
            };
            if tx.send(event).await.is_err() {
                return "server loop stopped".to_string();
            }
        }
    }
}
