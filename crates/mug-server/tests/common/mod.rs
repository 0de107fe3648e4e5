#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use mug_proto::codec::{encode_message, try_decode_tcp_frames};
use mug_proto::constants::VERSION;
use mug_proto::messages::Message;
use mug_proto::messages::matchmaking::{GameMatched, RequestMatch, ValidationResult};
use mug_proto::messages::session::{Hello, Welcome};
use mug_proto::msg_id::MsgId;
use mug_server::ServerConfig;
use mug_server::net::tcp::run_tcp_listener_with_listener;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

pub async fn spawn_test_server(config: ServerConfig) -> SocketAddr {
    let (event_tx, event_rx) = mpsc::channel(1024);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let _ = run_tcp_listener_with_listener(listener, event_tx, None).await;
    });
    tokio::spawn(async move {
        let _ = mug_server::run_server(event_rx, config).await;
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    addr
}

/// Relay client speaking the native framing.
pub struct TestClient {
    stream: TcpStream,
    buf: Vec<u8>,
    inbox: Vec<(MsgId, Vec<u8>)>,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        Ok(Self {
            stream: TcpStream::connect(addr).await?,
            buf: Vec::new(),
            inbox: Vec::new(),
        })
    }

    pub async fn send<M: Message>(&mut self, msg: &M) -> anyhow::Result<()> {
        let frame = encode_message(msg)?;
        self.stream.write_all(&frame).await?;
        Ok(())
    }

    async fn fill(&mut self, deadline: Instant) -> anyhow::Result<bool> {
        let mut chunk = [0u8; 8192];
        let n = match timeout_at(deadline, self.stream.read(&mut chunk)).await {
            Ok(res) => res?,
            Err(_) => return Ok(false),
        };
        if n == 0 {
            anyhow::bail!("server closed the connection");
        }
        self.buf.extend_from_slice(&chunk[..n]);
        let (packets, consumed) = try_decode_tcp_frames(&self.buf)?;
        let decoded: Vec<(MsgId, Vec<u8>)> = packets
            .iter()
            .map(|p| (p.msg_id(), p.payload.to_vec()))
            .collect();
        self.buf.drain(..consumed);
        self.inbox.extend(decoded);
        Ok(true)
    }

    fn take<M: Message>(&mut self) -> anyhow::Result<Option<M>> {
        let Some(pos) = self.inbox.iter().position(|(id, _)| *id == M::msg_id()) else {
            return Ok(None);
        };
        let (_, payload) = self.inbox.remove(pos);
        Ok(Some(postcard::from_bytes(&payload)?))
    }

    /// Next message of type `M`; other messages stay queued.
    pub async fn recv<M: Message>(&mut self) -> anyhow::Result<M> {
        let deadline = Instant::now() + RECV_TIMEOUT;
        loop {
            if let Some(msg) = self.take::<M>()? {
                return Ok(msg);
            }
            if !self.fill(deadline).await? {
                anyhow::bail!("timed out waiting for {:?}", M::msg_id());
            }
        }
    }

    /// True if no `M` arrives within `window`.
    pub async fn quiet<M: Message>(&mut self, window: Duration) -> anyhow::Result<bool> {
        let deadline = Instant::now() + window;
        loop {
            if self.inbox.iter().any(|(id, _)| *id == M::msg_id()) {
                return Ok(false);
            }
            if !self.fill(deadline).await? {
                return Ok(true);
            }
        }
    }

    pub async fn hello(&mut self, subject: &str) -> anyhow::Result<Welcome> {
        self.send(&Hello {
            subject_id: subject.to_string(),
            proto_version: VERSION,
        })
        .await?;
        self.recv::<Welcome>().await
    }

    pub async fn request_match(&mut self, scene: &str, rtt_ms: Option<u32>) -> anyhow::Result<()> {
        self.send(&RequestMatch {
            scene_id: scene.to_string(),
            rtt_ms,
        })
        .await
    }

    pub async fn validate(&mut self, matched: &GameMatched, ok: bool) -> anyhow::Result<()> {
        self.send(&ValidationResult {
            game_id: matched.game_id.clone(),
            attempt: matched.validation_attempt,
            ok,
        })
        .await
    }
}

/// Two identified clients matched into one game, in slot order.
pub async fn matched_pair(
    addr: SocketAddr,
    scene: &str,
) -> anyhow::Result<((TestClient, GameMatched), (TestClient, GameMatched))> {
    let mut a = TestClient::connect(addr).await?;
    let mut b = TestClient::connect(addr).await?;
    a.hello(&format!("{scene}-a")).await?;
    b.hello(&format!("{scene}-b")).await?;
    a.request_match(scene, Some(20)).await?;
    // Make sure `a` is pooled first so it takes slot 0.
    a.recv::<mug_proto::messages::matchmaking::WaitingForMatch>().await?;
    b.request_match(scene, Some(25)).await?;
    let ma = a.recv::<GameMatched>().await?;
    let mb = b.recv::<GameMatched>().await?;
    Ok(((a, ma), (b, mb)))
}

/// Two clients in a playing game.
pub async fn playing_pair(
    addr: SocketAddr,
    scene: &str,
) -> anyhow::Result<((TestClient, GameMatched), (TestClient, GameMatched))> {
    let ((mut a, ma), (mut b, mb)) = matched_pair(addr, scene).await?;
    a.validate(&ma, true).await?;
    b.validate(&mb, true).await?;
    a.recv::<mug_proto::messages::matchmaking::GameStarted>().await?;
    b.recv::<mug_proto::messages::matchmaking::GameStarted>().await?;
    Ok(((a, ma), (b, mb)))
}
