//! Async client for the relay/coordination server.
//!
//! One TCP connection carries matchmaking, session lifecycle, reconnection
//! coordination and WebRTC signaling. A reader task turns frames into
//! [`ClientEvent`]s; a writer task drains queued frames.

use std::net::SocketAddr;

use bytes::Bytes;
use mug_proto::{
    codec::encode_message,
    error::ProtoError,
    messages::{
        Message,
        keepalive::Pong,
        matchmaking::{GameMatched, GameStarted, WaitingForMatch},
        reconnect::{GameEnded, Pause, Resume},
        session::{ErrorMsg, Welcome},
        signaling::RelayedSignal,
    },
    msg_id::MsgId,
    packet::{FrameReader, Packet},
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
};
use tracing::{debug, error, info, trace, warn};

use crate::error::NetplayError;

/// Messages the server sends to participants.
#[derive(Debug, Clone)]
pub enum ServerMessage {
    Welcome(Welcome),
    Error(ErrorMsg),
    WaitingForMatch(WaitingForMatch),
    GameMatched(GameMatched),
    GameStarted(GameStarted),
    Pause(Pause),
    Resume(Resume),
    GameEnded(GameEnded),
    RelayedSignal(RelayedSignal),
    Pong(Pong),
}

impl ServerMessage {
    /// Decode a server→client packet. Client→server ids are rejected.
    pub fn decode(packet: &Packet) -> Result<Self, ProtoError> {
        let msg = match packet.msg_id() {
            MsgId::Welcome => Self::Welcome(packet.decode()?),
            MsgId::Error => Self::Error(packet.decode()?),
            MsgId::WaitingForMatch => Self::WaitingForMatch(packet.decode()?),
            MsgId::GameMatched => Self::GameMatched(packet.decode()?),
            MsgId::GameStarted => Self::GameStarted(packet.decode()?),
            MsgId::Pause => Self::Pause(packet.decode()?),
            MsgId::Resume => Self::Resume(packet.decode()?),
            MsgId::GameEnded => Self::GameEnded(packet.decode()?),
            MsgId::RelayedSignal => Self::RelayedSignal(packet.decode()?),
            MsgId::Pong => Self::Pong(packet.decode()?),
            other => return Err(ProtoError::UnknownMsgId(other as u8)),
        };
        Ok(msg)
    }
}

/// Events sent from the connection tasks to the owner.
#[derive(Debug)]
pub enum ClientEvent {
    Connected,
    Disconnected { reason: String },
    Packet(Packet),
    Error(String),
}

#[derive(Debug)]
enum WriterCommand {
    SendRaw(Bytes),
    Disconnect,
}

/// Cloneable handle for sending to the server.
#[derive(Clone)]
pub struct ClientHandle {
    cmd_tx: mpsc::Sender<WriterCommand>,
}

impl ClientHandle {
    pub async fn send_message<M: Message>(&self, msg: &M) -> Result<(), NetplayError> {
        let bytes = encode_message(msg)?;
        self.cmd_tx
            .send(WriterCommand::SendRaw(Bytes::from(bytes)))
            .await
            .map_err(|_| NetplayError::ChannelSend)
    }

    pub async fn disconnect(&self) -> Result<(), NetplayError> {
        self.cmd_tx
            .send(WriterCommand::Disconnect)
            .await
            .map_err(|_| NetplayError::ChannelSend)
    }
}

/// Connect to the server and spawn the reader and writer tasks.
pub async fn connect(
    addr: SocketAddr,
    event_tx: mpsc::Sender<ClientEvent>,
) -> Result<ClientHandle, NetplayError> {
    info!("Connecting to MUG server at {}", addr);

    let stream = TcpStream::connect(addr).await.map_err(|e| {
        NetplayError::ConnectionFailed(format!("Failed to connect to {}: {}", addr, e))
    })?;
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();

    let (cmd_tx, cmd_rx) = mpsc::channel::<WriterCommand>(256);

    let event_tx_writer = event_tx.clone();
    tokio::spawn(async move {
        writer_loop(write_half, cmd_rx, event_tx_writer).await;
    });
    tokio::spawn(async move {
        reader_loop(read_half, event_tx).await;
    });

    Ok(ClientHandle { cmd_tx })
}

async fn writer_loop(
    mut write: impl AsyncWrite + Unpin,
    mut cmd_rx: mpsc::Receiver<WriterCommand>,
    event_tx: mpsc::Sender<ClientEvent>,
) {
    loop {
        match cmd_rx.recv().await {
            Some(WriterCommand::SendRaw(bytes)) => {
                trace!("Sending {} bytes to server", bytes.len());
                if let Err(e) = write.write_all(&bytes).await {
                    error!("Write error: {}", e);
                    let _ = event_tx.send(ClientEvent::Error(e.to_string())).await;
                    break;
                }
            }
            Some(WriterCommand::Disconnect) => {
                debug!("Disconnect command received");
                break;
            }
            None => {
                debug!("Command channel closed");
                break;
            }
        }
    }
    let _ = write.shutdown().await;
}

async fn reader_loop(mut read: impl AsyncRead + Unpin, event_tx: mpsc::Sender<ClientEvent>) {
    let mut frames = FrameReader::new();
    let _ = event_tx.send(ClientEvent::Connected).await;

    let reason = loop {
        match read.read_buf(frames.read_buf()).await {
            Ok(0) => {
                info!("Server closed connection");
                break "server closed connection".to_string();
            }
            Ok(n) => trace!("Received {} bytes from server", n),
            Err(e) => {
                error!("Read error: {}", e);
                break e.to_string();
            }
        }
        let packets = match frames.drain() {
            Ok(p) => p,
            Err(e) => {
                error!("Protocol decode error: {}", e);
                break format!("protocol error: {}", e);
            }
        };
        for packet in packets {
            debug!("Received {:?} from server", packet.msg_id());
            if event_tx.send(ClientEvent::Packet(packet)).await.is_err() {
                warn!("Event channel closed");
                return;
            }
        }
    };
    let _ = event_tx.send(ClientEvent::Disconnected { reason }).await;
}
