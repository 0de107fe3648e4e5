use bytes::Bytes;
use futures_util::{Sink, SinkExt};
use mug_proto::codec::encode_message;
use mug_proto::error::ProtoError;
use mug_proto::messages::Message;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, warn};

/// Sender for already-framed bytes to one connection.
pub type OutboundTx = mpsc::Sender<Bytes>;

/// Spawn a task writing framed bytes to `write` until the channel closes.
pub fn spawn_writer<S>(
    mut write: S,
    mut rx: mpsc::Receiver<Bytes>,
) -> tokio::task::JoinHandle<anyhow::Result<()>>
where
    S: Sink<Bytes, Error = std::io::Error> + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            write.send(frame).await?;
        }
        Ok(())
    })
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("encode failed: {0}")]
    Encode(#[from] ProtoError),
    #[error("connection closed")]
    Closed,
}

/// Encode `msg` into one frame and queue it on `tx`.
pub async fn send_msg<M: Message>(tx: &OutboundTx, msg: &M) -> Result<(), SendError> {
    let frame = Bytes::from(encode_message(msg)?);
    tx.send(frame).await.map_err(|_| SendError::Closed)
}

/// Frames queued while a game session is locked, sent after the lock is
/// released.
#[derive(Debug, Default)]
pub struct Outbox {
    frames: Vec<(OutboundTx, Bytes)>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<M: Message>(&mut self, tx: &OutboundTx, msg: &M) {
        self.broadcast(std::slice::from_ref(tx), msg);
    }

    /// Queue one encoded copy of `msg` per recipient.
    pub fn broadcast<M: Message>(&mut self, recipients: &[OutboundTx], msg: &M) {
        match encode_message(msg) {
            Ok(frame) => {
                let frame = Bytes::from(frame);
                for tx in recipients {
                    self.frames.push((tx.clone(), frame.clone()));
                }
            }
            Err(e) => error!(msg_id = ?M::msg_id(), error = %e, "Failed to encode message"),
        }
    }

    pub fn append(&mut self, other: Outbox) {
        self.frames.extend(other.frames);
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Send everything. Closed connections are skipped.
    pub async fn flush(self) {
        for (tx, frame) in self.frames {
            if tx.send(frame).await.is_err() {
                warn!("Dropping frame for closed connection");
            }
        }
    }
}
