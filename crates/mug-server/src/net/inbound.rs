use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use mug_proto::packet::Packet;
use tokio_util::sync::CancellationToken;

use super::outbound::OutboundTx;

/// Server-assigned connection id, unique for the process lifetime.
pub type ConnId = u64;

pub fn next_conn_id() -> ConnId {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Wire carrying the relay frames of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Length-prefixed frames straight on the socket.
    Tcp,
    /// The same frames inside binary WebSocket messages (browser participants).
    WebSocket,
}

/// What connection tasks report to the server loop. Per connection the
/// order is always `Connected`, any number of `Packet`s, then exactly one
/// `Disconnected`.
#[derive(Debug)]
pub enum InboundEvent {
    Connected {
        conn_id: ConnId,
        peer: SocketAddr,
        transport: TransportKind,
        outbound: OutboundTx,
        /// Cancel to drop the connection from the server side.
        cancel_token: CancellationToken,
    },
    Packet {
        conn_id: ConnId,
        peer: SocketAddr,
        packet: Packet,
    },
    Disconnected {
        conn_id: ConnId,
        peer: SocketAddr,
        reason: String,
    },
}
