//! Decoded relay frames.
//!
//! [`PacketView`] borrows from a receive buffer; [`Packet`] owns its payload
//! and can be handed to another task. [`FrameReader`] is the receive buffer
//! both the server and participants read sockets into.

use bytes::{Buf, Bytes, BytesMut};

use crate::codec::{decode_payload, try_decode_tcp_frames};
use crate::error::ProtoError;
use crate::header::Header;
use crate::limits::TCP_RX_BUFFER_SIZE;
use crate::messages::Message;
use crate::msg_id::MsgId;

#[derive(Debug, Clone, Copy)]
pub struct PacketView<'a> {
    pub header: Header,
    pub payload: &'a [u8],
}

impl<'a> PacketView<'a> {
    pub fn msg_id(&self) -> MsgId {
        self.header.msg_id
    }

    /// Decode as `M`; fails if the frame carries another message.
    pub fn decode<M: Message>(&self) -> Result<M, ProtoError> {
        decode_payload(self.header.msg_id, self.payload)
    }

    pub fn to_packet(&self) -> Packet {
        Packet {
            header: self.header,
            payload: Bytes::copy_from_slice(self.payload),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Packet {
    pub header: Header,
    pub payload: Bytes,
}

impl Packet {
    pub fn msg_id(&self) -> MsgId {
        self.header.msg_id
    }

    pub fn decode<M: Message>(&self) -> Result<M, ProtoError> {
        decode_payload(self.header.msg_id, &self.payload)
    }
}

impl From<PacketView<'_>> for Packet {
    fn from(view: PacketView<'_>) -> Self {
        view.to_packet()
    }
}

/// Socket receive buffer that hands out whole frames and keeps a trailing
/// partial frame for the next read.
#[derive(Debug)]
pub struct FrameReader {
    buf: BytesMut,
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReader {
    const READ_CHUNK: usize = 4096;

    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(8 * 1024),
        }
    }

    /// Buffer to read into, with room for at least one more chunk.
    pub fn read_buf(&mut self) -> &mut BytesMut {
        self.buf.reserve(Self::READ_CHUNK);
        &mut self.buf
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// A peer that keeps more than one maximum frame unconsumed is not
    /// speaking the protocol.
    pub fn is_overfull(&self) -> bool {
        self.buf.len() > TCP_RX_BUFFER_SIZE
    }

    /// Every complete frame received so far.
    pub fn drain(&mut self) -> Result<Vec<Packet>, ProtoError> {
        let (views, consumed) = try_decode_tcp_frames(&self.buf)?;
        let packets = views.iter().map(PacketView::to_packet).collect();
        self.buf.advance(consumed);
        Ok(packets)
    }
}
