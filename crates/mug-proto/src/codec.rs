//! Relay framing and data channel encoding.

use crate::{
    constants::{HEADER_LEN, TCP_LEN_PREFIX},
    error::ProtoError,
    header::Header,
    limits::{MAX_PEER_MESSAGE, MAX_TCP_FRAME, max_payload_for},
    messages::{Message, peer::PeerMessage},
    msg_id::MsgId,
    packet::PacketView,
};

/// Encode `msg` as a length-prefixed relay frame.
///
/// ```ignore
/// let frame = encode_message(&Ping { nonce: 1, client_ms: 0 })?;
/// socket.write_all(&frame).await?;
/// ```
pub fn encode_message<T: Message>(msg: &T) -> Result<Vec<u8>, ProtoError> {
    let msg_id = T::msg_id();
    let payload = postcard::to_stdvec(msg)?;
    if payload.len() > max_payload_for(msg_id) {
        return Err(ProtoError::PayloadTooLarge(payload.len()));
    }
    let frame_len = HEADER_LEN + payload.len();
    if frame_len > MAX_TCP_FRAME {
        return Err(ProtoError::FrameTooLarge(frame_len));
    }

    let mut out = Vec::with_capacity(TCP_LEN_PREFIX + frame_len);
    out.extend_from_slice(&(frame_len as u32).to_le_bytes());
    out.extend_from_slice(&Header::new(msg_id, payload.len() as u32).to_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Decode every complete frame at the front of `buf`.
///
/// Returns the frames and how many bytes they used; an incomplete trailing
/// frame is not consumed. A length prefix beyond [`MAX_TCP_FRAME`] fails
/// immediately, before the sender can make us buffer it.
pub fn try_decode_tcp_frames(buf: &[u8]) -> Result<(Vec<PacketView<'_>>, usize), ProtoError> {
    let mut frames = Vec::new();
    let mut rest = buf;

    while let Some((prefix, after)) = rest.split_first_chunk::<TCP_LEN_PREFIX>() {
        let frame_len = u32::from_le_bytes(*prefix) as usize;
        if frame_len < HEADER_LEN {
            return Err(ProtoError::Truncated {
                needed: HEADER_LEN,
                got: frame_len,
            });
        }
        if frame_len > MAX_TCP_FRAME {
            return Err(ProtoError::FrameTooLarge(frame_len));
        }
        if after.len() < frame_len {
            break;
        }
        let (frame, next) = after.split_at(frame_len);
        let (header, payload) = Header::split(frame)?;
        if payload.len() > max_payload_for(header.msg_id) {
            return Err(ProtoError::PayloadTooLarge(payload.len()));
        }
        frames.push(PacketView { header, payload });
        rest = next;
    }

    Ok((frames, buf.len() - rest.len()))
}

/// Decode `payload` as `M`, rejecting frames that carry another message.
pub fn decode_payload<M: Message>(msg_id: MsgId, payload: &[u8]) -> Result<M, ProtoError> {
    if msg_id != M::msg_id() {
        return Err(ProtoError::UnexpectedMsgId {
            expected: M::msg_id(),
            got: msg_id,
        });
    }
    Ok(postcard::from_bytes(payload)?)
}

/// Encode a data channel message. The channel carries nothing but
/// [`PeerMessage`]s, so there is no header.
pub fn encode_peer(msg: &PeerMessage) -> Result<Vec<u8>, ProtoError> {
    let bytes = postcard::to_stdvec(msg)?;
    if bytes.len() > MAX_PEER_MESSAGE {
        return Err(ProtoError::PayloadTooLarge(bytes.len()));
    }
    Ok(bytes)
}

/// Decode and validate a data channel message.
pub fn decode_peer(datagram: &[u8]) -> Result<PeerMessage, ProtoError> {
    if datagram.len() > MAX_PEER_MESSAGE {
        return Err(ProtoError::FrameTooLarge(datagram.len()));
    }
    let msg: PeerMessage = postcard::from_bytes(datagram)?;
    msg.validate()?;
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::keepalive::Ping;
    use crate::messages::peer::{Action, FrameChecksum, InputPacket};
    use crate::messages::reconnect::Pause;

    fn ping(nonce: u32) -> Vec<u8> {
        encode_message(&Ping {
            nonce,
            client_ms: 1000 + u64::from(nonce),
        })
        .unwrap()
    }

    #[test]
    fn decodes_back_to_back_frames_and_stops_at_partial() {
        let mut buf = ping(1);
        buf.extend(ping(2));
        let third = ping(3);
        buf.extend_from_slice(&third[..third.len() - 1]);

        let (packets, consumed) = try_decode_tcp_frames(&buf).unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(consumed, buf.len() - (third.len() - 1));
        let second: Ping = packets[1].decode().unwrap();
        assert_eq!(second.nonce, 2);
    }

    #[test]
    fn decode_rejects_mismatched_type() {
        let buf = ping(9);
        let (packets, _) = try_decode_tcp_frames(&buf).unwrap();
        assert!(matches!(
            packets[0].decode::<Pause>(),
            Err(ProtoError::UnexpectedMsgId {
                expected: MsgId::Pause,
                got: MsgId::Ping
            })
        ));
    }

    #[test]
    fn full_backlog_fits_one_peer_message() {
        let packet = InputPacket {
            player_index: 1,
            episode: u32::MAX,
            base_frame: u32::MAX - 300,
            actions: vec![Action::MAX; crate::constants::MAX_INPUT_BACKLOG],
            checksum: Some(FrameChecksum {
                frame: u32::MAX,
                hash: [0xFF; 32],
            }),
            ack_frame: Some(u32::MAX),
        };
        let bytes = encode_peer(&PeerMessage::Input(packet.clone())).unwrap();
        assert_eq!(decode_peer(&bytes).unwrap(), PeerMessage::Input(packet));
    }

    #[test]
    fn oversized_length_prefix_fails_before_the_body_arrives() {
        let mut buf = ((MAX_TCP_FRAME + 1) as u32).to_le_bytes().to_vec();
        buf.extend_from_slice(&[0u8; 16]);
        assert!(matches!(
            try_decode_tcp_frames(&buf),
            Err(ProtoError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn peer_message_rejects_excess_backlog() {
        let packet = InputPacket {
            player_index: 1,
            episode: 0,
            base_frame: 0,
            actions: vec![0; crate::constants::MAX_INPUT_BACKLOG + 1],
            checksum: None,
            ack_frame: Some(3),
        };
        let bytes = postcard::to_stdvec(&PeerMessage::Input(packet)).unwrap();
        assert!(matches!(
            decode_peer(&bytes),
            Err(ProtoError::InvalidPayload(_))
        ));
    }
}
