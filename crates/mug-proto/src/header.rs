use crate::{
    constants::{HEADER_LEN, MAGIC, VERSION},
    error::ProtoError,
    msg_id::MsgId,
};

/// Relay frame header.
///
/// ```text
/// 0      2         3        4               8
/// +------+---------+--------+---------------+---------
/// | "MG" | version | msg id | payload len   | payload
/// +------+---------+--------+---------------+---------
/// ```
///
/// The payload length is a little-endian `u32` and must match the frame
/// exactly; trailing bytes are an error, not padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub msg_id: MsgId,
    pub payload_len: u32,
}

impl Header {
    pub fn new(msg_id: MsgId, payload_len: u32) -> Self {
        Self {
            version: VERSION,
            msg_id,
            payload_len,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..2].copy_from_slice(&MAGIC);
        out[2] = self.version;
        out[3] = self.msg_id as u8;
        out[4..].copy_from_slice(&self.payload_len.to_le_bytes());
        out
    }

    /// Split a complete frame (without its length prefix) into header and
    /// payload.
    pub fn split(frame: &[u8]) -> Result<(Self, &[u8]), ProtoError> {
        let Some((head, payload)) = frame.split_first_chunk::<HEADER_LEN>() else {
            return Err(ProtoError::Truncated {
                needed: HEADER_LEN,
                got: frame.len(),
            });
        };
        let magic = [head[0], head[1]];
        if magic != MAGIC {
            return Err(ProtoError::BadMagic(magic));
        }
        if head[2] != VERSION {
            return Err(ProtoError::UnsupportedVersion(head[2]));
        }
        let msg_id = MsgId::from_repr(head[3]).ok_or(ProtoError::UnknownMsgId(head[3]))?;
        let payload_len = u32::from_le_bytes([head[4], head[5], head[6], head[7]]);
        if payload.len() != payload_len as usize {
            return Err(ProtoError::LengthMismatch {
                declared: payload_len as usize,
                actual: payload.len(),
            });
        }
        Ok((
            Self {
                version: head[2],
                msg_id,
                payload_len,
            },
            payload,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(h: Header, payload: &[u8]) -> Vec<u8> {
        let mut out = h.to_bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn splits_header_from_payload() {
        let h = Header::new(MsgId::Pause, 3);
        let bytes = frame(h, &[7, 8, 9]);
        let (decoded, payload) = Header::split(&bytes).unwrap();
        assert_eq!(decoded, h);
        assert_eq!(payload, &[7, 8, 9]);
    }

    #[test]
    fn foreign_bytes_are_rejected() {
        let mut bytes = frame(Header::new(MsgId::Ping, 0), &[]);
        bytes[1] = b'X';
        assert!(matches!(
            Header::split(&bytes),
            Err(ProtoError::BadMagic([b'M', b'X']))
        ));

        let mut bytes = frame(Header::new(MsgId::Ping, 0), &[]);
        bytes[3] = 0xEE;
        assert!(matches!(
            Header::split(&bytes),
            Err(ProtoError::UnknownMsgId(0xEE))
        ));

        assert!(matches!(
            Header::split(&bytes[..5]),
            Err(ProtoError::Truncated { needed: 8, got: 5 })
        ));
    }

    #[test]
    fn newer_version_is_refused() {
        let mut h = Header::new(MsgId::Hello, 0);
        h.version = VERSION + 1;
        assert!(matches!(
            Header::split(&frame(h, &[])),
            Err(ProtoError::UnsupportedVersion(v)) if v == VERSION + 1
        ));
    }

    #[test]
    fn declared_length_must_match() {
        let bytes = frame(Header::new(MsgId::Ping, 10), &[1, 2]);
        assert!(matches!(
            Header::split(&bytes),
            Err(ProtoError::LengthMismatch {
                declared: 10,
                actual: 2
            })
        ));
    }
}
