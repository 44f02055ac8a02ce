//! Frame encoding and decoding for the relay subprotocol
//!
//! Every frame travels as exactly one binary transport message:
//!
//! ```text
//! Success: tag(2) | length(4) | session id
//! Data:    tag(2) | length(4) | payload
//! Ack:     tag(2) | received(8)
//! ```
//!
//! All integers are big-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

pub const TAG_SUCCESS: u16 = 0x1;
pub const TAG_DATA: u16 = 0x4;
pub const TAG_ACK: u16 = 0x7;

const TAG_LEN: usize = 2;
const LENGTH_LEN: usize = 4;
const ACK_LEN: usize = 8;

/// A decoded relay frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Handshake completion, carrying the relay-assigned session id
    Success { session_id: Bytes },
    /// Application bytes
    Data { payload: Bytes },
    /// Cumulative count of bytes the remote side has received
    Ack { received: u64 },
    /// Any tag this client does not know; ignored by the engine
    Unknown { tag: u16 },
}

impl Frame {
    /// A Success frame; like [`Frame::data`], the body must fit 32 bits
    pub fn success(session_id: impl Into<Bytes>) -> Self {
        Self::Success {
            session_id: session_id.into(),
        }
    }

    /// A Data frame; `payload` must fit the 32-bit length field
    pub fn data(payload: impl Into<Bytes>) -> Self {
        Self::Data {
            payload: payload.into(),
        }
    }

    pub fn ack(received: u64) -> Self {
        Self::Ack { received }
    }

    pub fn tag(&self) -> u16 {
        match self {
            Frame::Success { .. } => TAG_SUCCESS,
            Frame::Data { .. } => TAG_DATA,
            Frame::Ack { .. } => TAG_ACK,
            Frame::Unknown { tag } => *tag,
        }
    }

    /// Encode frame to a single message body
    ///
    /// Success and Data bodies must be at most `u32::MAX` bytes. Callers keep
    /// them within the maximum frame size, which is far below that.
    pub fn encode(&self) -> Bytes {
        match self {
            Frame::Success { session_id: body } | Frame::Data { payload: body } => {
                debug_assert!(
                    body.len() <= u32::MAX as usize,
                    "frame body of {} bytes overflows the length field",
                    body.len()
                );
                let mut buf = BytesMut::with_capacity(TAG_LEN + LENGTH_LEN + body.len());
                buf.put_u16(self.tag());
                buf.put_u32(body.len() as u32);
                buf.put(body.clone());
                buf.freeze()
            }
            Frame::Ack { received } => {
                let mut buf = BytesMut::with_capacity(TAG_LEN + ACK_LEN);
                buf.put_u16(TAG_ACK);
                buf.put_u64(*received);
                buf.freeze()
            }
            Frame::Unknown { tag } => Bytes::copy_from_slice(&tag.to_be_bytes()),
        }
    }

    /// Decode frame from one message body
    ///
    /// The length field of Success and Data frames is checked against
    /// `max_payload` before any payload byte is looked at. Bytes following a
    /// complete frame are ignored.
    pub fn decode(mut buf: Bytes, max_payload: usize) -> Result<Self, ProtocolError> {
        if buf.remaining() < TAG_LEN {
            return Err(ProtocolError::MissingTag);
        }

        let tag = buf.get_u16();
        match tag {
            TAG_SUCCESS => Ok(Frame::Success {
                session_id: read_sized(&mut buf, max_payload)?,
            }),
            TAG_DATA => Ok(Frame::Data {
                payload: read_sized(&mut buf, max_payload)?,
            }),
            TAG_ACK => {
                ensure_remaining(&buf, ACK_LEN)?;
                Ok(Frame::Ack {
                    received: buf.get_u64(),
                })
            }
            _ => Ok(Frame::Unknown { tag }),
        }
    }
}

fn ensure_remaining(buf: &Bytes, expected: usize) -> Result<(), ProtocolError> {
    if buf.remaining() < expected {
        return Err(ProtocolError::Truncated {
            expected,
            actual: buf.remaining(),
        });
    }
    Ok(())
}

fn read_sized(buf: &mut Bytes, max_payload: usize) -> Result<Bytes, ProtocolError> {
    ensure_remaining(buf, LENGTH_LEN)?;
    let len = buf.get_u32() as usize;
    if len > max_payload {
        return Err(ProtocolError::FrameTooLarge {
            len,
            max: max_payload,
        });
    }

    ensure_remaining(buf, len)?;
    Ok(buf.split_to(len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MAX_FRAME_SIZE;

    #[test]
    fn test_data_frame_wire_layout() {
        let encoded = Frame::data(Bytes::from_static(b"hello")).encode();
        assert_eq!(
            &encoded[..],
            &[0x00, 0x04, 0x00, 0x00, 0x00, 0x05, b'h', b'e', b'l', b'l', b'o']
        );
    }

    #[test]
    fn test_max_size_data_frame_length_field() {
        let encoded = Frame::data(vec![0u8; MAX_FRAME_SIZE]).encode();

        assert_eq!(encoded.len(), 2 + 4 + MAX_FRAME_SIZE);
        assert_eq!(&encoded[2..6], &(MAX_FRAME_SIZE as u32).to_be_bytes());
        assert!(matches!(
            Frame::decode(encoded, MAX_FRAME_SIZE),
            Ok(Frame::Data { payload }) if payload.len() == MAX_FRAME_SIZE
        ));
    }

    #[test]
    fn test_ack_frame_wire_layout() {
        let encoded = Frame::ack(0x0102_0304_0506_0708).encode();
        assert_eq!(
            &encoded[..],
            &[0x00, 0x07, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]
        );
    }

    #[test]
    fn test_data_frame_reencodes_identically() {
        for len in [0usize, 1, 1000, MAX_FRAME_SIZE] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let wire = Frame::data(payload).encode();

            let decoded = Frame::decode(wire.clone(), MAX_FRAME_SIZE).unwrap();
            assert_eq!(decoded.encode(), wire);
        }
    }

    #[test]
    fn test_success_frame_decode() {
        let wire = Frame::success(Bytes::from_static(b"abc")).encode();
        let decoded = Frame::decode(wire, MAX_FRAME_SIZE).unwrap();
        assert_eq!(decoded, Frame::success(Bytes::from_static(b"abc")));
        assert_eq!(decoded.tag(), TAG_SUCCESS);
    }

    #[test]
    fn test_oversized_length_rejected_before_payload() {
        // Length field only; no payload follows. The size check must win.
        for tag in [TAG_SUCCESS, TAG_DATA] {
            let mut buf = BytesMut::new();
            buf.put_u16(tag);
            buf.put_u32(MAX_FRAME_SIZE as u32 + 1);

            let err = Frame::decode(buf.freeze(), MAX_FRAME_SIZE).unwrap_err();
            assert_eq!(
                err,
                ProtocolError::FrameTooLarge {
                    len: MAX_FRAME_SIZE + 1,
                    max: MAX_FRAME_SIZE,
                }
            );
        }
    }

    #[test]
    fn test_truncated_payload() {
        let mut buf = BytesMut::new();
        buf.put_u16(TAG_DATA);
        buf.put_u32(10);
        buf.put_slice(b"short");

        let err = Frame::decode(buf.freeze(), MAX_FRAME_SIZE).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::Truncated {
                expected: 10,
                actual: 5
            }
        );
    }

    #[test]
    fn test_truncated_ack() {
        let err = Frame::decode(Bytes::from_static(&[0x00, 0x07, 0x01]), MAX_FRAME_SIZE)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated { expected: 8, .. }));
    }

    #[test]
    fn test_unknown_tag_consumes_nothing() {
        let wire = Bytes::from_static(&[0x00, 0x09, 0xde, 0xad, 0xbe, 0xef]);
        let decoded = Frame::decode(wire, MAX_FRAME_SIZE).unwrap();
        assert_eq!(decoded, Frame::Unknown { tag: 0x9 });
    }

    #[test]
    fn test_empty_message() {
        assert_eq!(
            Frame::decode(Bytes::new(), MAX_FRAME_SIZE).unwrap_err(),
            ProtocolError::MissingTag
        );
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let mut buf = BytesMut::from(&Frame::data(Bytes::from_static(b"hi")).encode()[..]);
        buf.put_slice(b"garbage");

        let decoded = Frame::decode(buf.freeze(), MAX_FRAME_SIZE).unwrap();
        assert_eq!(decoded, Frame::data(Bytes::from_static(b"hi")));
    }
}
