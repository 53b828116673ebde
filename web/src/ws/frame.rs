//! Frame level parse/serialize for the server side of rfc 6455.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::ProtocolError;
use super::proto::{CloseReason, OpCode};

/// Try to parse one complete frame out of `buf`.
///
/// Returns `None` while the buffer does not hold a full frame yet; the
/// caller reads more and retries. Client frames must be masked and the mask
/// is removed here, so payloads come out in the clear.
pub(crate) fn parse(
    buf: &mut BytesMut,
    max_size: usize,
) -> Result<Option<(bool, OpCode, Bytes)>, ProtocolError> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let first = buf[0];
    let second = buf[1];

    let fin = first & 0b1000_0000 != 0;
    if first & 0b0111_0000 != 0 {
        return Err(ProtocolError::ReservedBits);
    }

    let opcode = OpCode::from(first & 0b0000_1111);
    if opcode == OpCode::Bad {
        return Err(ProtocolError::InvalidOpcode(first & 0b0000_1111));
    }

    let masked = second & 0b1000_0000 != 0;
    if !masked {
        return Err(ProtocolError::UnmaskedFrame);
    }

    let len7 = (second & 0b0111_1111) as usize;

    if opcode.is_control() {
        if !fin {
            return Err(ProtocolError::FragmentedControlFrame);
        }
        if len7 > 125 {
            return Err(ProtocolError::ControlFrameTooLong(len7));
        }
    }

    let (header_len, payload_len) = match len7 {
        126 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            (4, u16::from_be_bytes([buf[2], buf[3]]) as usize)
        }
        127 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            let mut len = [0u8; 8];
            len.copy_from_slice(&buf[2..10]);
            let len = u64::from_be_bytes(len);
            if len > usize::MAX as u64 {
                return Err(ProtocolError::Overflow);
            }
            (10, len as usize)
        }
        len => (2, len),
    };

    if payload_len > max_size {
        return Err(ProtocolError::Overflow);
    }

    let total = header_len + 4 + payload_len;
    if buf.len() < total {
        return Ok(None);
    }

    buf.advance(header_len);
    let mut mask = [0u8; 4];
    mask.copy_from_slice(&buf[..4]);
    buf.advance(4);

    let mut payload = buf.split_to(payload_len);
    unmask(&mut payload, mask);

    Ok(Some((fin, opcode, payload.freeze())))
}

fn unmask(payload: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

/// Serialize a server frame. Server frames are never masked.
pub(crate) fn write(buf: &mut BytesMut, opcode: OpCode, payload: &[u8], fin: bool) {
    let first = if fin {
        0b1000_0000 | u8::from(opcode)
    } else {
        u8::from(opcode)
    };
    buf.put_u8(first);

    let len = payload.len();
    if len < 126 {
        buf.put_u8(len as u8);
    } else if len <= u16::MAX as usize {
        buf.put_u8(126);
        buf.put_u16(len as u16);
    } else {
        buf.put_u8(127);
        buf.put_u64(len as u64);
    }

    buf.extend_from_slice(payload);
}

/// Serialize a close frame: 2 byte code plus utf-8 reason.
pub(crate) fn write_close(buf: &mut BytesMut, reason: Option<&CloseReason>) {
    match reason {
        None => write(buf, OpCode::Close, &[], true),
        Some(reason) => {
            let code: u16 = reason.code.into();
            let mut payload = Vec::with_capacity(2 + reason.description.as_ref().map_or(0, String::len));
            payload.extend_from_slice(&code.to_be_bytes());
            if let Some(ref description) = reason.description {
                payload.extend_from_slice(description.as_bytes());
            }
            write(buf, OpCode::Close, &payload, true);
        }
    }
}

/// Decode a received close payload.
pub(crate) fn parse_close_payload(payload: &[u8]) -> Result<Option<CloseReason>, ProtocolError> {
    match payload.len() {
        0 => Ok(None),
        1 => Err(ProtocolError::BadClosePayload),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]).into();
            let description = if payload.len() > 2 {
                let text = std::str::from_utf8(&payload[2..]).map_err(|_| ProtocolError::BadClosePayload)?;
                Some(text.to_owned())
            } else {
                None
            };
            Ok(Some(CloseReason { code, description }))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ws::proto::CloseCode;

    /// Build a masked client frame for the parser.
    fn client_frame(opcode: OpCode, payload: &[u8], fin: bool) -> BytesMut {
        let mut buf = BytesMut::new();
        let first = if fin { 0b1000_0000 | u8::from(opcode) } else { u8::from(opcode) };
        buf.put_u8(first);

        let mask = [0x11u8, 0x22, 0x33, 0x44];
        let len = payload.len();
        if len < 126 {
            buf.put_u8(0b1000_0000 | len as u8);
        } else if len <= u16::MAX as usize {
            buf.put_u8(0b1000_0000 | 126);
            buf.put_u16(len as u16);
        } else {
            buf.put_u8(0b1000_0000 | 127);
            buf.put_u64(len as u64);
        }
        buf.extend_from_slice(&mask);
        let start = buf.len();
        buf.extend_from_slice(payload);
        for (i, byte) in buf[start..].iter_mut().enumerate() {
            *byte ^= mask[i & 3];
        }
        buf
    }

    #[test]
    fn parse_unmasks_payload() {
        let mut buf = client_frame(OpCode::Text, b"hello", true);
        let (fin, opcode, payload) = parse(&mut buf, 65_536).unwrap().unwrap();
        assert!(fin);
        assert_eq!(opcode, OpCode::Text);
        assert_eq!(&payload[..], b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn parse_extended_lengths() {
        let payload = vec![b'x'; 300];
        let mut buf = client_frame(OpCode::Binary, &payload, true);
        // 16 bit extended length on the wire.
        assert_eq!(buf[1] & 0b0111_1111, 126);
        let (_, _, parsed) = parse(&mut buf, 65_536).unwrap().unwrap();
        assert_eq!(parsed.len(), 300);

        let payload = vec![b'y'; 70_000];
        let mut buf = client_frame(OpCode::Binary, &payload, true);
        assert_eq!(buf[1] & 0b0111_1111, 127);
        let (_, _, parsed) = parse(&mut buf, 100_000).unwrap().unwrap();
        assert_eq!(parsed.len(), 70_000);
    }

    #[test]
    fn parse_incomplete_returns_none() {
        let full = client_frame(OpCode::Text, b"hello", true);
        for cut in 0..full.len() {
            let mut partial = BytesMut::from(&full[..cut]);
            assert!(parse(&mut partial, 65_536).unwrap().is_none(), "cut at {cut}");
        }
    }

    #[test]
    fn parse_rejects_violations() {
        // unmasked client frame.
        let mut buf = BytesMut::from(&[0b1000_0001u8, 0b0000_0001, b'x'][..]);
        assert!(matches!(parse(&mut buf, 65_536), Err(ProtocolError::UnmaskedFrame)));

        // reserved bits.
        let mut buf = client_frame(OpCode::Text, b"x", true);
        buf[0] |= 0b0100_0000;
        assert!(matches!(parse(&mut buf, 65_536), Err(ProtocolError::ReservedBits)));

        // bad opcode.
        let mut buf = client_frame(OpCode::Text, b"x", true);
        buf[0] = (buf[0] & 0b1111_0000) | 0x3;
        assert!(matches!(parse(&mut buf, 65_536), Err(ProtocolError::InvalidOpcode(3))));

        // fragmented control frame.
        let mut buf = client_frame(OpCode::Ping, b"x", false);
        assert!(matches!(parse(&mut buf, 65_536), Err(ProtocolError::FragmentedControlFrame)));

        // oversized control payload.
        let mut buf = client_frame(OpCode::Ping, &[b'x'; 126], true);
        assert!(matches!(parse(&mut buf, 65_536), Err(ProtocolError::ControlFrameTooLong(126))));

        // payload over limit.
        let mut buf = client_frame(OpCode::Binary, &[b'x'; 2048], true);
        assert!(matches!(parse(&mut buf, 1024), Err(ProtocolError::Overflow)));
    }

    #[test]
    fn server_frames_unmasked() {
        let mut buf = BytesMut::new();
        write(&mut buf, OpCode::Text, b"hey", true);
        assert_eq!(&buf[..], &[0b1000_0001, 0b0000_0011, b'h', b'e', b'y']);
    }

    #[test]
    fn close_payload_round_trip() {
        let mut buf = BytesMut::new();
        write_close(&mut buf, Some(&(CloseCode::Normal, "done").into()));

        // strip fin/opcode + length.
        let payload = &buf[2..];
        let reason = parse_close_payload(payload).unwrap().unwrap();
        assert_eq!(reason.code, CloseCode::Normal);
        assert_eq!(reason.description.as_deref(), Some("done"));

        assert!(parse_close_payload(&[]).unwrap().is_none());
        assert!(parse_close_payload(&[0x03]).is_err());
        assert!(parse_close_payload(&[0x03, 0xe8, 0xff, 0xfe]).is_err());
    }
}
