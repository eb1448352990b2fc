//! Frame codec: byte streams to protocol messages and back
//!
//! Every message travels in a 24-byte frame:
//!
//! ```text
//! magic (u32 LE) | command ([u8; 12], zero-padded ASCII) |
//! payload length (u32 LE) | checksum (first 4 bytes of double SHA3-256)
//! ```
//!
//! Decoding is a two-state machine (header, then body) over a growable
//! buffer, so partial reads never lose framing. Fatal defects (wrong magic,
//! oversized payload, checksum mismatch) error out and cost the peer its
//! connection; a malformed or unrecognized payload inside a well-formed
//! frame is logged and dropped.

use super::message::Message;
use super::types::{COMMAND_SIZE, FRAME_HEADER_SIZE, MAX_PROTOCOL_MESSAGE_LENGTH};
use crate::types::double_sha3;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::{BufMut, BytesMut};
use std::io::{self, Cursor, Read, Write};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

/// Wire-level decode failures.
#[derive(Debug, Error)]
pub enum WireError {
    /// Frame magic does not match this network. Fatal.
    #[error("bad network magic")]
    BadMagic,
    /// Declared or actual payload exceeds the protocol limit. Fatal.
    #[error("oversized payload")]
    OversizedPayload,
    /// Frame checksum does not match the payload. Fatal.
    #[error("checksum mismatch")]
    ChecksumMismatch,
    /// Payload ended before its declared contents. Dropped.
    #[error("truncated payload")]
    TruncatedPayload,
    /// A field failed to parse (bad UTF-8, malformed command). Dropped.
    #[error("unknown or malformed field")]
    UnknownField,
    /// Underlying transport failure.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl WireError {
    /// Whether this defect forces a disconnect.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WireError::BadMagic
                | WireError::OversizedPayload
                | WireError::ChecksumMismatch
                | WireError::Io(_)
        )
    }
}

/// What the decoder yields per well-formed frame.
#[derive(Debug)]
pub enum FrameEvent {
    Message(Message),
    /// Frame was intact but its contents are not usable: unrecognized
    /// command or a non-fatal payload defect. No penalty.
    Ignored { command: String },
}

// =============================================================================
// VARINT
// =============================================================================

/// Write a Bitcoin-style variable-length integer (1/3/5/9 bytes).
pub fn write_varint<W: Write>(writer: &mut W, value: u64) -> io::Result<()> {
    if value < 0xFD {
        writer.write_u8(value as u8)
    } else if value <= u16::MAX as u64 {
        writer.write_u8(0xFD)?;
        writer.write_u16::<LittleEndian>(value as u16)
    } else if value <= u32::MAX as u64 {
        writer.write_u8(0xFE)?;
        writer.write_u32::<LittleEndian>(value as u32)
    } else {
        writer.write_u8(0xFF)?;
        writer.write_u64::<LittleEndian>(value)
    }
}

/// Read a Bitcoin-style variable-length integer.
pub fn read_varint<R: Read>(reader: &mut R) -> Result<u64, WireError> {
    let prefix = reader.read_u8()?;
    let value = match prefix {
        0xFD => reader.read_u16::<LittleEndian>()? as u64,
        0xFE => reader.read_u32::<LittleEndian>()? as u64,
        0xFF => reader.read_u64::<LittleEndian>()?,
        direct => direct as u64,
    };
    Ok(value)
}

// =============================================================================
// CODEC
// =============================================================================

/// Frame checksum: first four bytes of double SHA3-256 over the payload.
pub fn checksum(payload: &[u8]) -> [u8; 4] {
    let digest = double_sha3(payload);
    [digest[0], digest[1], digest[2], digest[3]]
}

enum DecodeState {
    Head,
    Body {
        body_len: usize,
        command: [u8; COMMAND_SIZE],
        checksum: [u8; 4],
    },
}

/// Tokio codec carrying [`Message`] frames for one network magic.
pub struct Codec {
    magic: u32,
    state: DecodeState,
}

impl Codec {
    pub fn new(magic: u32) -> Self {
        Self {
            magic,
            state: DecodeState::Head,
        }
    }
}

impl Encoder<Message> for Codec {
    type Error = WireError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut body = Vec::new();
        item.write_body(&mut body)?;
        if body.len() > MAX_PROTOCOL_MESSAGE_LENGTH {
            return Err(WireError::OversizedPayload);
        }

        let mut command = [0u8; COMMAND_SIZE];
        let name = item.command().as_bytes();
        command[..name.len()].copy_from_slice(name);

        dst.reserve(FRAME_HEADER_SIZE + body.len());
        dst.put_u32_le(self.magic);
        dst.put_slice(&command);
        dst.put_u32_le(body.len() as u32);
        dst.put_slice(&checksum(&body));
        dst.put_slice(&body);
        Ok(())
    }
}

impl Decoder for Codec {
    type Item = FrameEvent;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.state {
            DecodeState::Head => {
                if src.len() < FRAME_HEADER_SIZE {
                    return Ok(None);
                }
                let header = src.split_to(FRAME_HEADER_SIZE);
                let mut reader = Cursor::new(&header[..]);
                let magic = reader.read_u32::<LittleEndian>()?;
                let mut command = [0u8; COMMAND_SIZE];
                reader.read_exact(&mut command)?;
                let body_len = reader.read_u32::<LittleEndian>()? as usize;
                let mut check = [0u8; 4];
                reader.read_exact(&mut check)?;

                if magic != self.magic {
                    return Err(WireError::BadMagic);
                }
                if body_len > MAX_PROTOCOL_MESSAGE_LENGTH {
                    return Err(WireError::OversizedPayload);
                }

                src.reserve(body_len.saturating_add(FRAME_HEADER_SIZE));
                self.state = DecodeState::Body {
                    body_len,
                    command,
                    checksum: check,
                };
                // Loopback delivery may hand us header and body together.
                self.decode(src)
            }
            DecodeState::Body {
                body_len,
                command,
                checksum: expected,
            } => {
                if src.len() < body_len {
                    return Ok(None);
                }
                let body = src.split_to(body_len);
                self.state = DecodeState::Head;

                if checksum(&body) != expected {
                    return Err(WireError::ChecksumMismatch);
                }

                let Some(name) = command_name(&command) else {
                    debug!("dropping frame with malformed command field");
                    return Ok(Some(FrameEvent::Ignored {
                        command: String::from("<malformed>"),
                    }));
                };

                let mut reader = Cursor::new(&body[..]);
                // A body that ends mid-field is a truncation of this frame
                // only, not a transport failure.
                let parsed = Message::read_body(&name, body_len, &mut reader).map_err(|err| {
                    match err {
                        WireError::Io(io_err)
                            if io_err.kind() == io::ErrorKind::UnexpectedEof =>
                        {
                            WireError::TruncatedPayload
                        }
                        other => other,
                    }
                });
                match parsed {
                    Ok(Some(msg)) => Ok(Some(FrameEvent::Message(msg))),
                    Ok(None) => {
                        debug!("ignoring unknown command {:?}", name);
                        Ok(Some(FrameEvent::Ignored { command: name }))
                    }
                    Err(err) if err.is_fatal() => Err(err),
                    Err(err) => {
                        debug!("dropping {:?} payload: {}", name, err);
                        Ok(Some(FrameEvent::Ignored { command: name }))
                    }
                }
            }
        }
    }
}

/// Extract the command string: ASCII up to the first NUL, remainder all NUL.
fn command_name(raw: &[u8; COMMAND_SIZE]) -> Option<String> {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(COMMAND_SIZE);
    if end == 0 || !raw[end..].iter().all(|&b| b == 0) {
        return None;
    }
    let name = &raw[..end];
    if !name.iter().all(u8::is_ascii_graphic) {
        return None;
    }
    Some(String::from_utf8_lossy(name).into_owned())
}

/// Serialize one message as a complete frame. Test and handshake helper.
pub fn encode_frame(magic: u32, msg: &Message) -> Vec<u8> {
    let mut codec = Codec::new(magic);
    let mut buf = BytesMut::new();
    codec
        .encode(msg.clone(), &mut buf)
        .expect("in-memory encode cannot fail");
    buf.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MAGIC: u32 = 0x50414C49;

    fn decode_all(codec: &mut Codec, bytes: &[u8]) -> Vec<FrameEvent> {
        let mut buf = BytesMut::from(bytes);
        let mut events = Vec::new();
        while let Some(event) = codec.decode(&mut buf).unwrap() {
            events.push(event);
        }
        events
    }

    #[test]
    fn frame_roundtrip() {
        let frame = encode_frame(MAGIC, &Message::Ping(99));
        let mut codec = Codec::new(MAGIC);
        let events = decode_all(&mut codec, &frame);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], FrameEvent::Message(Message::Ping(99))));
    }

    #[test]
    fn decode_survives_partial_delivery() {
        let frame = encode_frame(MAGIC, &Message::Ping(7));
        let mut codec = Codec::new(MAGIC);
        let mut buf = BytesMut::new();

        for &byte in &frame[..frame.len() - 1] {
            buf.put_u8(byte);
            assert!(codec.decode(&mut buf).unwrap().is_none());
        }
        buf.put_u8(frame[frame.len() - 1]);
        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(FrameEvent::Message(Message::Ping(7)))
        ));
    }

    #[test]
    fn two_frames_in_one_buffer() {
        let mut bytes = encode_frame(MAGIC, &Message::Ping(1));
        bytes.extend(encode_frame(MAGIC, &Message::Pong(2)));
        let mut codec = Codec::new(MAGIC);
        let events = decode_all(&mut codec, &bytes);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn wrong_magic_is_fatal() {
        let frame = encode_frame(0x11111111, &Message::Ping(1));
        let mut codec = Codec::new(MAGIC);
        let mut buf = BytesMut::from(&frame[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, WireError::BadMagic));
        assert!(err.is_fatal());
    }

    #[test]
    fn corrupted_payload_fails_checksum() {
        let mut frame = encode_frame(MAGIC, &Message::Ping(1));
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        let mut codec = Codec::new(MAGIC);
        let mut buf = BytesMut::from(&frame[..]);
        assert!(matches!(
            codec.decode(&mut buf).unwrap_err(),
            WireError::ChecksumMismatch
        ));
    }

    #[test]
    fn declared_length_over_limit_is_fatal() {
        let mut frame = Vec::new();
        frame.extend(&MAGIC.to_le_bytes());
        frame.extend(b"ping\0\0\0\0\0\0\0\0");
        frame.extend(&((MAX_PROTOCOL_MESSAGE_LENGTH as u32) + 1).to_le_bytes());
        frame.extend(&[0u8; 4]);
        let mut codec = Codec::new(MAGIC);
        let mut buf = BytesMut::from(&frame[..]);
        assert!(matches!(
            codec.decode(&mut buf).unwrap_err(),
            WireError::OversizedPayload
        ));
    }

    #[test]
    fn unknown_command_is_ignored_not_fatal() {
        let payload = b"";
        let mut frame = Vec::new();
        frame.extend(&MAGIC.to_le_bytes());
        frame.extend(b"sendcmpct\0\0\0");
        frame.extend(&(payload.len() as u32).to_le_bytes());
        frame.extend(&checksum(payload));
        let mut codec = Codec::new(MAGIC);
        let events = decode_all(&mut codec, &frame);
        assert!(matches!(&events[0], FrameEvent::Ignored { command } if command == "sendcmpct"));
    }

    #[test]
    fn decoding_continues_after_ignored_frame() {
        let payload = b"";
        let mut bytes = Vec::new();
        bytes.extend(&MAGIC.to_le_bytes());
        bytes.extend(b"feefilter\0\0\0");
        bytes.extend(&(payload.len() as u32).to_le_bytes());
        bytes.extend(&checksum(payload));
        bytes.extend(encode_frame(MAGIC, &Message::Ping(5)));

        let mut codec = Codec::new(MAGIC);
        let events = decode_all(&mut codec, &bytes);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], FrameEvent::Message(Message::Ping(5))));
    }

    #[test]
    fn varint_boundary_encodings() {
        let cases: &[(u64, usize)] = &[
            (0, 1),
            (0xFC, 1),
            (0xFD, 3),
            (0xFFFF, 3),
            (0x1_0000, 5),
            (0xFFFF_FFFF, 5),
            (0x1_0000_0000, 9),
            (u64::MAX, 9),
        ];
        for &(value, expected_len) in cases {
            let mut buf = Vec::new();
            write_varint(&mut buf, value).unwrap();
            assert_eq!(buf.len(), expected_len, "varint({value})");
            assert_eq!(read_varint(&mut &buf[..]).unwrap(), value);
        }
    }

    proptest! {
        #[test]
        fn varint_roundtrip_is_identity(value: u64) {
            let mut buf = Vec::new();
            write_varint(&mut buf, value).unwrap();
            prop_assert_eq!(read_varint(&mut &buf[..]).unwrap(), value);
        }

        #[test]
        fn ping_frame_roundtrip_any_nonce(nonce: u64) {
            let frame = encode_frame(MAGIC, &Message::Ping(nonce));
            let mut codec = Codec::new(MAGIC);
            let mut buf = BytesMut::from(&frame[..]);
            let event = codec.decode(&mut buf).unwrap().unwrap();
            prop_assert!(matches!(event, FrameEvent::Message(Message::Ping(n)) if n == nonce));
        }
    }
}
