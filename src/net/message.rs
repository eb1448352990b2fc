//! Typed protocol messages and their payload codecs
//!
//! The frame layer in [`super::wire`] owns the 24-byte header; this module
//! owns everything inside the payload. Integer fields are little-endian
//! except the port, which stays big-endian on the wire.

use super::types::{
    NetAddress, TimestampedAddress, MAX_USER_AGENT_LEN, PROTOCOL_VERSION,
};
use super::wire::{read_varint, write_varint, WireError};
use crate::chain::{BlockHeader, HEADER_SIZE};
use crate::types::Hash;
use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

/// Inventory item kinds. Unknown kinds are carried through decoding and
/// ignored by handlers without penalty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvType {
    Block,
    Unknown(u32),
}

impl InvType {
    pub fn to_wire(self) -> u32 {
        match self {
            InvType::Block => 1,
            InvType::Unknown(raw) => raw,
        }
    }

    pub fn from_wire(raw: u32) -> Self {
        match raw {
            1 => InvType::Block,
            other => InvType::Unknown(other),
        }
    }
}

/// One inventory announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InvItem {
    pub inv_type: InvType,
    pub hash: Hash,
}

impl InvItem {
    pub fn block(hash: Hash) -> Self {
        Self {
            inv_type: InvType::Block,
            hash,
        }
    }
}

/// VERSION payload exchanged during the handshake.
///
/// `nonce` is the self-connection detector: every outbound connection
/// remembers its local nonce, and a VERSION arriving with one of our own
/// outstanding nonces is us dialing ourselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionPayload {
    pub version: u32,
    pub services: u64,
    pub timestamp: i64,
    pub addr_recv: NetAddress,
    pub addr_from: NetAddress,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
}

impl VersionPayload {
    pub fn new(
        services: u64,
        addr_recv: NetAddress,
        addr_from: NetAddress,
        nonce: u64,
        start_height: i32,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            services,
            timestamp: crate::types::now() as i64,
            addr_recv,
            addr_from,
            nonce,
            user_agent: format!("/palisade:{}/", env!("CARGO_PKG_VERSION")),
            start_height,
        }
    }
}

/// GETHEADERS payload: locator plus optional stop hash (zero = none).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetHeadersPayload {
    pub version: u32,
    pub locator: Vec<Hash>,
    pub hash_stop: Hash,
}

/// A protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Version(VersionPayload),
    Verack,
    Ping(u64),
    Pong(u64),
    Addr(Vec<TimestampedAddress>),
    GetAddr,
    Inv(Vec<InvItem>),
    GetHeaders(GetHeadersPayload),
    Headers(Vec<BlockHeader>),
}

impl Message {
    pub fn command(&self) -> &'static str {
        match self {
            Message::Version(_) => "version",
            Message::Verack => "verack",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::Addr(_) => "addr",
            Message::GetAddr => "getaddr",
            Message::Inv(_) => "inv",
            Message::GetHeaders(_) => "getheaders",
            Message::Headers(_) => "headers",
        }
    }

    /// Commands that may arrive before the handshake completes: the
    /// handshake itself plus liveness. Everything else is gated by the
    /// dispatcher until VERACK.
    pub fn allowed_pre_verack(command: &str) -> bool {
        matches!(command, "version" | "verack" | "ping" | "pong")
    }

    /// Rough encoded payload size, for send-queue accounting.
    pub fn approx_size(&self) -> usize {
        match self {
            Message::Version(v) => 4 + 8 + 8 + 26 * 2 + 8 + 1 + v.user_agent.len() + 4,
            Message::Verack | Message::GetAddr => 0,
            Message::Ping(_) | Message::Pong(_) => 8,
            Message::Addr(entries) => 9 + entries.len() * 30,
            Message::Inv(items) => 9 + items.len() * 36,
            Message::GetHeaders(p) => 4 + 9 + p.locator.len() * 32 + 32,
            Message::Headers(headers) => 9 + headers.len() * HEADER_SIZE,
        }
    }

    /// Serialize the payload (everything after the frame header).
    pub fn write_body<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        match self {
            Message::Version(v) => {
                writer.write_u32::<LittleEndian>(v.version)?;
                writer.write_u64::<LittleEndian>(v.services)?;
                writer.write_i64::<LittleEndian>(v.timestamp)?;
                write_net_address(writer, &v.addr_recv)?;
                write_net_address(writer, &v.addr_from)?;
                writer.write_u64::<LittleEndian>(v.nonce)?;
                write_varint(writer, v.user_agent.len() as u64)?;
                writer.write_all(v.user_agent.as_bytes())?;
                writer.write_i32::<LittleEndian>(v.start_height)?;
            }
            Message::Verack | Message::GetAddr => {}
            Message::Ping(nonce) | Message::Pong(nonce) => {
                writer.write_u64::<LittleEndian>(*nonce)?;
            }
            Message::Addr(entries) => {
                write_varint(writer, entries.len() as u64)?;
                for entry in entries {
                    writer.write_u32::<LittleEndian>(entry.timestamp)?;
                    write_net_address(writer, &entry.address)?;
                }
            }
            Message::Inv(items) => {
                write_varint(writer, items.len() as u64)?;
                for item in items {
                    writer.write_u32::<LittleEndian>(item.inv_type.to_wire())?;
                    writer.write_all(&item.hash)?;
                }
            }
            Message::GetHeaders(payload) => {
                writer.write_u32::<LittleEndian>(payload.version)?;
                write_varint(writer, payload.locator.len() as u64)?;
                for hash in &payload.locator {
                    writer.write_all(hash)?;
                }
                writer.write_all(&payload.hash_stop)?;
            }
            Message::Headers(headers) => {
                // No per-header txcount trailer: this chain is headers-only,
                // so entries are raw fixed-size headers.
                write_varint(writer, headers.len() as u64)?;
                for header in headers {
                    header.write_to(writer)?;
                }
            }
        }
        Ok(())
    }

    /// Parse a payload for `command`. Returns `Ok(None)` for commands this
    /// node does not recognize; callers drop them without penalty.
    pub fn read_body<R: Read>(
        command: &str,
        payload_len: usize,
        reader: &mut R,
    ) -> Result<Option<Message>, WireError> {
        let msg = match command {
            "version" => Message::Version(read_version(reader)?),
            "verack" => Message::Verack,
            "ping" => Message::Ping(reader.read_u64::<LittleEndian>()?),
            "pong" => Message::Pong(reader.read_u64::<LittleEndian>()?),
            "getaddr" => Message::GetAddr,
            "addr" => {
                let count = read_counted(reader, payload_len, 30)?;
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let timestamp = reader.read_u32::<LittleEndian>()?;
                    let address = read_net_address(reader)?;
                    entries.push(TimestampedAddress { timestamp, address });
                }
                Message::Addr(entries)
            }
            "inv" => {
                let count = read_counted(reader, payload_len, 36)?;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    let raw = reader.read_u32::<LittleEndian>()?;
                    let mut hash = [0u8; 32];
                    reader.read_exact(&mut hash)?;
                    items.push(InvItem {
                        inv_type: InvType::from_wire(raw),
                        hash,
                    });
                }
                Message::Inv(items)
            }
            "getheaders" => {
                let version = reader.read_u32::<LittleEndian>()?;
                let count = read_counted(reader, payload_len, 32)?;
                let mut locator = Vec::with_capacity(count);
                for _ in 0..count {
                    let mut hash = [0u8; 32];
                    reader.read_exact(&mut hash)?;
                    locator.push(hash);
                }
                let mut hash_stop = [0u8; 32];
                reader.read_exact(&mut hash_stop)?;
                Message::GetHeaders(GetHeadersPayload {
                    version,
                    locator,
                    hash_stop,
                })
            }
            "headers" => {
                let count = read_counted(reader, payload_len, HEADER_SIZE)?;
                let mut headers = Vec::with_capacity(count);
                for _ in 0..count {
                    headers.push(BlockHeader::read_from(reader)?);
                }
                Message::Headers(headers)
            }
            _ => return Ok(None),
        };
        Ok(Some(msg))
    }
}

/// Read a varint element count and sanity-check it against the bytes that
/// could actually be present, so a forged count cannot drive a huge
/// allocation.
fn read_counted<R: Read>(
    reader: &mut R,
    payload_len: usize,
    unit_size: usize,
) -> Result<usize, WireError> {
    let count = read_varint(reader)? as usize;
    if count.saturating_mul(unit_size) > payload_len {
        return Err(WireError::TruncatedPayload);
    }
    Ok(count)
}

fn write_net_address<W: Write>(writer: &mut W, addr: &NetAddress) -> io::Result<()> {
    writer.write_u64::<LittleEndian>(addr.services)?;
    writer.write_all(&addr.ip)?;
    // Port is the one big-endian field on the wire.
    writer.write_u16::<BigEndian>(addr.port)?;
    Ok(())
}

fn read_net_address<R: Read>(reader: &mut R) -> Result<NetAddress, WireError> {
    let services = reader.read_u64::<LittleEndian>()?;
    let mut ip = [0u8; 16];
    reader.read_exact(&mut ip)?;
    let port = reader.read_u16::<BigEndian>()?;
    Ok(NetAddress { services, ip, port })
}

fn read_version<R: Read>(reader: &mut R) -> Result<VersionPayload, WireError> {
    let version = reader.read_u32::<LittleEndian>()?;
    let services = reader.read_u64::<LittleEndian>()?;
    let timestamp = reader.read_i64::<LittleEndian>()?;
    let addr_recv = read_net_address(reader)?;
    let addr_from = read_net_address(reader)?;
    let nonce = reader.read_u64::<LittleEndian>()?;
    let agent_len = read_varint(reader)? as usize;
    if agent_len > MAX_USER_AGENT_LEN {
        return Err(WireError::OversizedPayload);
    }
    let mut agent_bytes = vec![0u8; agent_len];
    reader.read_exact(&mut agent_bytes)?;
    let user_agent = String::from_utf8(agent_bytes).map_err(|_| WireError::UnknownField)?;
    let start_height = reader.read_i32::<LittleEndian>()?;
    Ok(VersionPayload {
        version,
        services,
        timestamp,
        addr_recv,
        addr_from,
        nonce,
        user_agent,
        start_height,
    })
}
