//! Fixed-layout block header
//!
//! The header is exactly [`HEADER_SIZE`] bytes on the wire and in memory
//! order: the serialized form is the byte-for-byte hashing preimage, so
//! proof-of-work can be computed over the raw encoding without a separate
//! hashing layout.

use crate::types::{double_sha3, Hash};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

/// Serialized header size in bytes. Headers messages carry raw multiples
/// of this with no per-header trailer.
pub const HEADER_SIZE: usize = 100;

/// Byte length of the hashed prefix (everything before the pow commitment).
pub const COMMITMENT_PREIMAGE_SIZE: usize = 68;

/// Miner payout address length.
pub const MINER_ADDRESS_SIZE: usize = 20;

/// A block header. The chain carries no transactions, so this is the
/// entire block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev: Hash,
    pub miner_address: [u8; MINER_ADDRESS_SIZE],
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    /// Commitment to the proof-of-work hash of the fields above.
    pub pow_hash: Hash,
}

// The wire layout must stay pinned at 100 bytes; a drifting field would
// silently break the headers payload framing.
const _: () = assert!(4 + 32 + MINER_ADDRESS_SIZE + 4 + 4 + 4 + 32 == HEADER_SIZE);

impl BlockHeader {
    /// Serialize into a fixed 100-byte array.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        let mut cursor = io::Cursor::new(&mut buf[..]);
        self.write_to(&mut cursor)
            .expect("fixed-size buffer write cannot fail");
        buf
    }

    /// Write the serialized form to `writer`. Integer fields are
    /// little-endian.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_i32::<LittleEndian>(self.version)?;
        writer.write_all(&self.prev)?;
        writer.write_all(&self.miner_address)?;
        writer.write_u32::<LittleEndian>(self.time)?;
        writer.write_u32::<LittleEndian>(self.bits)?;
        writer.write_u32::<LittleEndian>(self.nonce)?;
        writer.write_all(&self.pow_hash)?;
        Ok(())
    }

    /// Parse one header from `reader`.
    pub fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        let version = reader.read_i32::<LittleEndian>()?;
        let mut prev = [0u8; 32];
        reader.read_exact(&mut prev)?;
        let mut miner_address = [0u8; MINER_ADDRESS_SIZE];
        reader.read_exact(&mut miner_address)?;
        let time = reader.read_u32::<LittleEndian>()?;
        let bits = reader.read_u32::<LittleEndian>()?;
        let nonce = reader.read_u32::<LittleEndian>()?;
        let mut pow_hash = [0u8; 32];
        reader.read_exact(&mut pow_hash)?;
        Ok(Self {
            version,
            prev,
            miner_address,
            time,
            bits,
            nonce,
            pow_hash,
        })
    }

    /// Block identity: double SHA3-256 over the full 100-byte encoding.
    pub fn hash(&self) -> Hash {
        double_sha3(&self.encode())
    }

    /// The proof-of-work hash this header must commit to: double SHA3-256
    /// over the 68-byte prefix (all fields except `pow_hash` itself).
    pub fn pow_commitment(&self) -> Hash {
        let encoded = self.encode();
        double_sha3(&encoded[..COMMITMENT_PREIMAGE_SIZE])
    }

    /// Cheap check: does the stored `pow_hash` match the recomputed
    /// commitment? This is the batch pre-filter; it does not compare
    /// against the difficulty target.
    pub fn commitment_valid(&self) -> bool {
        self.pow_hash == self.pow_commitment()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> BlockHeader {
        BlockHeader {
            version: 2,
            prev: [0x11; 32],
            miner_address: [0x22; 20],
            time: 1_712_000_000,
            bits: 0x207f_ffff,
            nonce: 42,
            pow_hash: [0x33; 32],
        }
    }

    #[test]
    fn encode_is_exactly_100_bytes() {
        assert_eq!(sample_header().encode().len(), HEADER_SIZE);
    }

    #[test]
    fn encode_decode_roundtrip() {
        let header = sample_header();
        let encoded = header.encode();
        let decoded = BlockHeader::read_from(&mut &encoded[..]).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn integer_fields_are_little_endian() {
        let header = sample_header();
        let encoded = header.encode();
        assert_eq!(&encoded[..4], &2i32.to_le_bytes());
        assert_eq!(&encoded[56..60], &1_712_000_000u32.to_le_bytes());
        assert_eq!(&encoded[64..68], &42u32.to_le_bytes());
    }

    #[test]
    fn commitment_covers_prefix_only() {
        let mut header = sample_header();
        let commitment = header.pow_commitment();
        // Changing the commitment field itself must not change the preimage.
        header.pow_hash = [0x44; 32];
        assert_eq!(header.pow_commitment(), commitment);
        // Changing the nonce must.
        header.nonce += 1;
        assert_ne!(header.pow_commitment(), commitment);
    }

    #[test]
    fn hash_changes_with_any_field() {
        let header = sample_header();
        let mut other = header;
        other.miner_address[0] ^= 1;
        assert_ne!(header.hash(), other.hash());
    }
}
