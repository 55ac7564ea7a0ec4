//! Wire-level packet layout and the CRC integrity boundary.
//!
//! The layout of a single packet, bit-packed with no alignment padding
//! except the final flush to a whole 32-bit word:
//!
//! ```text
//! u32  crc32         over all bytes after this field, seeded with the
//!                    protocol id (the id itself never goes on the wire)
//! u16  packet type   Unreliable = 1, Reliable = 2, Slice = 3
//! u16  user type     0 = reserved, "no user payload"
//! -- for Unreliable / Reliable --
//! u16  sequence
//! u16  ack
//! u32  ack bitmask
//!      user payload bits, via the registered codec
//! u7   reliable count (0..=64)
//!      per entry: u16 id, u16 user type, payload bits via the codec
//! ```

use arbitrary::Arbitrary;
use static_assertions::const_assert;

use crate::{
    ack::Acknowledge,
    bits::{BitReader, BitWriter, Overflow},
    seq::Seq,
};

/// Maximum total size of one packet on the wire, in bytes.
pub const MAX_PACKET_LEN: usize = 1200;

/// [`MAX_PACKET_LEN`] in 32-bit words.
pub const MAX_PACKET_WORDS: usize = MAX_PACKET_LEN / 4;

/// Hard cap on reliable messages attached to one packet, regardless of
/// remaining space.
pub const MAX_RELIABLES_PER_PACKET: usize = 64;

/// Width of the reliable-count field.
pub const RELIABLE_COUNT_BITS: usize = 7;

const_assert!(MAX_PACKET_LEN % 4 == 0);
const_assert!(MAX_RELIABLES_PER_PACKET < (1 << RELIABLE_COUNT_BITS));

/// Transport-internal framing of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Arbitrary)]
pub enum PacketType {
    /// Fire-and-forget application payload.
    Unreliable,
    /// Carrier for reliable-delivery traffic; its own user payload slot is
    /// usually empty.
    Reliable,
    /// Fragment of a payload larger than one packet. Declared but never
    /// built; receiving one drops the packet.
    Slice,
}

impl PacketType {
    /// Gets the on-wire value of this type.
    #[must_use]
    pub const fn to_wire(self) -> u16 {
        match self {
            Self::Unreliable => 1,
            Self::Reliable => 2,
            Self::Slice => 3,
        }
    }

    /// Parses an on-wire value.
    #[must_use]
    pub const fn from_wire(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::Unreliable),
            2 => Some(Self::Reliable),
            3 => Some(Self::Slice),
            _ => None,
        }
    }
}

/// Leading fields of every sequenced packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Transport-internal framing.
    pub packet_type: PacketType,
    /// Application payload kind; [`NO_PAYLOAD`](crate::msg::NO_PAYLOAD) for
    /// carrier packets.
    pub user_type: u16,
    /// Monotonically increasing sequence number of this packet.
    pub seq: Seq,
    /// Which of the peer's packets we have received.
    pub acks: Acknowledge,
}

impl PacketHeader {
    /// Bits occupied by an encoded header, including the CRC placeholder.
    pub const ENCODE_BITS: usize = 32 + 16 + 16 + 16 + 16 + 32;

    /// Encodes this header, leaving a placeholder where the CRC goes.
    ///
    /// The placeholder is patched by [`seal`] once the rest of the packet
    /// has been written and flushed.
    ///
    /// # Errors
    ///
    /// Errors if the buffer cannot hold a header.
    pub fn encode(&self, w: &mut BitWriter<'_>) -> Result<(), Overflow> {
        w.write_bits(0, 32)?;
        w.write_bits(u32::from(self.packet_type.to_wire()), 16)?;
        w.write_bits(u32::from(self.user_type), 16)?;
        w.write_bits(u32::from(self.seq.0), 16)?;
        w.write_bits(u32::from(self.acks.ack.0), 16)?;
        w.write_bits(self.acks.bits, 32)?;
        Ok(())
    }

    /// Decodes a header, assuming [`verify`] already accepted the packet.
    ///
    /// # Errors
    ///
    /// Errors if the buffer is truncated or the packet type is unknown; the
    /// error carries the offending wire value in the latter case.
    pub fn decode(r: &mut BitReader<'_>) -> Result<Self, HeaderError> {
        let _crc = r.read_bits(32)?;
        #[allow(clippy::cast_possible_truncation)]
        let type_raw = r.read_bits(16)? as u16;
        let packet_type =
            PacketType::from_wire(type_raw).ok_or(HeaderError::UnknownType { value: type_raw })?;
        #[allow(clippy::cast_possible_truncation)]
        let user_type = r.read_bits(16)? as u16;
        #[allow(clippy::cast_possible_truncation)]
        let seq = Seq(r.read_bits(16)? as u16);
        #[allow(clippy::cast_possible_truncation)]
        let ack = Seq(r.read_bits(16)? as u16);
        let bits = r.read_bits(32)?;
        Ok(Self {
            packet_type,
            user_type,
            seq,
            acks: Acknowledge { ack, bits },
        })
    }
}

/// Failed to decode a [`PacketHeader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    /// Ran out of bits mid-header.
    #[error("truncated header")]
    Truncated(#[from] Overflow),
    /// The packet-type field holds a value this protocol does not define.
    #[error("unknown packet type {value}")]
    UnknownType {
        /// Offending wire value.
        value: u16,
    },
}

/// Computes the checksum of a packet's post-CRC bytes, seeded with the
/// protocol id.
///
/// Embedding the id in the seed rather than the packet means two endpoints
/// speaking different protocol ids reject each other's packets as corrupt,
/// without spending any wire bytes on the id.
#[must_use]
pub fn checksum(payload: &[u8], protocol_id: u16) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(u32::from(protocol_id));
    hasher.update(payload);
    hasher.finalize()
}

/// Patches the CRC of a fully-written packet into its leading placeholder.
///
/// # Panics
///
/// Panics if `bytes` is shorter than the CRC field itself; packets are
/// always built with a header, so this cannot happen on the send path.
pub fn seal(bytes: &mut [u8], protocol_id: u16) {
    let crc = checksum(&bytes[4..], protocol_id);
    bytes[..4].copy_from_slice(&crc.to_le_bytes());
}

/// Checks a received packet's CRC. Fails closed: anything shorter than the
/// CRC field, or with a mismatching checksum, is rejected.
#[must_use]
pub fn verify(bytes: &[u8], protocol_id: u16) -> bool {
    let Some((lead, payload)) = bytes.split_at_checked(4) else {
        return false;
    };
    let stored = u32::from_le_bytes([lead[0], lead[1], lead[2], lead[3]]);
    stored == checksum(payload, protocol_id)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::bits::{bytes_to_words, words_to_bytes};

    fn build(header: &PacketHeader, protocol_id: u16) -> Vec<u8> {
        let mut words = [0u32; MAX_PACKET_WORDS];
        let mut w = BitWriter::new(&mut words);
        header.encode(&mut w).unwrap();
        w.flush();
        let used = w.words_written();
        let mut bytes = words_to_bytes(&words[..used]);
        seal(&mut bytes, protocol_id);
        bytes
    }

    #[test]
    fn header_round_trip() {
        let header = PacketHeader {
            packet_type: PacketType::Reliable,
            user_type: 17,
            seq: Seq(5),
            acks: Acknowledge {
                ack: Seq(10),
                bits: 0b101,
            },
        };
        let bytes = build(&header, 0xaa55);
        assert!(verify(&bytes, 0xaa55));

        let mut words = [0u32; MAX_PACKET_WORDS];
        let used = bytes_to_words(&bytes, &mut words).unwrap();
        let mut r = BitReader::new(&words[..used]);
        assert_eq!(header, PacketHeader::decode(&mut r).unwrap());
    }

    #[test]
    fn wrong_protocol_id_rejected() {
        let header = PacketHeader {
            packet_type: PacketType::Unreliable,
            user_type: 1,
            seq: Seq(0),
            acks: Acknowledge::default(),
        };
        let bytes = build(&header, 1);
        assert!(!verify(&bytes, 2));
    }

    #[test]
    fn any_single_bit_flip_rejected() {
        let header = PacketHeader {
            packet_type: PacketType::Unreliable,
            user_type: 3,
            seq: Seq(1234),
            acks: Acknowledge {
                ack: Seq(1230),
                bits: 0xffff,
            },
        };
        let bytes = build(&header, 7);
        for bit in 0..bytes.len() * 8 {
            let mut corrupt = bytes.clone();
            corrupt[bit / 8] ^= 1 << (bit % 8);
            assert!(!verify(&corrupt, 7), "flip of bit {bit} went undetected");
        }
    }

    #[test]
    fn unknown_type_carries_wire_value() {
        let mut words = [0u32; 4];
        let mut w = BitWriter::new(&mut words);
        w.write_bits(0, 32).unwrap();
        w.write_bits(9, 16).unwrap();
        w.flush();

        let mut r = BitReader::new(&words);
        assert_matches!(
            PacketHeader::decode(&mut r),
            Err(HeaderError::UnknownType { value: 9 })
        );
    }

    #[test]
    fn truncated_header() {
        let words = [0u32; 1];
        let mut r = BitReader::new(&words);
        assert_matches!(PacketHeader::decode(&mut r), Err(HeaderError::Truncated(_)));
    }
}
