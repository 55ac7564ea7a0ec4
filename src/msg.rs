//! Per-user-type payload codecs.
//!
//! The transport never interprets application payloads: it only decides
//! *when* payload bits are written to and read from a packet. What those
//! bits mean is defined by a [`PayloadCodec`] registered per user type,
//! once, at startup.

use ahash::AHashMap;
use bytes::Bytes;

use crate::bits::{BitReader, BitWriter, Overflow};

/// Application-defined payload kind carried in a packet's user-type field.
pub type UserType = u16;

/// Wire value meaning "no user payload follows".
///
/// Carrier packets - sent to move acks and pending reliable messages when
/// the application has nothing to say - use this as their user type, so it
/// may not be registered.
pub const NO_PAYLOAD: UserType = 0;

/// Maximum bytes of a single reliable message payload.
///
/// Reliable messages live in fixed-size window slots until acknowledged, so
/// this bound is structural, not advisory.
pub const MAX_RELIABLE_PAYLOAD: usize = 256;

/// Maximum encoded width a registered codec may declare, in bits: the
/// reliable slot blob plus a 2-byte length prefix.
pub const MAX_PAYLOAD_BITS: usize = (MAX_RELIABLE_PAYLOAD + 2) * 8;

/// Application-defined encoding for one user type's payloads.
pub trait PayloadCodec: Send + Sync {
    /// Writes `data` into the buffer.
    ///
    /// Must never write more than [`max_bits`](Self::max_bits) bits.
    ///
    /// # Errors
    ///
    /// Errors if the buffer runs out of space.
    fn encode(&self, w: &mut BitWriter<'_>, data: &[u8]) -> Result<(), Overflow>;

    /// Reads one payload back out of the buffer.
    ///
    /// # Errors
    ///
    /// Errors if the buffer runs out of bits, or the encoded payload is
    /// malformed.
    fn decode(&self, r: &mut BitReader<'_>) -> Result<Bytes, Overflow>;

    /// Upper bound on the encoded width of any payload of this type.
    ///
    /// Consulted for packet-fit decisions *before* the payload is actually
    /// serialized, so it must be a true upper bound.
    fn max_bits(&self) -> usize;
}

/// Table of payload codecs, keyed by user type.
///
/// Built once at startup and shared (behind an [`Arc`](std::sync::Arc))
/// between every transport that speaks the same protocol.
#[derive(Default)]
pub struct Registry {
    codecs: AHashMap<UserType, Box<dyn PayloadCodec>>,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the codec for `user_type`.
    ///
    /// # Panics
    ///
    /// These are build-time misconfigurations, not runtime network
    /// conditions, so they fail fast:
    /// - `user_type` is [`NO_PAYLOAD`] (reserved)
    /// - `user_type` is already registered
    /// - the codec's [`max_bits`](PayloadCodec::max_bits) exceeds
    ///   [`MAX_PAYLOAD_BITS`]
    pub fn register(&mut self, user_type: UserType, codec: impl PayloadCodec + 'static) {
        assert!(user_type != NO_PAYLOAD, "user type 0 is reserved");
        assert!(
            codec.max_bits() <= MAX_PAYLOAD_BITS,
            "codec for user type {user_type} exceeds the payload budget \
             ({} > {MAX_PAYLOAD_BITS} bits)",
            codec.max_bits(),
        );
        let prev = self.codecs.insert(user_type, Box::new(codec));
        assert!(prev.is_none(), "user type {user_type} registered twice");
    }

    /// Gets the codec registered for `user_type`.
    #[must_use]
    pub fn get(&self, user_type: UserType) -> Option<&dyn PayloadCodec> {
        self.codecs.get(&user_type).map(AsRef::as_ref)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.codecs.keys()).finish()
    }
}

/// Length-prefixed raw byte payloads, up to a fixed maximum length.
///
/// The wire form is a 16-bit length followed by the bytes. Suitable for
/// applications that move opaque byte blobs, and for tests.
#[derive(Debug, Clone, Copy)]
pub struct BlobCodec {
    max_len: usize,
}

impl BlobCodec {
    /// Creates a codec for blobs of up to `max_len` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `max_len > MAX_RELIABLE_PAYLOAD`.
    #[must_use]
    pub fn new(max_len: usize) -> Self {
        assert!(max_len <= MAX_RELIABLE_PAYLOAD);
        Self { max_len }
    }
}

impl PayloadCodec for BlobCodec {
    fn encode(&self, w: &mut BitWriter<'_>, data: &[u8]) -> Result<(), Overflow> {
        debug_assert!(data.len() <= self.max_len);
        #[allow(clippy::cast_possible_truncation)]
        w.write_bits(data.len() as u32, 16)?;
        for chunk in data.chunks(4) {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            w.write_bits(u32::from_le_bytes(word), chunk.len() * 8)?;
        }
        Ok(())
    }

    fn decode(&self, r: &mut BitReader<'_>) -> Result<Bytes, Overflow> {
        let len = r.read_bits(16)? as usize;
        if len > self.max_len {
            return Err(Overflow);
        }
        let mut out = Vec::with_capacity(len);
        let mut left = len;
        while left > 0 {
            let take = left.min(4);
            let word = r.read_bits(take * 8)?.to_le_bytes();
            out.extend_from_slice(&word[..take]);
            left -= take;
        }
        Ok(Bytes::from(out))
    }

    fn max_bits(&self) -> usize {
        16 + self.max_len * 8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_round_trip() {
        let codec = BlobCodec::new(16);
        let mut words = [0u32; 8];
        let mut w = BitWriter::new(&mut words);
        // odd length exercises the partial final chunk
        codec.encode(&mut w, b"hello").unwrap();
        codec.encode(&mut w, b"").unwrap();
        codec.encode(&mut w, b"0123456789abcdef").unwrap();
        w.flush();
        let used = w.words_written();

        let mut r = BitReader::new(&words[..used]);
        assert_eq!(&b"hello"[..], codec.decode(&mut r).unwrap());
        assert_eq!(&b""[..], codec.decode(&mut r).unwrap());
        assert_eq!(&b"0123456789abcdef"[..], codec.decode(&mut r).unwrap());
    }

    #[test]
    fn blob_rejects_oversized_length() {
        let codec = BlobCodec::new(4);
        let mut words = [0u32; 4];
        let mut w = BitWriter::new(&mut words);
        // length field claims more than the codec's maximum
        w.write_bits(100, 16).unwrap();
        w.flush();
        let used = w.words_written();

        let mut r = BitReader::new(&words[..used]);
        assert!(codec.decode(&mut r).is_err());
    }

    #[test]
    #[should_panic = "user type 0 is reserved"]
    fn reserved_user_type() {
        let mut registry = Registry::new();
        registry.register(NO_PAYLOAD, BlobCodec::new(4));
    }

    #[test]
    #[should_panic = "registered twice"]
    fn double_registration() {
        let mut registry = Registry::new();
        registry.register(1, BlobCodec::new(4));
        registry.register(1, BlobCodec::new(8));
    }

    #[test]
    fn lookup() {
        let mut registry = Registry::new();
        registry.register(7, BlobCodec::new(4));
        assert!(registry.get(7).is_some());
        assert!(registry.get(8).is_none());
        assert_eq!(16 + 32, registry.get(7).unwrap().max_bits());
    }
}
