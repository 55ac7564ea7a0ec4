use std::{io, sync::Arc};

use web_time::Instant;

use crate::{
    ack::Acknowledge,
    bits::{self, BitWriter},
    io::DatagramSocket,
    msg::{PayloadCodec, UserType, MAX_RELIABLE_PAYLOAD, NO_PAYLOAD},
    packet::{self, PacketHeader, PacketType, MAX_RELIABLES_PER_PACKET, RELIABLE_COUNT_BITS},
    seq::Seq,
};

use super::{SentPacket, Transport};

/// Failed to send a packet.
///
/// [`SendError::WindowFull`] is ordinary backpressure; everything else
/// indicates a misconfiguration or a socket fault.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The 256-message reliable window is full.
    ///
    /// Non-fatal: retry after the peer has acknowledged older messages.
    #[error("reliable window full")]
    WindowFull,
    /// Payload exceeds the fixed reliable-slot capacity.
    #[error("payload of {len} bytes exceeds the {max} byte reliable limit")]
    PayloadTooLarge {
        /// Bytes in the rejected payload.
        len: usize,
        /// The fixed limit.
        max: usize,
    },
    /// No codec registered for this user type; a startup misconfiguration.
    #[error("user type {user_type} has no registered codec")]
    UnknownUserType {
        /// The unregistered user type.
        user_type: UserType,
    },
    /// The mandatory packet fields did not fit in the configured packet
    /// length.
    #[error("packet buffer overflow")]
    Overflow(#[from] bits::Overflow),
    /// The socket failed outright.
    #[error("failed to send datagram")]
    Io(#[from] io::Error),
}

impl<S: DatagramSocket> Transport<S> {
    /// Sends a fire-and-forget message.
    ///
    /// The packet also carries current acks and any pending reliable
    /// messages that fit, so plain sends double as reliable retransmission
    /// opportunities.
    ///
    /// # Errors
    ///
    /// Errors if `user_type` has no registered codec, or the socket fails.
    pub fn send(&mut self, user_type: UserType, data: &[u8], now: Instant) -> Result<(), SendError> {
        let registry = Arc::clone(&self.registry);
        let codec = registry
            .get(user_type)
            .ok_or(SendError::UnknownUserType { user_type })?;
        self.transmit(PacketType::Unreliable, user_type, Some((codec, data)), now)
    }

    /// Enqueues a reliable message and sends a carrier packet bearing it.
    ///
    /// The message stays in the send window, riding subsequent outgoing
    /// packets, until the peer acknowledges one that carried it.
    ///
    /// # Errors
    ///
    /// [`SendError::WindowFull`] if 256 reliable messages are already
    /// outstanding - retry after acks arrive. Otherwise as
    /// [`Transport::send`].
    pub fn reliable(
        &mut self,
        user_type: UserType,
        data: &[u8],
        now: Instant,
    ) -> Result<(), SendError> {
        if self.registry.get(user_type).is_none() {
            return Err(SendError::UnknownUserType { user_type });
        }
        if data.len() > MAX_RELIABLE_PAYLOAD {
            return Err(SendError::PayloadTooLarge {
                len: data.len(),
                max: MAX_RELIABLE_PAYLOAD,
            });
        }
        if self.send_window.push(user_type, data).is_none() {
            return Err(SendError::WindowFull);
        }
        self.transmit(PacketType::Reliable, NO_PAYLOAD, None, now)
    }

    /// Sends a bare carrier packet: acks plus pending reliable messages, no
    /// user payload.
    ///
    /// Call this periodically when the application has nothing to send;
    /// it is what keeps acks flowing back to the peer and unacked reliable
    /// messages being retransmitted.
    ///
    /// # Errors
    ///
    /// Errors if the socket fails.
    pub fn flush(&mut self, now: Instant) -> Result<(), SendError> {
        self.transmit(PacketType::Reliable, NO_PAYLOAD, None, now)
    }

    fn transmit(
        &mut self,
        packet_type: PacketType,
        user_type: UserType,
        payload: Option<(&dyn PayloadCodec, &[u8])>,
        now: Instant,
    ) -> Result<(), SendError> {
        let registry = Arc::clone(&self.registry);
        let mut words = [0u32; packet::MAX_PACKET_WORDS];
        let cap_words = self.config.max_packet_len / 4;
        let mut w = BitWriter::new(&mut words[..cap_words]);

        let seq = self.next_packet_seq;
        let header = PacketHeader {
            packet_type,
            user_type,
            seq,
            acks: Acknowledge::for_incoming(&self.incoming),
        };
        header.encode(&mut w)?;
        if let Some((codec, data)) = payload {
            codec.encode(&mut w, data)?;
        }

        // pick which pending reliable messages ride along: oldest first,
        // greedily, while the manifest still fits, hard-capped per packet
        let mut reliable_ids = [Seq::ZERO; MAX_RELIABLES_PER_PACKET];
        let mut reliable_count = 0;
        let mut manifest_bits = RELIABLE_COUNT_BITS;
        for (rseq, record) in self.send_window.iter_unacked() {
            if reliable_count == MAX_RELIABLES_PER_PACKET {
                break;
            }
            let Some(codec) = registry.get(record.user_type()) else {
                continue;
            };
            let entry_bits = 16 + 16 + codec.max_bits();
            if w.would_overflow(manifest_bits + entry_bits) {
                break;
            }
            reliable_ids[reliable_count] = rseq;
            reliable_count += 1;
            manifest_bits += entry_bits;
        }

        #[allow(clippy::cast_possible_truncation)]
        w.write_bits(reliable_count as u32, RELIABLE_COUNT_BITS)?;
        for &rseq in &reliable_ids[..reliable_count] {
            let Some(record) = self.send_window.get(rseq) else {
                continue;
            };
            let Some(codec) = registry.get(record.user_type()) else {
                continue;
            };
            w.write_bits(u32::from(rseq.0), 16)?;
            w.write_bits(u32::from(record.user_type()), 16)?;
            codec.encode(&mut w, record.payload())?;
        }

        w.flush();
        let used = w.words_written();
        let mut bytes = bits::words_to_bytes(&words[..used]);
        packet::seal(&mut bytes, self.config.protocol_id);

        self.outgoing.insert(
            seq,
            SentPacket {
                acked: false,
                sent_at: now,
                reliable_ids,
                reliable_count,
            },
        );
        self.next_packet_seq = seq + Seq(1);
        self.stats.packets_sent = self.stats.packets_sent.saturating_add(1);

        self.socket.send_to(&bytes, self.peer)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use assert_matches::assert_matches;
    use web_time::Instant;

    use super::*;
    use crate::{
        io::{memory_pair, MemorySocket},
        msg::{BlobCodec, Registry},
        transport::TransportConfig,
    };

    const BLOB: UserType = 1;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn transport() -> Transport<MemorySocket> {
        let mut registry = Registry::new();
        registry.register(BLOB, BlobCodec::new(64));
        let (a, _b) = memory_pair(addr(1), addr(2));
        Transport::new(
            a,
            addr(2),
            Arc::new(registry),
            TransportConfig::default(),
            Instant::now(),
        )
        .unwrap()
    }

    #[test]
    fn window_full_after_256_unacked() {
        let mut t = transport();
        let now = Instant::now();
        for i in 1..=300u32 {
            let result = t.reliable(BLOB, &i.to_le_bytes(), now);
            if i <= 256 {
                assert!(result.is_ok(), "message {i} should fit in the window");
            } else {
                assert_matches!(result, Err(SendError::WindowFull), "message {i}");
            }
        }
        assert_eq!(256, t.unacked_reliables());
    }

    #[test]
    fn unregistered_user_type_rejected() {
        let mut t = transport();
        let now = Instant::now();
        assert_matches!(
            t.send(99, b"x", now),
            Err(SendError::UnknownUserType { user_type: 99 })
        );
        assert_matches!(
            t.reliable(99, b"x", now),
            Err(SendError::UnknownUserType { user_type: 99 })
        );
    }

    #[test]
    fn oversized_reliable_payload_rejected() {
        let mut t = transport();
        let too_big = [0u8; MAX_RELIABLE_PAYLOAD + 1];
        assert_matches!(
            t.reliable(BLOB, &too_big, Instant::now()),
            Err(SendError::PayloadTooLarge { .. })
        );
        assert_eq!(0, t.unacked_reliables());
    }

    #[test]
    fn piggyback_capped_at_64_per_packet() {
        // a tiny codec, so the cap binds before the packet fills
        let mut registry = Registry::new();
        registry.register(BLOB, BlobCodec::new(4));
        let (a, _b) = memory_pair(addr(1), addr(2));
        let mut t = Transport::new(
            a,
            addr(2),
            Arc::new(registry),
            TransportConfig::default(),
            Instant::now(),
        )
        .unwrap();

        let now = Instant::now();
        for _ in 0..100 {
            t.reliable(BLOB, b"m", now).unwrap();
        }
        // the last carrier packet can hold at most 64 of the 100 pending
        let record = t.outgoing.get(t.next_packet_seq - crate::seq::Seq(1)).unwrap();
        assert_eq!(MAX_RELIABLES_PER_PACKET, record.reliable_count);
    }

    #[test]
    fn small_packets_attach_fewer_reliables() {
        let mut registry = Registry::new();
        registry.register(BLOB, BlobCodec::new(64));
        let (a, _b) = memory_pair(addr(1), addr(2));
        let config = TransportConfig::default().with_max_packet_len(64);
        let mut t =
            Transport::new(a, addr(2), Arc::new(registry), config, Instant::now()).unwrap();

        let now = Instant::now();
        for _ in 0..10 {
            t.reliable(BLOB, &[0u8; 64], now).unwrap();
        }
        let record = t.outgoing.get(t.next_packet_seq - crate::seq::Seq(1)).unwrap();
        // 64-byte packets cannot fit ten 64-byte entries; selection must
        // have stopped early rather than overflow
        assert!(record.reliable_count < 10);
    }
}
