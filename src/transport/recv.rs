use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace};
use web_time::Instant;

use crate::{
    ack::Acknowledge,
    bits::{self, BitReader},
    io::DatagramSocket,
    msg::{UserType, NO_PAYLOAD},
    packet::{self, HeaderError, PacketHeader, PacketType, MAX_RELIABLES_PER_PACKET},
    seq::Seq,
};

use super::Transport;

/// Failed to process one incoming datagram.
///
/// These are network-origin faults: [`Transport::recv`] absorbs them
/// (counting and dropping the packet), and only [`Transport::process`]
/// surfaces them, for callers that want the detail.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecvError {
    /// Checksum mismatch: corrupted in transit, malicious, or from an
    /// endpoint speaking a different protocol id. Dropped without further
    /// parsing.
    #[error("bad checksum")]
    BadChecksum,
    /// Truncated or structurally unreadable packet.
    #[error("malformed packet")]
    Malformed,
    /// Packet-type field holds a value this protocol does not define.
    #[error("unknown packet type {value}")]
    UnknownPacketType {
        /// Offending wire value.
        value: u16,
    },
    /// A declared-but-unbuilt packet type ([`PacketType::Slice`]).
    #[error("unsupported packet type {packet_type:?}")]
    Unsupported {
        /// The unsupported type.
        packet_type: PacketType,
    },
    /// A user type with no registered codec; the peer is misconfigured
    /// relative to us.
    #[error("user type {user_type} has no registered codec")]
    UnknownUserType {
        /// The unregistered user type.
        user_type: UserType,
    },
    /// Packet sequence fell behind the 256-packet tracking window.
    #[error("stale packet sequence {seq:?}")]
    Stale {
        /// The stale sequence.
        seq: Seq,
    },
}

impl<S: DatagramSocket> Transport<S> {
    /// Polls the socket and returns the next application payload, in
    /// arrival order.
    ///
    /// Datagrams from addresses other than the peer, carrier packets, and
    /// packets failing any integrity check are consumed without being
    /// returned; drops are counted in [`Transport::stats`]. Returns
    /// [`None`] once the socket has nothing more to read.
    pub fn recv(&mut self, now: Instant) -> Option<(UserType, Bytes)> {
        let mut buf = [0u8; packet::MAX_PACKET_LEN];
        loop {
            let (len, from) = match self.socket.recv_from(&mut buf) {
                Ok(Some(datagram)) => datagram,
                Ok(None) => return None,
                Err(err) => {
                    debug!("socket receive failed: {err}");
                    return None;
                }
            };
            if from != self.peer {
                self.stats.foreign = self.stats.foreign.saturating_add(1);
                trace!(%from, "ignoring datagram from non-peer address");
                continue;
            }
            match self.process(&buf[..len], now) {
                Ok(Some(message)) => return Some(message),
                Ok(None) => {}
                Err(err) => self.note_drop(&err),
            }
        }
    }

    /// Processes one already-received datagram from the peer.
    ///
    /// This is the worker-offload entry point: a receive thread hands
    /// fully-received datagrams over (see
    /// [`RecvWorker`](crate::io::RecvWorker)), and the owning thread parses
    /// them on its own schedule.
    ///
    /// Returns the application payload carried by the packet, if any;
    /// reliable messages it carried become available through
    /// [`Transport::recv_reliable`].
    ///
    /// # Errors
    ///
    /// Errors if the packet fails an integrity check; the packet must then
    /// be treated as if it never arrived.
    pub fn process(
        &mut self,
        bytes: &[u8],
        now: Instant,
    ) -> Result<Option<(UserType, Bytes)>, RecvError> {
        if bytes.len() > self.config.max_packet_len {
            return Err(RecvError::Malformed);
        }
        if !packet::verify(bytes, self.config.protocol_id) {
            return Err(RecvError::BadChecksum);
        }

        let mut words = [0u32; packet::MAX_PACKET_WORDS];
        let used = bits::bytes_to_words(bytes, &mut words).ok_or(RecvError::Malformed)?;
        let mut r = BitReader::new(&words[..used]);

        let header = PacketHeader::decode(&mut r).map_err(|err| match err {
            HeaderError::Truncated(_) => RecvError::Malformed,
            HeaderError::UnknownType { value } => RecvError::UnknownPacketType { value },
        })?;
        match header.packet_type {
            PacketType::Unreliable | PacketType::Reliable => {}
            PacketType::Slice => {
                return Err(RecvError::Unsupported {
                    packet_type: PacketType::Slice,
                })
            }
        }

        // record the sequence (idempotent for duplicates) and apply acks
        // before touching the payload, so even a packet whose payload we
        // cannot read still advances ack and RTT state
        if self.incoming.insert(header.seq, ()).is_none() {
            return Err(RecvError::Stale { seq: header.seq });
        }
        self.apply_acks(header.acks, now);
        self.stats.packets_recv = self.stats.packets_recv.saturating_add(1);

        let registry = Arc::clone(&self.registry);
        let message = if header.user_type == NO_PAYLOAD {
            None
        } else {
            let codec = registry
                .get(header.user_type)
                .ok_or(RecvError::UnknownUserType {
                    user_type: header.user_type,
                })?;
            let payload = codec.decode(&mut r).map_err(|_| RecvError::Malformed)?;
            Some((header.user_type, payload))
        };

        let reliable_count = r
            .read_bits(packet::RELIABLE_COUNT_BITS)
            .map_err(|_| RecvError::Malformed)? as usize;
        if reliable_count > MAX_RELIABLES_PER_PACKET {
            return Err(RecvError::Malformed);
        }
        for _ in 0..reliable_count {
            #[allow(clippy::cast_possible_truncation)]
            let id = Seq(r.read_bits(16).map_err(|_| RecvError::Malformed)? as u16);
            #[allow(clippy::cast_possible_truncation)]
            let user_type = r.read_bits(16).map_err(|_| RecvError::Malformed)? as u16;
            let codec = registry
                .get(user_type)
                .ok_or(RecvError::UnknownUserType { user_type })?;
            // decode unconditionally: duplicates and out-of-window entries
            // are skipped, but their bits must still be consumed to keep
            // the cursor aligned for the entries after them
            let payload = codec.decode(&mut r).map_err(|_| RecvError::Malformed)?;
            if self.recv_queue.accepts(id) {
                self.recv_queue.store(id, user_type, &payload);
            }
        }

        Ok(message)
    }

    /// Applies an incoming ack header to our sent-packet records.
    ///
    /// Idempotent: a packet already marked acked contributes nothing, so
    /// receiving the same ack window twice is harmless.
    fn apply_acks(&mut self, acks: Acknowledge, now: Instant) {
        for seq in acks.seqs() {
            let (sent_at, reliable_ids, reliable_count) = {
                let Some(record) = self.outgoing.get_mut(seq) else {
                    continue;
                };
                if record.acked {
                    continue;
                }
                record.acked = true;
                (record.sent_at, record.reliable_ids, record.reliable_count)
            };
            self.rtt.update(now.saturating_duration_since(sent_at));
            self.stats.packets_acked = self.stats.packets_acked.saturating_add(1);
            for &id in &reliable_ids[..reliable_count] {
                self.send_window.retire(id);
            }
        }
    }

    fn note_drop(&mut self, err: &RecvError) {
        let counter = match err {
            RecvError::BadChecksum => &mut self.stats.bad_checksum,
            RecvError::Malformed => &mut self.stats.malformed,
            RecvError::Stale { .. } => &mut self.stats.stale,
            RecvError::UnknownPacketType { .. }
            | RecvError::Unsupported { .. }
            | RecvError::UnknownUserType { .. } => &mut self.stats.rejected,
        };
        *counter = counter.saturating_add(1);
        trace!(?err, "dropped incoming packet");
    }
}
