//! See [`Transport`].

mod recv;
mod send;

pub use {recv::*, send::*};

use std::{net::SocketAddr, sync::Arc};

use bytes::Bytes;
use static_assertions::const_assert;
use web_time::Instant;

use crate::{
    msg::{Registry, UserType},
    packet::{PacketHeader, MAX_PACKET_LEN, MAX_RELIABLES_PER_PACKET, RELIABLE_COUNT_BITS},
    reliable::{RecvQueue, SendWindow},
    rtt::RttEstimator,
    seq::Seq,
    seq_buf::SeqBuf,
};

/// Smallest allowed [`TransportConfig::max_packet_len`]: room for the
/// mandatory header fields plus a small payload.
pub const MIN_PACKET_LEN: usize = 64;

const_assert!(MIN_PACKET_LEN * 8 >= PacketHeader::ENCODE_BITS + RELIABLE_COUNT_BITS);

/// Configuration for a [`Transport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Identifies the protocol revision both endpoints must share.
    ///
    /// Never sent on the wire: it seeds the packet checksum, so endpoints
    /// with different ids reject each other's packets as corrupt.
    pub protocol_id: u16,
    /// Maximum size of one outgoing packet in bytes; a whole number of
    /// 32-bit words in `MIN_PACKET_LEN..=MAX_PACKET_LEN`.
    pub max_packet_len: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            protocol_id: 0x574c,
            max_packet_len: MAX_PACKET_LEN,
        }
    }
}

impl TransportConfig {
    /// Sets [`TransportConfig::protocol_id`] on this value.
    #[must_use]
    pub const fn with_protocol_id(mut self, protocol_id: u16) -> Self {
        self.protocol_id = protocol_id;
        self
    }

    /// Sets [`TransportConfig::max_packet_len`] on this value.
    #[must_use]
    pub const fn with_max_packet_len(mut self, max_packet_len: usize) -> Self {
        self.max_packet_len = max_packet_len;
        self
    }
}

/// [`TransportConfig::max_packet_len`] was not a whole number of words in
/// the allowed range.
#[derive(Debug, Clone, thiserror::Error)]
#[error("max packet length {len} invalid (must be a multiple of 4 in {MIN_PACKET_LEN}..={MAX_PACKET_LEN})")]
pub struct PacketLenInvalid {
    /// Length that was requested.
    pub len: usize,
}

/// Counters for traffic through one [`Transport`].
///
/// Dropped incoming packets are counted here instead of surfacing errors:
/// network-origin faults never unwind into application code.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportStats {
    /// Packets sent out.
    pub packets_sent: usize,
    /// Valid packets received and processed.
    pub packets_recv: usize,
    /// Our packets the peer has acknowledged.
    pub packets_acked: usize,
    /// Incoming packets dropped for a checksum mismatch.
    pub bad_checksum: usize,
    /// Incoming packets dropped as truncated or otherwise unreadable.
    pub malformed: usize,
    /// Incoming packets dropped for an unknown or unsupported packet type,
    /// or an unregistered user type.
    pub rejected: usize,
    /// Incoming packets dropped as older than the tracking window.
    pub stale: usize,
    /// Datagrams ignored because they came from an address other than the
    /// peer.
    pub foreign: usize,
}

/// Record of one sent packet, kept until its slot is recycled.
#[derive(Debug, Clone)]
pub(crate) struct SentPacket {
    pub acked: bool,
    pub sent_at: Instant,
    /// Reliable message ids attached to this packet; acking the packet acks
    /// all of them.
    pub reliable_ids: [Seq; MAX_RELIABLES_PER_PACKET],
    pub reliable_count: usize,
}

impl SentPacket {
    fn empty(now: Instant) -> Self {
        Self {
            acked: false,
            sent_at: now,
            reliable_ids: [Seq::ZERO; MAX_RELIABLES_PER_PACKET],
            reliable_count: 0,
        }
    }
}

/// Reliable-messaging endpoint for the conversation with one remote peer.
///
/// Composes the sequence buffers, reliable channel, ack tracking and RTT
/// estimation over a [`DatagramSocket`]. One `Transport` per directional
/// conversation partner; datagrams from any other address are ignored.
///
/// Not safe for concurrent use: every operation mutates shared buffer and
/// cursor state. Confine a transport to one thread, or serialize access
/// behind one mutex. To receive on a dedicated thread, pair it with
/// [`RecvWorker`](crate::io::RecvWorker) and feed datagrams through
/// [`Transport::process`].
///
/// [`DatagramSocket`]: crate::io::DatagramSocket
#[derive(Debug)]
pub struct Transport<S> {
    pub(crate) socket: S,
    pub(crate) peer: SocketAddr,
    pub(crate) registry: Arc<Registry>,
    pub(crate) config: TransportConfig,
    /// Metadata for packets we sent, keyed by packet sequence.
    pub(crate) outgoing: SeqBuf<SentPacket, 256>,
    /// Which of the peer's packet sequences we have seen.
    pub(crate) incoming: SeqBuf<(), 256>,
    pub(crate) send_window: SendWindow,
    pub(crate) recv_queue: RecvQueue,
    pub(crate) next_packet_seq: Seq,
    pub(crate) rtt: RttEstimator,
    pub(crate) stats: TransportStats,
}

impl<S> Transport<S> {
    /// Creates a transport speaking to `peer` over `socket`.
    ///
    /// The socket is constructed (and its bind failures handled) by the
    /// caller; `now` timestamps the construction.
    ///
    /// # Errors
    ///
    /// Errors if the configured packet length is invalid.
    pub fn new(
        socket: S,
        peer: SocketAddr,
        registry: Arc<Registry>,
        config: TransportConfig,
        now: Instant,
    ) -> Result<Self, PacketLenInvalid> {
        if config.max_packet_len % 4 != 0
            || !(MIN_PACKET_LEN..=MAX_PACKET_LEN).contains(&config.max_packet_len)
        {
            return Err(PacketLenInvalid {
                len: config.max_packet_len,
            });
        }
        Ok(Self {
            socket,
            peer,
            registry,
            config,
            outgoing: SeqBuf::new_from_fn(|_| SentPacket::empty(now)),
            incoming: SeqBuf::new(),
            send_window: SendWindow::new(),
            recv_queue: RecvQueue::new(),
            next_packet_seq: Seq::ZERO,
            rtt: RttEstimator::default(),
            stats: TransportStats::default(),
        })
    }

    /// Gets the peer this transport speaks to.
    #[must_use]
    pub const fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Gets the underlying socket.
    pub const fn socket(&self) -> &S {
        &self.socket
    }

    /// Gets the underlying socket mutably.
    ///
    /// Needed to drive a wrapping [`NetworkSimulator`]'s flush.
    ///
    /// [`NetworkSimulator`]: crate::sim::NetworkSimulator
    pub fn socket_mut(&mut self) -> &mut S {
        &mut self.socket
    }

    /// Gets the current RTT estimation state.
    #[must_use]
    pub const fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    /// Gets the traffic counters.
    #[must_use]
    pub const fn stats(&self) -> TransportStats {
        self.stats
    }

    /// Number of reliable messages sent but not yet acknowledged.
    ///
    /// When this reaches the window size (256), [`Transport::reliable`]
    /// fails until acks arrive.
    #[must_use]
    pub fn unacked_reliables(&self) -> usize {
        self.send_window.outstanding()
    }

    /// Pops the next reliable message, strictly in the order the peer sent
    /// them.
    ///
    /// Returns [`None`] when the next message in order has not arrived yet;
    /// later messages wait behind the gap. Each message is yielded exactly
    /// once, no matter how many duplicate copies the network delivered.
    pub fn recv_reliable(&mut self) -> Option<(UserType, Bytes)> {
        self.recv_queue.pop()
    }
}
