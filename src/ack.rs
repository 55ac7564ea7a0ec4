//! See [`Acknowledge`].

use arbitrary::Arbitrary;

use crate::{seq::Seq, seq_buf::SeqBuf};

/// Cumulative acknowledgement of the most recent received packet plus the
/// 32 packets before it.
///
/// This uses the strategy described in [*Gaffer On Games*]: every packet
/// carries the last received packet sequence (`ack`) and a bitmask `bits`
/// where bit `i` being set means sequence `ack - i` has been received. Bit 0
/// is `ack` itself, so one header acknowledges a 33-packet window - enough
/// redundancy that an ack survives heavy packet loss without any dedicated
/// ack traffic.
///
/// ```text
/// ack: 40
/// bits: 0b0000..00001001
///               ^   ^  ^
///               |   |  +- seq 40 (40 - 0) has been received
///               |   +---- seq 37 (40 - 3) has been received
///               +-------- seq 33 (40 - 7) has NOT been received
/// ```
///
/// [*Gaffer On Games*]: https://gafferongames.com/post/reliable_ordered_messages/#packet-levelacks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Arbitrary)]
pub struct Acknowledge {
    /// Most recent received packet sequence number.
    pub ack: Seq,
    /// Bitmask of which packets at and before `ack` have been received.
    pub bits: u32,
}

impl Acknowledge {
    /// Builds the header advertising the state of `incoming`, the receive
    /// buffer tracking which packet sequences have been seen.
    #[must_use]
    pub fn for_incoming<T, const N: usize>(incoming: &SeqBuf<T, N>) -> Self {
        let ack = incoming.newest();
        let mut bits = 0u32;
        for i in 0..32u16 {
            if incoming.exists(ack - Seq(i)) {
                bits |= shl(1, u32::from(i));
            }
        }
        Self { ack, bits }
    }

    /// Iterates over every sequence number this header acknowledges.
    ///
    /// `ack` itself is only yielded if bit 0 is set - a peer that has
    /// received nothing advertises an empty mask, and acknowledging its
    /// placeholder `ack` value would be wrong.
    pub fn seqs(self) -> impl Iterator<Item = Seq> {
        (0..32u16).filter_map(move |i| {
            if self.bits & shl(1, u32::from(i)) == 0 {
                None
            } else {
                Some(self.ack - Seq(i))
            }
        })
    }
}

fn shl(n: u32, by: u32) -> u32 {
    // if None, then `by >= 32`, and all bits get shifted out anyway
    n.checked_shl(by).unwrap_or_default()
}
