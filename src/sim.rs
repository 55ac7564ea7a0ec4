//! See [`NetworkSimulator`].

use std::{io, net::SocketAddr};

use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::trace;
use web_time::{Duration, Instant};

use crate::io::{Clock, DatagramSocket, SystemClock};

/// Configuration for a [`NetworkSimulator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatorConfig {
    /// Base one-way delay added to every packet.
    pub latency: Duration,
    /// Uniform ± range applied on top of the latency.
    pub jitter: Duration,
    /// Chance (0-100) a packet is discarded at release time.
    pub loss_pct: u8,
    /// Chance (0-100) one random bit of the packet is flipped.
    pub corrupt_pct: u8,
    /// Chance (0-100) extra copies of the packet are delivered.
    pub dup_pct: u8,
    /// Fewest extra copies when duplication triggers.
    pub dup_min: u32,
    /// Most extra copies when duplication triggers.
    pub dup_max: u32,
    /// In-flight packet pool size; sends beyond it are silently dropped.
    pub capacity: usize,
    /// RNG seed. The same seed over the same traffic reproduces the same
    /// loss, corruption, duplication and jitter decisions.
    pub seed: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            latency: Duration::ZERO,
            jitter: Duration::ZERO,
            loss_pct: 0,
            corrupt_pct: 0,
            dup_pct: 0,
            dup_min: 1,
            dup_max: 1,
            capacity: 256,
            seed: 0,
        }
    }
}

impl SimulatorConfig {
    /// Sets [`SimulatorConfig::latency`] on this value.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Sets [`SimulatorConfig::jitter`] on this value.
    #[must_use]
    pub const fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Sets [`SimulatorConfig::loss_pct`] on this value.
    #[must_use]
    pub const fn with_loss_pct(mut self, loss_pct: u8) -> Self {
        self.loss_pct = loss_pct;
        self
    }

    /// Sets [`SimulatorConfig::corrupt_pct`] on this value.
    #[must_use]
    pub const fn with_corrupt_pct(mut self, corrupt_pct: u8) -> Self {
        self.corrupt_pct = corrupt_pct;
        self
    }

    /// Sets duplication: `dup_pct` chance of `dup_min..=dup_max` extra
    /// copies.
    #[must_use]
    pub const fn with_duplication(mut self, dup_pct: u8, dup_min: u32, dup_max: u32) -> Self {
        self.dup_pct = dup_pct;
        self.dup_min = dup_min;
        self.dup_max = dup_max;
        self
    }

    /// Sets [`SimulatorConfig::capacity`] on this value.
    #[must_use]
    pub const fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Sets [`SimulatorConfig::seed`] on this value.
    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Counters for what the simulator has done to traffic so far.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimulatorStats {
    /// Packets dropped because the in-flight pool was exhausted.
    pub pool_exhausted: usize,
    /// Packets discarded by the loss draw.
    pub lost: usize,
    /// Packets that had a bit flipped.
    pub corrupted: usize,
    /// Extra copies delivered by the duplication draw.
    pub duplicated: usize,
    /// Deliveries handed to the inner socket, duplicates included.
    pub delivered: usize,
}

/// One pooled in-flight packet. Lives on either the free list or the live
/// list, linked by slot index.
#[derive(Debug)]
struct Slot {
    bytes: Vec<u8>,
    to: SocketAddr,
    /// Set while the slot is in flight; [`None`] while free.
    release_at: Option<Instant>,
    next: Option<usize>,
}

/// Link emulator sitting between a transport and its real socket.
///
/// Intercepts outgoing datagrams, holds each in a bounded pool until its
/// scheduled release, then drops, corrupts, or duplicates it before handing
/// it to the inner socket. Receives pass straight through. **Testing only**:
/// this is a harness for exercising the protocol under adverse links, not
/// part of the protocol.
///
/// All behavior is deterministic given [`SimulatorConfig::seed`] and the
/// clock. [`NetworkSimulator::flush`] must be called from the thread that
/// owns the transport, since it invokes the real send path.
#[derive(Debug)]
pub struct NetworkSimulator<S, C = SystemClock> {
    inner: S,
    clock: C,
    config: SimulatorConfig,
    rng: StdRng,
    slots: Vec<Slot>,
    free: Option<usize>,
    live: Option<usize>,
    stats: SimulatorStats,
}

impl<S> NetworkSimulator<S> {
    /// Creates a simulator over `inner` using the system clock.
    #[must_use]
    pub fn new(inner: S, config: SimulatorConfig) -> Self {
        Self::with_clock(inner, config, SystemClock)
    }
}

impl<S, C> NetworkSimulator<S, C> {
    /// Creates a simulator over `inner` driven by `clock`.
    ///
    /// # Panics
    ///
    /// Panics if `dup_min > dup_max`.
    #[must_use]
    pub fn with_clock(inner: S, config: SimulatorConfig, clock: C) -> Self {
        assert!(config.dup_min <= config.dup_max);
        let slots = (0..config.capacity)
            .map(|i| Slot {
                bytes: Vec::new(),
                to: SocketAddr::from(([0, 0, 0, 0], 0)),
                release_at: None,
                next: (i + 1 < config.capacity).then_some(i + 1),
            })
            .collect();
        Self {
            inner,
            clock,
            rng: StdRng::seed_from_u64(config.seed),
            free: (config.capacity > 0).then_some(0),
            live: None,
            slots,
            config,
            stats: SimulatorStats::default(),
        }
    }

    /// Gets the wrapped socket.
    pub const fn inner(&self) -> &S {
        &self.inner
    }

    /// Gets the counters of simulated mischief.
    #[must_use]
    pub const fn stats(&self) -> SimulatorStats {
        self.stats
    }

    fn schedule(&mut self, now: Instant) -> Instant {
        let jitter_ms = i64::try_from(self.config.jitter.as_millis()).unwrap_or(i64::MAX);
        let offset = if jitter_ms == 0 {
            0
        } else {
            self.rng.gen_range(-jitter_ms..=jitter_ms)
        };
        let delay_ms = i64::try_from(self.config.latency.as_millis())
            .unwrap_or(i64::MAX)
            .saturating_add(offset)
            .max(0);
        #[allow(clippy::cast_sign_loss)]
        let delay = Duration::from_millis(delay_ms as u64);
        now + delay
    }
}

impl<S: DatagramSocket, C: Clock> NetworkSimulator<S, C> {
    /// Releases every in-flight packet due at `now`, applying the
    /// loss/corruption/duplication draws and handing survivors to the inner
    /// socket. Returns how many deliveries were made.
    ///
    /// # Errors
    ///
    /// Errors if the inner socket fails.
    pub fn flush(&mut self, now: Instant) -> io::Result<usize> {
        let mut delivered = 0;
        let mut prev: Option<usize> = None;
        let mut cur = self.live;
        while let Some(i) = cur {
            let next = self.slots[i].next;
            let due = self.slots[i].release_at.is_some_and(|at| at <= now);
            if !due {
                prev = cur;
                cur = next;
                continue;
            }

            // unlink from the live list before any fallible work
            match prev {
                Some(p) => self.slots[p].next = next,
                None => self.live = next,
            }

            if self.rng.gen_range(0..100u8) < self.config.loss_pct {
                self.stats.lost += 1;
            } else {
                if self.rng.gen_range(0..100u8) < self.config.corrupt_pct
                    && !self.slots[i].bytes.is_empty()
                {
                    let bit = self.rng.gen_range(0..self.slots[i].bytes.len() * 8);
                    self.slots[i].bytes[bit / 8] ^= 1 << (bit % 8);
                    self.stats.corrupted += 1;
                }
                let copies = if self.rng.gen_range(0..100u8) < self.config.dup_pct {
                    let extra = self.rng.gen_range(self.config.dup_min..=self.config.dup_max);
                    self.stats.duplicated += extra as usize;
                    1 + extra
                } else {
                    1
                };
                for _ in 0..copies {
                    self.inner.send_to(&self.slots[i].bytes, self.slots[i].to)?;
                    self.stats.delivered += 1;
                    delivered += 1;
                }
            }

            self.slots[i].release_at = None;
            self.slots[i].next = self.free;
            self.free = Some(i);
            cur = next;
        }
        Ok(delivered)
    }
}

impl<S: DatagramSocket, C: Clock> DatagramSocket for NetworkSimulator<S, C> {
    /// Intercepts a send: the datagram goes into the in-flight pool instead
    /// of onto the wire, to be released by [`NetworkSimulator::flush`].
    ///
    /// A full pool drops the datagram silently (`Ok(false)`) - backpressure
    /// the protocol must already survive, since the real network drops
    /// packets too.
    fn send_to(&mut self, bytes: &[u8], to: SocketAddr) -> io::Result<bool> {
        let now = self.clock.now();
        let Some(i) = self.free else {
            self.stats.pool_exhausted += 1;
            trace!("in-flight pool exhausted, dropping packet");
            return Ok(false);
        };
        let release_at = self.schedule(now);
        self.free = self.slots[i].next;
        let slot = &mut self.slots[i];
        slot.bytes.clear();
        slot.bytes.extend_from_slice(bytes);
        slot.to = to;
        slot.release_at = Some(release_at);
        slot.next = self.live;
        self.live = Some(i);
        Ok(true)
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        self.inner.recv_from(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{memory_pair, ManualClock, MemorySocket};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn pair_with(
        config: SimulatorConfig,
    ) -> (
        NetworkSimulator<MemorySocket, ManualClock>,
        MemorySocket,
        ManualClock,
    ) {
        let (a, b) = memory_pair(addr(1), addr(2));
        let clock = ManualClock::new(Instant::now());
        let sim = NetworkSimulator::with_clock(a, config, clock.clone());
        (sim, b, clock)
    }

    fn drain(socket: &mut MemorySocket) -> Vec<Vec<u8>> {
        let mut buf = [0u8; 64];
        let mut out = Vec::new();
        while let Ok(Some((len, _))) = socket.recv_from(&mut buf) {
            out.push(buf[..len].to_vec());
        }
        out
    }

    #[test]
    fn passthrough_with_default_config() {
        let (mut sim, mut b, clock) = pair_with(SimulatorConfig::default());
        assert!(sim.send_to(b"hello", addr(2)).unwrap());
        // nothing reaches the wire until flush
        assert!(drain(&mut b).is_empty());

        sim.flush(clock.now()).unwrap();
        assert_eq!(vec![b"hello".to_vec()], drain(&mut b));
    }

    #[test]
    fn latency_holds_packets_until_due() {
        let config = SimulatorConfig::default().with_latency(Duration::from_millis(50));
        let (mut sim, mut b, clock) = pair_with(config);
        sim.send_to(b"later", addr(2)).unwrap();

        sim.flush(clock.now()).unwrap();
        assert!(drain(&mut b).is_empty());

        clock.advance(Duration::from_millis(49));
        sim.flush(clock.now()).unwrap();
        assert!(drain(&mut b).is_empty());

        clock.advance(Duration::from_millis(1));
        sim.flush(clock.now()).unwrap();
        assert_eq!(1, drain(&mut b).len());
    }

    #[test]
    fn total_loss_discards_everything() {
        let config = SimulatorConfig::default().with_loss_pct(100);
        let (mut sim, mut b, clock) = pair_with(config);
        for _ in 0..10 {
            sim.send_to(b"x", addr(2)).unwrap();
        }
        sim.flush(clock.now()).unwrap();
        assert!(drain(&mut b).is_empty());
        assert_eq!(10, sim.stats().lost);
    }

    #[test]
    fn duplication_delivers_extra_copies() {
        let config = SimulatorConfig::default().with_duplication(100, 2, 2);
        let (mut sim, mut b, clock) = pair_with(config);
        sim.send_to(b"dup", addr(2)).unwrap();
        assert_eq!(3, sim.flush(clock.now()).unwrap());
        assert_eq!(3, drain(&mut b).len());
        assert_eq!(2, sim.stats().duplicated);
    }

    #[test]
    fn corruption_flips_exactly_one_bit() {
        let config = SimulatorConfig::default().with_corrupt_pct(100);
        let (mut sim, mut b, clock) = pair_with(config);
        let original = b"payload".to_vec();
        sim.send_to(&original, addr(2)).unwrap();
        sim.flush(clock.now()).unwrap();

        let received = drain(&mut b).remove(0);
        let flipped: u32 = original
            .iter()
            .zip(&received)
            .map(|(a, b)| (a ^ b).count_ones())
            .sum();
        assert_eq!(1, flipped);
    }

    #[test]
    fn pool_exhaustion_drops_silently() {
        let config = SimulatorConfig::default().with_capacity(2);
        let (mut sim, mut b, clock) = pair_with(config);
        assert!(sim.send_to(b"1", addr(2)).unwrap());
        assert!(sim.send_to(b"2", addr(2)).unwrap());
        assert!(!sim.send_to(b"3", addr(2)).unwrap());
        assert_eq!(1, sim.stats().pool_exhausted);

        // flushing recycles the pool
        sim.flush(clock.now()).unwrap();
        assert_eq!(2, drain(&mut b).len());
        assert!(sim.send_to(b"4", addr(2)).unwrap());
    }

    #[test]
    fn deterministic_given_seed() {
        let config = SimulatorConfig::default()
            .with_loss_pct(50)
            .with_seed(42);
        let run = |config: SimulatorConfig| {
            let (mut sim, mut b, clock) = pair_with(config);
            for _ in 0..64 {
                sim.send_to(b"x", addr(2)).unwrap();
            }
            sim.flush(clock.now()).unwrap();
            drain(&mut b).len()
        };
        let first = run(config.clone());
        let second = run(config);
        assert_eq!(first, second);
        assert!(first > 0 && first < 64, "loss should be partial");
    }
}
