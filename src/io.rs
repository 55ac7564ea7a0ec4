//! Socket and clock abstractions, and the receive worker thread.
//!
//! Platform specifics live behind two small traits chosen at the
//! composition root: [`DatagramSocket`] for moving datagrams and [`Clock`]
//! for timestamps. The protocol code never touches the OS directly, which
//! also makes it fully drivable from tests.

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    fmt, io,
    net::{SocketAddr, UdpSocket},
    rc::Rc,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration as StdDuration,
};

use ringbuf::{
    traits::{Consumer, Producer, Split},
    HeapCons, HeapRb,
};
use tracing::warn;
use web_time::{Duration, Instant};

use crate::packet::MAX_PACKET_LEN;

/// Non-blocking datagram endpoint.
///
/// Implementations must never block: a receive with nothing pending returns
/// `Ok(None)` immediately.
pub trait DatagramSocket {
    /// Sends one datagram to `to`.
    ///
    /// `Ok(false)` means the datagram was dropped before reaching the wire
    /// (send buffer full, simulator pool exhausted) - expected backpressure,
    /// not a fault.
    ///
    /// # Errors
    ///
    /// Errors only on a genuine socket fault.
    fn send_to(&mut self, bytes: &[u8], to: SocketAddr) -> io::Result<bool>;

    /// Receives one datagram into `buf`, if one is pending.
    ///
    /// # Errors
    ///
    /// Errors only on a genuine socket fault; would-block is `Ok(None)`.
    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;
}

/// [`UdpSocket`] must be put into non-blocking mode by the caller
/// (`set_nonblocking(true)`) before use; bind and configuration failures
/// stay at the composition root.
impl DatagramSocket for UdpSocket {
    fn send_to(&mut self, bytes: &[u8], to: SocketAddr) -> io::Result<bool> {
        match UdpSocket::send_to(self, bytes, to) {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match UdpSocket::recv_from(self, buf) {
            Ok((len, from)) => Ok(Some((len, from))),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// Source of monotonic timestamps.
pub trait Clock {
    /// Gets the current instant.
    fn now(&self) -> Instant;
}

/// The process-wide monotonic clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Manually driven clock for deterministic tests and simulations.
///
/// Clones share the same underlying time, so a clock can be handed to a
/// [`NetworkSimulator`](crate::sim::NetworkSimulator) and advanced from the
/// test body.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Rc<Cell<Instant>>,
}

impl ManualClock {
    /// Creates a clock frozen at `start`.
    #[must_use]
    pub fn new(start: Instant) -> Self {
        Self {
            now: Rc::new(Cell::new(start)),
        }
    }

    /// Moves time forward by `by`, for this clock and all its clones.
    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.now.get()
    }
}

/// One datagram taken off the wire but not yet processed.
#[derive(Debug, Clone)]
pub struct Datagram {
    /// Raw datagram contents.
    pub bytes: Vec<u8>,
    /// Address it arrived from.
    pub from: SocketAddr,
}

/// Default capacity of the [`RecvWorker`] queue, in datagrams.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

const IDLE_SLEEP: StdDuration = StdDuration::from_millis(1);

/// Dedicated receive thread feeding a bounded queue.
///
/// The worker owns its own socket handle and does nothing but pull
/// datagrams off the wire; the owning thread drains the queue with
/// [`RecvWorker::poll`] on its own schedule and feeds each datagram to
/// [`Transport::process`](crate::transport::Transport::process).
///
/// The queue push never blocks the worker: when the queue is full, the
/// datagram is dropped and counted ([`RecvWorker::dropped`]), leaving the
/// queue itself intact. Shutdown flips a shared flag and joins; the worker
/// checks the flag every iteration and sleeps at most 1 ms at a time, so
/// joining never waits on a stuck receive.
pub struct RecvWorker {
    running: Arc<AtomicBool>,
    dropped: Arc<AtomicUsize>,
    queue: HeapCons<Datagram>,
    handle: Option<thread::JoinHandle<()>>,
}

impl fmt::Debug for RecvWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecvWorker")
            .field("running", &self.running)
            .field("dropped", &self.dropped)
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl RecvWorker {
    /// Spawns the worker over its own handle to a socket.
    ///
    /// For UDP, pass a [`try_clone`](UdpSocket::try_clone) of the socket the
    /// transport sends on.
    pub fn spawn<S>(mut socket: S, capacity: usize) -> Self
    where
        S: DatagramSocket + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let dropped = Arc::new(AtomicUsize::new(0));
        let (mut producer, consumer) = HeapRb::<Datagram>::new(capacity).split();

        let handle = thread::spawn({
            let running = Arc::clone(&running);
            let dropped = Arc::clone(&dropped);
            move || {
                let mut buf = [0u8; MAX_PACKET_LEN];
                while running.load(Ordering::Relaxed) {
                    match socket.recv_from(&mut buf) {
                        Ok(Some((len, from))) => {
                            let datagram = Datagram {
                                bytes: buf[..len].to_vec(),
                                from,
                            };
                            if producer.try_push(datagram).is_err() {
                                let total = dropped.fetch_add(1, Ordering::Relaxed) + 1;
                                warn!(total, "receive queue full, dropping datagram");
                            }
                        }
                        Ok(None) => thread::sleep(IDLE_SLEEP),
                        Err(err) => {
                            warn!("socket receive failed: {err}");
                            thread::sleep(IDLE_SLEEP);
                        }
                    }
                }
            }
        });

        Self {
            running,
            dropped,
            queue: consumer,
            handle: Some(handle),
        }
    }

    /// Takes the next queued datagram, if any.
    pub fn poll(&mut self) -> Option<Datagram> {
        self.queue.try_pop()
    }

    /// Total datagrams dropped because the queue was full.
    #[must_use]
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stops and joins the worker thread. Called automatically on drop.
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RecvWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// In-memory datagram endpoint, for tests and examples.
///
/// Created in connected pairs by [`memory_pair`]; sends land in the other
/// endpoint's inbox immediately and in order. Wrap one side in a
/// [`NetworkSimulator`](crate::sim::NetworkSimulator) to get an imperfect
/// link.
#[derive(Debug, Clone)]
pub struct MemorySocket {
    addr: SocketAddr,
    peer: SocketAddr,
    inbox: Rc<RefCell<VecDeque<Datagram>>>,
    peer_inbox: Rc<RefCell<VecDeque<Datagram>>>,
}

impl MemorySocket {
    /// Address this endpoint answers to.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }
}

/// Creates a connected pair of in-memory endpoints with the given
/// addresses.
#[must_use]
pub fn memory_pair(a: SocketAddr, b: SocketAddr) -> (MemorySocket, MemorySocket) {
    let inbox_a = Rc::new(RefCell::new(VecDeque::new()));
    let inbox_b = Rc::new(RefCell::new(VecDeque::new()));
    (
        MemorySocket {
            addr: a,
            peer: b,
            inbox: Rc::clone(&inbox_a),
            peer_inbox: Rc::clone(&inbox_b),
        },
        MemorySocket {
            addr: b,
            peer: a,
            inbox: inbox_b,
            peer_inbox: inbox_a,
        },
    )
}

impl DatagramSocket for MemorySocket {
    fn send_to(&mut self, bytes: &[u8], to: SocketAddr) -> io::Result<bool> {
        debug_assert_eq!(to, self.peer, "memory sockets are connected pairs");
        self.peer_inbox.borrow_mut().push_back(Datagram {
            bytes: bytes.to_vec(),
            from: self.addr,
        });
        Ok(true)
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        let Some(datagram) = self.inbox.borrow_mut().pop_front() else {
            return Ok(None);
        };
        // like a real UDP socket, an undersized buffer truncates
        let len = datagram.bytes.len().min(buf.len());
        buf[..len].copy_from_slice(&datagram.bytes[..len]);
        Ok(Some((len, datagram.from)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn memory_pair_round_trip() {
        let (mut a, mut b) = memory_pair(addr(1), addr(2));
        let mut buf = [0u8; 16];

        assert!(a.send_to(b"ping", addr(2)).unwrap());
        assert!(b.send_to(b"pong", addr(1)).unwrap());

        let (len, from) = b.recv_from(&mut buf).unwrap().unwrap();
        assert_eq!((b"ping".len(), addr(1)), (len, from));
        assert_eq!(b"ping", &buf[..len]);

        let (len, from) = a.recv_from(&mut buf).unwrap().unwrap();
        assert_eq!((b"pong".len(), addr(2)), (len, from));

        assert!(a.recv_from(&mut buf).unwrap().is_none());
    }

    #[test]
    fn manual_clock_shared_between_clones() {
        let clock = ManualClock::new(Instant::now());
        let clone = clock.clone();
        let before = clone.now();
        clock.advance(Duration::from_millis(250));
        assert_eq!(before + Duration::from_millis(250), clone.now());
    }

    #[test]
    fn worker_drains_socket_and_shuts_down() {
        // MemorySocket is not Send; use a thread-safe stand-in
        struct SharedInbox(std::sync::mpsc::Receiver<Datagram>);
        impl DatagramSocket for SharedInbox {
            fn send_to(&mut self, _: &[u8], _: SocketAddr) -> io::Result<bool> {
                Ok(false)
            }
            fn recv_from(
                &mut self,
                buf: &mut [u8],
            ) -> io::Result<Option<(usize, SocketAddr)>> {
                match self.0.try_recv() {
                    Ok(datagram) => {
                        let len = datagram.bytes.len();
                        buf[..len].copy_from_slice(&datagram.bytes);
                        Ok(Some((len, datagram.from)))
                    }
                    Err(_) => Ok(None),
                }
            }
        }

        let (tx, rx) = std::sync::mpsc::channel();
        let mut worker = RecvWorker::spawn(SharedInbox(rx), 8);
        tx.send(Datagram {
            bytes: b"hello".to_vec(),
            from: addr(9),
        })
        .unwrap();

        // bounded wait for the worker to pick the datagram up
        let mut received = None;
        for _ in 0..500 {
            if let Some(datagram) = worker.poll() {
                received = Some(datagram);
                break;
            }
            thread::sleep(StdDuration::from_millis(1));
        }
        let received = received.expect("worker should deliver the datagram");
        assert_eq!(b"hello", &received.bytes[..]);
        assert_eq!(addr(9), received.from);
        assert_eq!(0, worker.dropped());

        worker.shutdown();
    }
}
