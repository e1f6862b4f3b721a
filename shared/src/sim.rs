//! Network condition simulation for testing the netcode under loss and
//! latency.
//!
//! The simulator is a send-path policy, not a socket wrapper: the owning
//! loop offers every outbound datagram to [`NetworkSimulator::enqueue`] and
//! periodically drains [`NetworkSimulator::drain_ready`] onto the real
//! socket. Datagrams are dropped with probability `loss_rate`; survivors are
//! delayed by a uniform draw from `[latency * 0.5, latency * 1.5]`. Delivery
//! is FIFO among datagrams that become ready at the same instant, so the
//! simulator never reorders beyond what the delay distribution produces.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Debug)]
struct DelayedDatagram {
    deliver_at: Instant,
    id: u64,
    data: Vec<u8>,
    addr: SocketAddr,
}

impl PartialEq for DelayedDatagram {
    fn eq(&self, other: &Self) -> bool {
        self.deliver_at == other.deliver_at && self.id == other.id
    }
}

impl Eq for DelayedDatagram {}

impl PartialOrd for DelayedDatagram {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedDatagram {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for a min-heap; the id tiebreak keeps equal-delay
        // datagrams FIFO.
        (other.deliver_at, other.id).cmp(&(self.deliver_at, self.id))
    }
}

/// Injects loss and delay on the send path.
#[derive(Debug)]
pub struct NetworkSimulator {
    loss_rate: f64,
    min_latency: Duration,
    max_latency: Duration,
    queue: BinaryHeap<DelayedDatagram>,
    next_id: u64,
    rng: StdRng,
}

impl NetworkSimulator {
    /// Creates a simulator with the given loss rate and base latency. The
    /// actual delay per datagram varies between half and one and a half
    /// times the base.
    pub fn new(loss_rate: f64, latency: Duration) -> Self {
        Self::from_rng(loss_rate, latency, StdRng::from_entropy())
    }

    /// Deterministic variant for tests.
    pub fn with_seed(loss_rate: f64, latency: Duration, seed: u64) -> Self {
        Self::from_rng(loss_rate, latency, StdRng::seed_from_u64(seed))
    }

    fn from_rng(loss_rate: f64, latency: Duration, rng: StdRng) -> Self {
        Self {
            loss_rate,
            min_latency: latency.mul_f64(0.5),
            max_latency: latency.mul_f64(1.5),
            queue: BinaryHeap::new(),
            next_id: 0,
            rng,
        }
    }

    /// Offers a datagram to the simulated link. Dropped datagrams vanish
    /// here; survivors become available from [`Self::drain_ready`] once
    /// their delay elapses.
    pub fn enqueue(&mut self, data: Vec<u8>, addr: SocketAddr) {
        if self.loss_rate > 0.0 && self.rng.gen::<f64>() < self.loss_rate {
            return;
        }

        let delay = if self.max_latency.is_zero() {
            Duration::ZERO
        } else {
            let min = self.min_latency.as_secs_f64();
            let max = self.max_latency.as_secs_f64();
            Duration::from_secs_f64(self.rng.gen_range(min..=max))
        };

        let id = self.next_id;
        self.next_id += 1;
        self.queue.push(DelayedDatagram {
            deliver_at: Instant::now() + delay,
            id,
            data,
            addr,
        });
    }

    /// Takes every datagram whose delay has elapsed, in delivery order.
    pub fn drain_ready(&mut self) -> Vec<(Vec<u8>, SocketAddr)> {
        let now = Instant::now();
        let mut ready = Vec::new();
        while let Some(head) = self.queue.peek() {
            if head.deliver_at > now {
                break;
            }
            let datagram = self.queue.pop().expect("peeked entry present");
            ready.push((datagram.data, datagram.addr));
        }
        ready
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}
