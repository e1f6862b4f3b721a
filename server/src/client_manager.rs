//! Client connection management and input queuing for the server.
//!
//! The manager owns every per-client record: address mapping, id assignment
//! in [1, 255], pending input queues, ack tracking, reliable event state,
//! and silence timeouts. All mutation happens from the server tick loop.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use log::info;
use shared::ack::AckTracker;
use shared::packet::{sequence_newer_u32, InputFrame};
use shared::reliable::ReliableChannel;
use shared::MAX_CLIENTS;

/// One connected client and its session state.
#[derive(Debug)]
pub struct ConnectedClient {
    pub id: u8,
    pub addr: SocketAddr,
    /// Last time any packet arrived from this address.
    pub last_heard: Instant,
    /// Highest input sequence applied to the simulation.
    pub last_processed_input_seq: u32,
    /// Inputs waiting for the next tick, keyed by input sequence.
    pub pending_inputs: BTreeMap<u32, InputFrame>,
    pub ack: AckTracker,
    pub reliable: ReliableChannel,

    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl ConnectedClient {
    pub fn new(id: u8, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            last_heard: Instant::now(),
            last_processed_input_seq: 0,
            pending_inputs: BTreeMap::new(),
            ack: AckTracker::new(),
            reliable: ReliableChannel::new(),
            bytes_sent: 0,
            bytes_received: 0,
        }
    }

    /// Updates the last-heard timestamp.
    pub fn touch(&mut self) {
        self.last_heard = Instant::now();
    }

    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_heard.elapsed() > timeout
    }

    /// Queues an input frame unless it was already processed or queued.
    /// Returns true when the frame is new.
    pub fn queue_input(&mut self, frame: InputFrame) -> bool {
        if !sequence_newer_u32(frame.sequence, self.last_processed_input_seq) {
            return false;
        }
        if self.pending_inputs.contains_key(&frame.sequence) {
            return false;
        }
        self.pending_inputs.insert(frame.sequence, frame);
        true
    }

    /// Takes the newest pending input and discards the rest. All queued
    /// inputs are considered applicable this tick and the latest wins.
    pub fn take_latest_input(&mut self) -> Option<InputFrame> {
        let latest = self.pending_inputs.values().next_back().copied();
        self.pending_inputs.clear();
        latest
    }

    /// Advances the processed high-water mark after applying an input.
    pub fn mark_processed(&mut self, sequence: u32) {
        if sequence_newer_u32(sequence, self.last_processed_input_seq) {
            self.last_processed_input_seq = sequence;
        }
    }
}

/// Roster of connected clients, iterated in id order so input application
/// is deterministic across runs.
#[derive(Debug, Default)]
pub struct ClientManager {
    clients: BTreeMap<u8, ConnectedClient>,
    addr_index: HashMap<SocketAddr, u8>,
    next_id: u8,
}

impl ClientManager {
    pub fn new() -> Self {
        Self {
            clients: BTreeMap::new(),
            addr_index: HashMap::new(),
            next_id: 1,
        }
    }

    /// Registers a new client, allocating an unused id in [1, 255]. Returns
    /// `None` when every id is taken; the caller ignores the connection
    /// request silently in that case.
    pub fn add_client(&mut self, addr: SocketAddr) -> Option<u8> {
        if self.clients.len() >= MAX_CLIENTS {
            return None;
        }

        // Scan from the rotating cursor so freed ids get reused eventually.
        // 256 probes cover the whole id space including the skipped 0.
        let mut candidate = self.next_id;
        for _ in 0..=MAX_CLIENTS {
            if candidate != 0 && !self.clients.contains_key(&candidate) {
                break;
            }
            candidate = candidate.wrapping_add(1);
        }
        self.next_id = candidate.wrapping_add(1);

        let client = ConnectedClient::new(candidate, addr);
        info!("client {} connected from {}", candidate, addr);
        self.clients.insert(candidate, client);
        self.addr_index.insert(addr, candidate);
        Some(candidate)
    }

    pub fn remove_client(&mut self, id: u8) -> bool {
        if let Some(client) = self.clients.remove(&id) {
            self.addr_index.remove(&client.addr);
            info!("client {} disconnected", id);
            true
        } else {
            false
        }
    }

    pub fn id_by_addr(&self, addr: SocketAddr) -> Option<u8> {
        self.addr_index.get(&addr).copied()
    }

    pub fn get_mut(&mut self, id: u8) -> Option<&mut ConnectedClient> {
        self.clients.get_mut(&id)
    }

    pub fn by_addr_mut(&mut self, addr: SocketAddr) -> Option<&mut ConnectedClient> {
        let id = self.id_by_addr(addr)?;
        self.clients.get_mut(&id)
    }

    /// Iterates clients in id order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ConnectedClient> {
        self.clients.values_mut()
    }

    /// Addresses of every connected client, for best-effort broadcasts.
    pub fn addrs(&self) -> Vec<SocketAddr> {
        self.clients.values().map(|c| c.addr).collect()
    }

    /// Per-client `(id, last_processed_input_seq)` pairs for the snapshot
    /// trailer, in id order.
    pub fn ack_trailer(&self) -> Vec<(u8, u32)> {
        self.clients
            .values()
            .map(|c| (c.id, c.last_processed_input_seq))
            .collect()
    }

    /// Removes clients that have been silent past the timeout and returns
    /// their ids so the world can drop their entities.
    pub fn check_timeouts(&mut self, timeout: Duration) -> Vec<u8> {
        let timed_out: Vec<u8> = self
            .clients
            .values()
            .filter(|c| c.is_timed_out(timeout))
            .map(|c| c.id)
            .collect();

        for id in &timed_out {
            self.remove_client(*id);
        }
        timed_out
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn frame(sequence: u32) -> InputFrame {
        InputFrame {
            sequence,
            move_x: 0.0,
            move_y: 0.0,
            actions: 0,
        }
    }

    #[test]
    fn ids_start_at_one_and_are_unique() {
        let mut manager = ClientManager::new();
        let a = manager.add_client(addr(9001)).unwrap();
        let b = manager.add_client(addr(9002)).unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(manager.id_by_addr(addr(9001)), Some(1));
        assert_eq!(manager.id_by_addr(addr(9999)), None);
    }

    #[test]
    fn freed_ids_are_reused() {
        let mut manager = ClientManager::new();
        let a = manager.add_client(addr(9001)).unwrap();
        manager.add_client(addr(9002)).unwrap();
        assert!(manager.remove_client(a));

        let c = manager.add_client(addr(9003)).unwrap();
        assert_ne!(c, 0);
        assert_ne!(c, 2);
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn capacity_exhaustion_returns_none() {
        let mut manager = ClientManager::new();
        for port in 0..MAX_CLIENTS as u16 {
            assert!(manager.add_client(addr(10000 + port)).is_some());
        }
        assert_eq!(manager.len(), MAX_CLIENTS);
        assert!(manager.add_client(addr(20000)).is_none());
    }

    #[test]
    fn id_zero_is_never_allocated() {
        let mut manager = ClientManager::new();
        manager.next_id = 0;
        let id = manager.add_client(addr(9001)).unwrap();
        assert_ne!(id, 0);
    }

    #[test]
    fn queue_input_rejects_old_and_duplicate_sequences() {
        let mut client = ConnectedClient::new(1, addr(9001));
        assert!(client.queue_input(frame(1)));
        assert!(!client.queue_input(frame(1)));
        assert!(client.queue_input(frame(3)));

        client.mark_processed(3);
        client.pending_inputs.clear();
        assert!(!client.queue_input(frame(2)));
        assert!(!client.queue_input(frame(3)));
        assert!(client.queue_input(frame(4)));
    }

    #[test]
    fn latest_queued_input_wins() {
        let mut client = ConnectedClient::new(1, addr(9001));
        client.queue_input(frame(4));
        client.queue_input(frame(2));
        client.queue_input(frame(3));

        let applied = client.take_latest_input().unwrap();
        assert_eq!(applied.sequence, 4);
        assert!(client.pending_inputs.is_empty());
        assert!(client.take_latest_input().is_none());
    }

    #[test]
    fn mark_processed_only_advances() {
        let mut client = ConnectedClient::new(1, addr(9001));
        client.mark_processed(10);
        client.mark_processed(5);
        assert_eq!(client.last_processed_input_seq, 10);
    }

    #[test]
    fn timeouts_remove_silent_clients() {
        let mut manager = ClientManager::new();
        let a = manager.add_client(addr(9001)).unwrap();
        let b = manager.add_client(addr(9002)).unwrap();

        manager.get_mut(a).unwrap().last_heard = Instant::now() - Duration::from_secs(10);

        let expired = manager.check_timeouts(Duration::from_secs(5));
        assert_eq!(expired, vec![a]);
        assert_eq!(manager.len(), 1);
        assert!(manager.get_mut(b).is_some());
        assert_eq!(manager.id_by_addr(addr(9001)), None);
    }

    #[test]
    fn ack_trailer_lists_every_client_in_id_order() {
        let mut manager = ClientManager::new();
        let a = manager.add_client(addr(9001)).unwrap();
        let b = manager.add_client(addr(9002)).unwrap();
        manager.get_mut(b).unwrap().mark_processed(42);

        assert_eq!(manager.ack_trailer(), vec![(a, 0), (b, 42)]);
    }
}
