//! Server network layer: UDP socket ownership and the fixed-rate tick loop.
//!
//! A spawned receiver task pushes raw datagrams into a bounded channel; the
//! tick loop drains that channel with bounded work, simulates, broadcasts,
//! and expires silent clients. The tick loop is the sole mutator of game
//! state, so a slow or dead client can never stall it, and nothing a peer
//! sends can crash it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

use shared::ack::AckTracker;
use shared::metrics::MetricsLogger;
use shared::packet::{decode_input_batch, InputFrame, Packet, PacketType};
use shared::reliable::ReliableEvent;
use shared::sim::NetworkSimulator;
use shared::{CLIENT_TIMEOUT, MAX_PACKETS_PER_TICK};

use crate::client_manager::ClientManager;
use crate::game::WorldState;

const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Received reliable events are buffered for the application layer up to
/// this many entries; older ones are discarded first.
const EVENT_BUFFER_LIMIT: usize = 1024;

/// Authoritative game server: socket, world, clients, and instrumentation.
pub struct Server {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    packet_tx: mpsc::Sender<(Vec<u8>, SocketAddr)>,
    packet_rx: mpsc::Receiver<(Vec<u8>, SocketAddr)>,

    world: WorldState,
    clients: ClientManager,
    metrics: MetricsLogger,
    net_sim: Option<NetworkSimulator>,

    tick_rate: u32,
    tick_duration: Duration,
    dt: f32,

    /// Reliable events received from clients, awaiting the application.
    events: Vec<(u8, Vec<u8>)>,

    total_bytes_sent: u64,
    total_bytes_recv: u64,
}

impl Server {
    /// Binds the server socket. A tick rate of zero or a failed bind is a
    /// fatal misconfiguration reported to the caller.
    pub async fn new(
        addr: &str,
        tick_rate: u32,
        loss: f64,
        latency: f64,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        if tick_rate == 0 {
            return Err("tick rate must be positive".into());
        }

        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        let (packet_tx, packet_rx) = mpsc::channel(MAX_PACKETS_PER_TICK);

        let net_sim = if loss > 0.0 || latency > 0.0 {
            Some(NetworkSimulator::new(loss, Duration::from_secs_f64(latency)))
        } else {
            None
        };

        Ok(Self {
            socket,
            local_addr,
            packet_tx,
            packet_rx,
            world: WorldState::new(),
            clients: ClientManager::new(),
            metrics: MetricsLogger::new(),
            net_sim,
            tick_rate,
            tick_duration: Duration::from_secs_f64(1.0 / f64::from(tick_rate)),
            dt: 1.0 / tick_rate as f32,
            events: Vec::new(),
            total_bytes_sent: 0,
            total_bytes_recv: 0,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Hands reliable events received from clients to the application layer.
    pub fn drain_events(&mut self) -> Vec<(u8, Vec<u8>)> {
        std::mem::take(&mut self.events)
    }

    /// Sends a reliable event to one client. The payload is retransmitted
    /// until acked or the retry budget runs out. Returns false for unknown
    /// clients.
    pub fn queue_reliable_event(&mut self, client_id: u8, payload: Vec<u8>) -> bool {
        let Some(client) = self.clients.get_mut(client_id) else {
            return false;
        };

        let sequence = client.ack.next_sequence();
        let packet = Packet::new(
            PacketType::ReliableEvent,
            sequence,
            client.ack.remote_sequence(),
            client.ack.receive_bits(),
            payload.clone(),
        );
        client.ack.on_packet_sent(sequence);
        client.reliable.stage(sequence, ReliableEvent::new(payload));

        let data = packet.encode();
        client.bytes_sent += data.len() as u64;
        let addr = client.addr;
        self.send_raw(data, addr);
        true
    }

    /// Spawns the task that forwards datagrams from the socket into the
    /// bounded tick-loop channel.
    fn spawn_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let packet_tx = self.packet_tx.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; shared::DEFAULT_BUFFER_SIZE];
            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        if packet_tx.try_send((buffer[..len].to_vec(), addr)).is_err() {
                            debug!("receive queue full, dropping datagram from {}", addr);
                        }
                    }
                    Err(e) => {
                        error!("error receiving datagram: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Main server loop at a fixed tick rate. Tick overrun is tolerated: a
    /// late tick fires immediately and lost time is not caught up.
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.spawn_receiver();

        let mut ticker = interval(self.tick_duration);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        let mut last_stats = Instant::now();
        info!(
            "server listening on {} @ {} Hz (dt {:.4}s)",
            self.local_addr, self.tick_rate, self.dt
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let tick_start = Instant::now();

                    self.drain_packets();
                    self.simulate_tick();
                    self.broadcast_snapshots();
                    self.expire_clients();
                    self.flush_sim();

                    let duration_ms = tick_start.elapsed().as_secs_f64() * 1000.0;
                    self.metrics.log_tick_time(self.world.tick, duration_ms);

                    if last_stats.elapsed() >= STATS_INTERVAL {
                        info!(
                            "tick {} | clients: {} | sent: {:.1} KB | recv: {:.1} KB",
                            self.world.tick,
                            self.clients.len(),
                            self.total_bytes_sent as f64 / 1024.0,
                            self.total_bytes_recv as f64 / 1024.0,
                        );
                        last_stats = Instant::now();
                    }
                }
                _ = &mut ctrl_c => {
                    info!("shutting down");
                    break;
                }
            }
        }

        self.shutdown();
        Ok(())
    }

    /// Drains the receive channel with bounded work per tick.
    fn drain_packets(&mut self) {
        for _ in 0..MAX_PACKETS_PER_TICK {
            match self.packet_rx.try_recv() {
                Ok((data, addr)) => self.handle_datagram(&data, addr),
                Err(_) => break,
            }
        }
    }

    fn handle_datagram(&mut self, data: &[u8], addr: SocketAddr) {
        self.total_bytes_recv += data.len() as u64;

        let packet = match Packet::decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("dropping malformed datagram from {}: {}", addr, e);
                return;
            }
        };
        let Some(kind) = packet.kind() else {
            return;
        };

        match kind {
            PacketType::ConnectReq => self.handle_connect(addr),
            PacketType::Input => self.handle_input(&packet, addr),
            PacketType::Ping => self.handle_ping(&packet, addr),
            PacketType::Disconnect => self.handle_disconnect(addr),
            PacketType::Heartbeat => {} // last-heard update below suffices
            PacketType::ReliableEvent => self.handle_reliable_event(&packet, addr),
            PacketType::ConnectAck | PacketType::Snapshot | PacketType::Pong => {
                debug!("unexpected {:?} from client at {}", kind, addr);
            }
        }

        // Common per-packet bookkeeping for known clients.
        if let Some(client) = self.clients.by_addr_mut(addr) {
            client.touch();
            client.bytes_received += data.len() as u64;
            client.ack.on_packet_received(packet.sequence);
            if packet.ack != 0 {
                let confirmed = client.ack.on_ack_received(packet.ack, packet.ack_bits);
                client.reliable.on_acked(&confirmed);
            }
        }
    }

    fn handle_connect(&mut self, addr: SocketAddr) {
        if let Some(id) = self.clients.id_by_addr(addr) {
            // The first CONNECT_ACK may have been lost; answer again.
            self.send_connect_ack(id, addr);
            return;
        }

        match self.clients.add_client(addr) {
            Some(id) => {
                self.world.add_entity(id);
                self.send_connect_ack(id, addr);
            }
            None => {
                debug!("ignoring connection from {}: server full", addr);
            }
        }
    }

    fn send_connect_ack(&mut self, id: u8, addr: SocketAddr) {
        let packet = Packet::new(PacketType::ConnectAck, 0, 0, 0, vec![id]);
        self.send_raw(packet.encode(), addr);
    }

    fn handle_input(&mut self, packet: &Packet, addr: SocketAddr) {
        let Some(client) = self.clients.by_addr_mut(addr) else {
            return;
        };

        match decode_input_batch(&packet.payload) {
            Ok(frames) => {
                for frame in frames {
                    client.queue_input(frame);
                }
            }
            Err(e) => debug!("bad input payload from client {}: {}", client.id, e),
        }
    }

    fn handle_ping(&mut self, packet: &Packet, addr: SocketAddr) {
        // Echo the timestamp verbatim, acking the ping's sequence.
        let pong = Packet::new(
            PacketType::Pong,
            0,
            packet.sequence,
            0,
            packet.payload.clone(),
        );
        self.send_raw(pong.encode(), addr);
    }

    fn handle_disconnect(&mut self, addr: SocketAddr) {
        if let Some(id) = self.clients.id_by_addr(addr) {
            self.world.remove_entity(id);
            self.clients.remove_client(id);
        }
    }

    fn handle_reliable_event(&mut self, packet: &Packet, addr: SocketAddr) {
        let Some(id) = self.clients.id_by_addr(addr) else {
            return;
        };
        debug!(
            "reliable event from client {} ({} bytes)",
            id,
            packet.payload.len()
        );
        if self.events.len() >= EVENT_BUFFER_LIMIT {
            warn!("event buffer full, discarding oldest");
            self.events.remove(0);
        }
        self.events.push((id, packet.payload.clone()));
    }

    /// One simulation step: newest queued input per client wins, applied in
    /// client id order, then the world tick advances.
    fn simulate_tick(&mut self) {
        let mut applied: Vec<(u8, InputFrame)> = Vec::new();
        for client in self.clients.iter_mut() {
            if let Some(frame) = client.take_latest_input() {
                client.mark_processed(frame.sequence);
                applied.push((client.id, frame));
            }
        }
        for (id, frame) in &applied {
            self.world.apply_input(*id, frame, self.dt);
        }

        self.world.tick = self.world.tick.wrapping_add(1);
    }

    /// Builds one snapshot and sends it to every client with that client's
    /// own sequence and piggybacked acks. Reliable payloads whose carriers
    /// were reported lost go out again first.
    fn broadcast_snapshots(&mut self) {
        if self.clients.is_empty() {
            return;
        }

        let snapshot = self.world.snapshot();
        let trailer = self.clients.ack_trailer();
        let payload = snapshot.encode_with_acks(&trailer);

        let mut outgoing: Vec<(Vec<u8>, SocketAddr)> = Vec::new();
        for client in self.clients.iter_mut() {
            let lost = client.ack.inferred_lost();
            if !lost.is_empty() {
                debug!("client {}: {} sequences inferred lost", client.id, lost.len());
                for event in client.reliable.take_lost(&lost) {
                    let (sequence, data) = Self::frame_packet(
                        &mut client.ack,
                        PacketType::ReliableEvent,
                        event.payload.clone(),
                    );
                    client.reliable.stage(sequence, event);
                    client.bytes_sent += data.len() as u64;
                    outgoing.push((data, client.addr));
                }
            }

            let (_, data) =
                Self::frame_packet(&mut client.ack, PacketType::Snapshot, payload.clone());
            client.bytes_sent += data.len() as u64;
            outgoing.push((data, client.addr));
        }

        for (data, addr) in outgoing {
            self.send_raw(data, addr);
        }
    }

    /// Encodes a packet under the tracker's next sequence, recording the
    /// send for loss inference. Returns the sequence used and the wire bytes.
    fn frame_packet(ack: &mut AckTracker, kind: PacketType, payload: Vec<u8>) -> (u16, Vec<u8>) {
        let sequence = ack.next_sequence();
        let packet = Packet::new(
            kind,
            sequence,
            ack.remote_sequence(),
            ack.receive_bits(),
            payload,
        );
        ack.on_packet_sent(sequence);
        (sequence, packet.encode())
    }

    fn expire_clients(&mut self) {
        let timed_out = self.clients.check_timeouts(CLIENT_TIMEOUT);
        for id in timed_out {
            self.world.remove_entity(id);
            info!("client {} timed out", id);
        }
    }

    fn send_raw(&mut self, data: Vec<u8>, addr: SocketAddr) {
        self.total_bytes_sent += data.len() as u64;
        match &mut self.net_sim {
            Some(sim) => sim.enqueue(data, addr),
            None => {
                if let Err(e) = self.socket.try_send_to(&data, addr) {
                    // Transient send failures resolve themselves next tick.
                    debug!("send to {} failed: {}", addr, e);
                }
            }
        }
    }

    /// Sends datagrams whose simulated delay has elapsed.
    fn flush_sim(&mut self) {
        let Some(sim) = &mut self.net_sim else {
            return;
        };
        for (data, addr) in sim.drain_ready() {
            if let Err(e) = self.socket.try_send_to(&data, addr) {
                debug!("send to {} failed: {}", addr, e);
            }
        }
    }

    /// Best-effort goodbye to every client, then metrics flush.
    fn shutdown(&mut self) {
        let goodbye = Packet::new(PacketType::Disconnect, 0, 0, 0, Vec::new()).encode();
        for addr in self.clients.addrs() {
            let _ = self.socket.try_send_to(&goodbye, addr);
        }

        if let Err(e) = self.metrics.save("server_metrics.json") {
            warn!("failed to save metrics: {}", e);
        }
        info!("metrics summary: {:?}", self.metrics.summary());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use shared::packet::{encode_input_batch, sequence_newer_u16};
    use shared::PLAYER_SPEED;

    async fn test_server() -> Server {
        Server::new("127.0.0.1:0", 20, 0.0, 0.0).await.unwrap()
    }

    fn test_addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn connect_datagram() -> Vec<u8> {
        Packet::new(PacketType::ConnectReq, 0, 0, 0, Vec::new()).encode()
    }

    fn input_datagram(frames: &[InputFrame]) -> Vec<u8> {
        Packet::new(PacketType::Input, 0, 0, 0, encode_input_batch(frames)).encode()
    }

    fn frame(sequence: u32, move_x: f32, move_y: f32) -> InputFrame {
        InputFrame {
            sequence,
            move_x,
            move_y,
            actions: 0,
        }
    }

    #[tokio::test]
    async fn zero_tick_rate_is_fatal() {
        assert!(Server::new("127.0.0.1:0", 0, 0.0, 0.0).await.is_err());
    }

    #[tokio::test]
    async fn connect_allocates_client_and_entity() {
        let mut server = test_server().await;
        server.handle_datagram(&connect_datagram(), test_addr(4001));

        assert_eq!(server.clients.len(), 1);
        assert!(server.world.entities.contains_key(&1));

        // A retried CONNECT_REQ from the same address allocates nothing new.
        server.handle_datagram(&connect_datagram(), test_addr(4001));
        assert_eq!(server.clients.len(), 1);

        server.handle_datagram(&connect_datagram(), test_addr(4002));
        assert_eq!(server.clients.len(), 2);
        assert!(server.world.entities.contains_key(&2));
    }

    #[tokio::test]
    async fn latest_input_wins_within_a_tick() {
        let mut server = test_server().await;
        server.handle_datagram(&connect_datagram(), test_addr(4001));
        let spawn_x = server.world.entities.get(&1).unwrap().x;

        let frames = [frame(1, 1.0, 0.0), frame(2, 1.0, 0.0), frame(3, 1.0, 0.0)];
        server.handle_datagram(&input_datagram(&frames), test_addr(4001));
        server.simulate_tick();

        // Only the newest input is applied; older ones are discarded.
        let entity = server.world.entities.get(&1).unwrap();
        assert_approx_eq!(entity.x, spawn_x + PLAYER_SPEED * server.dt, 1e-4);

        let client = server.clients.get_mut(1).unwrap();
        assert_eq!(client.last_processed_input_seq, 3);
        assert!(client.pending_inputs.is_empty());
    }

    #[tokio::test]
    async fn stale_inputs_are_discarded() {
        let mut server = test_server().await;
        server.handle_datagram(&connect_datagram(), test_addr(4001));

        server.handle_datagram(&input_datagram(&[frame(5, 1.0, 0.0)]), test_addr(4001));
        server.simulate_tick();
        let x_after = server.world.entities.get(&1).unwrap().x;

        // Redundant copies of already-processed inputs change nothing.
        server.handle_datagram(
            &input_datagram(&[frame(3, -1.0, 0.0), frame(4, -1.0, 0.0), frame(5, -1.0, 0.0)]),
            test_addr(4001),
        );
        server.simulate_tick();
        assert_eq!(server.world.entities.get(&1).unwrap().x, x_after);
        assert_eq!(
            server.clients.get_mut(1).unwrap().last_processed_input_seq,
            5
        );
    }

    #[tokio::test]
    async fn malformed_datagrams_are_ignored() {
        let mut server = test_server().await;

        server.handle_datagram(b"not a packet", test_addr(4001));
        server.handle_datagram(&[], test_addr(4001));

        let mut bad_magic = connect_datagram();
        bad_magic[0] = 0;
        server.handle_datagram(&bad_magic, test_addr(4001));

        let mut unknown_type = connect_datagram();
        unknown_type[12] = 0x7E;
        server.handle_datagram(&unknown_type, test_addr(4001));

        assert!(server.clients.is_empty());

        // The loop still works afterwards.
        server.handle_datagram(&connect_datagram(), test_addr(4001));
        assert_eq!(server.clients.len(), 1);
    }

    #[tokio::test]
    async fn disconnect_removes_client_and_entity() {
        let mut server = test_server().await;
        server.handle_datagram(&connect_datagram(), test_addr(4001));
        assert_eq!(server.clients.len(), 1);

        let bye = Packet::new(PacketType::Disconnect, 0, 0, 0, Vec::new()).encode();
        server.handle_datagram(&bye, test_addr(4001));
        assert!(server.clients.is_empty());
        assert!(server.world.entities.is_empty());

        server.simulate_tick();
        assert!(server.world.snapshot().entities.is_empty());
    }

    #[tokio::test]
    async fn tick_counter_is_strictly_monotonic() {
        let mut server = test_server().await;
        let mut last = server.world.tick;
        for _ in 0..5 {
            server.simulate_tick();
            assert!(server.world.tick > last);
            last = server.world.tick;
        }
    }

    #[tokio::test]
    async fn reliable_events_from_clients_are_buffered() {
        let mut server = test_server().await;
        server.handle_datagram(&connect_datagram(), test_addr(4001));

        let event = Packet::new(PacketType::ReliableEvent, 1, 0, 0, vec![0xAA, 0xBB]).encode();
        server.handle_datagram(&event, test_addr(4001));

        let events = server.drain_events();
        assert_eq!(events, vec![(1, vec![0xAA, 0xBB])]);
        assert!(server.drain_events().is_empty());
    }

    #[tokio::test]
    async fn reliable_event_to_unknown_client_is_rejected() {
        let mut server = test_server().await;
        assert!(!server.queue_reliable_event(7, vec![1]));
    }

    #[tokio::test]
    async fn lost_reliable_events_are_retransmitted() {
        let mut server = test_server().await;
        // Capture outbound datagrams instead of handing them to the socket.
        server.net_sim = Some(NetworkSimulator::with_seed(0.0, Duration::ZERO, 1));

        server.handle_datagram(&connect_datagram(), test_addr(4001));
        assert!(server.queue_reliable_event(1, vec![0xEE]));
        let carrier = server.clients.get_mut(1).unwrap().ack.local_sequence();
        assert_eq!(carrier, 1);

        // Forty snapshot broadcasts push the outbound sequence far past the
        // event's carrier.
        for _ in 0..40 {
            server.simulate_tick();
            server.broadcast_snapshots();
        }
        let latest = server.clients.get_mut(1).unwrap().ack.local_sequence();

        // The client acks a recent snapshot but never the carrier, which
        // has now fallen off the 32-slot ack window.
        let ack_only_latest =
            Packet::new(PacketType::Heartbeat, 1, latest, 0, Vec::new()).encode();
        server.handle_datagram(&ack_only_latest, test_addr(4001));

        // Discard everything sent so far; the next broadcast must carry the
        // retransmission under a fresh sequence.
        server.net_sim.as_mut().unwrap().drain_ready();
        server.simulate_tick();
        server.broadcast_snapshots();

        let resent: Vec<Packet> = server
            .net_sim
            .as_mut()
            .unwrap()
            .drain_ready()
            .into_iter()
            .map(|(data, _)| Packet::decode(&data).unwrap())
            .filter(|p| p.kind() == Some(PacketType::ReliableEvent))
            .collect();
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].payload, vec![0xEE]);
        assert!(sequence_newer_u16(resent[0].sequence, carrier));

        // Still in flight under the new carrier until the client acks it.
        assert_eq!(server.clients.get_mut(1).unwrap().reliable.in_flight(), 1);
    }
}
