//! Client network loop: non-blocking UDP, redundant input transmission,
//! link-quality measurement, and the local tick scheduler.

use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use shared::ack::AckTracker;
use shared::metrics::MetricsLogger;
use shared::packet::{
    decode_ping_timestamp, encode_input_batch, encode_ping_timestamp, InputFrame, Packet,
    PacketType,
};
use shared::reliable::{ReliableChannel, ReliableEvent};
use shared::sim::NetworkSimulator;
use shared::snapshot::Snapshot;
use shared::{
    CLIENT_TIMEOUT, CONNECT_RETRY_INTERVAL, DEFAULT_BUFFER_SIZE, INPUT_REDUNDANCY,
    MAX_PACKETS_PER_TICK, PING_INTERVAL,
};

use crate::game::ClientWorld;
use crate::input::InputSource;

/// Game client owning the socket and all per-session state.
pub struct GameClient {
    socket: UdpSocket,
    server_addr: SocketAddr,
    tick_duration: Duration,

    pub world: ClientWorld,
    ack: AckTracker,
    reliable: ReliableChannel,
    metrics: MetricsLogger,
    net_sim: Option<NetworkSimulator>,

    client_id: Option<u8>,
    connected: bool,
    input_sequence: u32,

    /// Recent frames for redundant transmission, oldest first.
    redundancy: VecDeque<InputFrame>,
    /// Snapshots received but not yet processed; reconciliation runs on the
    /// tick, not on receipt.
    queued_snapshots: Vec<(Snapshot, u32)>,
    /// Reliable events received from the server.
    events: Vec<Vec<u8>>,

    /// Process-local monotonic epoch for ping timestamps.
    epoch: Instant,
    last_packet_at: Instant,

    total_bytes_sent: u64,
    total_bytes_recv: u64,
    bytes_sent_window: u64,
    bytes_recv_window: u64,
}

impl GameClient {
    /// Creates a client socket bound to an ephemeral port. A tick rate of
    /// zero is a fatal misconfiguration.
    pub fn new(
        server_addr: &str,
        tick_rate: u32,
        loss: f64,
        latency: f64,
    ) -> io::Result<Self> {
        if tick_rate == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "tick rate must be positive",
            ));
        }

        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_nonblocking(true)?;
        let server_addr = resolve_address(server_addr)?;

        let net_sim = if loss > 0.0 || latency > 0.0 {
            Some(NetworkSimulator::new(loss, Duration::from_secs_f64(latency)))
        } else {
            None
        };

        let dt = 1.0 / tick_rate as f32;
        Ok(Self {
            socket,
            server_addr,
            tick_duration: Duration::from_secs_f64(1.0 / f64::from(tick_rate)),
            world: ClientWorld::new(dt),
            ack: AckTracker::new(),
            reliable: ReliableChannel::new(),
            metrics: MetricsLogger::new(),
            net_sim,
            client_id: None,
            connected: false,
            input_sequence: 0,
            redundancy: VecDeque::new(),
            queued_snapshots: Vec::new(),
            events: Vec::new(),
            epoch: Instant::now(),
            last_packet_at: Instant::now(),
            total_bytes_sent: 0,
            total_bytes_recv: 0,
            bytes_sent_window: 0,
            bytes_recv_window: 0,
        })
    }

    pub fn connected(&self) -> bool {
        self.connected
    }

    pub fn client_id(&self) -> Option<u8> {
        self.client_id
    }

    pub fn metrics(&self) -> &MetricsLogger {
        &self.metrics
    }

    /// Reliable events received from the server, for the application layer.
    pub fn drain_events(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.events)
    }

    /// Sends a connection request. Safe to call repeatedly; the server
    /// re-acks known addresses.
    pub fn connect(&mut self) {
        let packet = Packet::new(PacketType::ConnectReq, 0, 0, 0, Vec::new());
        self.send_raw(packet.encode());
        debug!("connection request sent to {}", self.server_addr);
    }

    /// Sends a best-effort disconnect and stops the session.
    pub fn disconnect(&mut self) {
        if self.connected {
            let packet = Packet::new(PacketType::Disconnect, 0, 0, 0, Vec::new());
            self.send_raw(packet.encode());
            self.connected = false;
            info!("disconnected");
        }
    }

    /// One local tick: sample input, predict, send the redundant input
    /// batch, then process queued snapshots.
    pub fn tick(&mut self, move_x: f32, move_y: f32, actions: u8) {
        if self.connected && self.client_id.is_some() {
            self.input_sequence += 1;
            let frame = InputFrame {
                sequence: self.input_sequence,
                move_x,
                move_y,
                actions,
            };

            self.world.predict(frame);

            self.redundancy.push_back(frame);
            while self.redundancy.len() > INPUT_REDUNDANCY * 2 {
                self.redundancy.pop_front();
            }
            self.send_input_batch();
        }

        self.process_queued_snapshots();
    }

    fn send_input_batch(&mut self) {
        let start = self.redundancy.len().saturating_sub(INPUT_REDUNDANCY);
        let frames: Vec<InputFrame> = self.redundancy.iter().skip(start).copied().collect();
        let payload = encode_input_batch(&frames);

        let sequence = self.ack.next_sequence();
        let packet = Packet::new(
            PacketType::Input,
            sequence,
            self.ack.remote_sequence(),
            self.ack.receive_bits(),
            payload,
        );
        self.ack.on_packet_sent(sequence);
        self.send_raw(packet.encode());
    }

    fn process_queued_snapshots(&mut self) {
        if self.queued_snapshots.is_empty() {
            return;
        }
        let mut queued = std::mem::take(&mut self.queued_snapshots);
        queued.sort_by_key(|(snapshot, _)| snapshot.tick);

        for (snapshot, last_processed) in queued {
            self.world.ensure_spawned(&snapshot);
            if let Some(error) = self.world.reconcile(&snapshot, last_processed) {
                if error > 0.01 {
                    self.metrics.log_prediction_error(error);
                }
            }
            self.world.buffer_snapshot(snapshot);
        }
    }

    /// Sends a PING carrying a monotonic timestamp the server echoes back.
    pub fn send_ping(&mut self) {
        let payload = encode_ping_timestamp(self.epoch.elapsed().as_secs_f64());
        let sequence = self.ack.next_sequence();
        let packet = Packet::new(PacketType::Ping, sequence, 0, 0, payload);
        self.ack.on_packet_sent(sequence);
        self.send_raw(packet.encode());
    }

    /// Keeps the session alive through input-free stretches.
    pub fn send_heartbeat(&mut self) {
        let packet = Packet::new(
            PacketType::Heartbeat,
            0,
            self.ack.remote_sequence(),
            self.ack.receive_bits(),
            Vec::new(),
        );
        self.send_raw(packet.encode());
    }

    /// Sends a reliable event; it is retransmitted until the server acks it.
    pub fn send_reliable_event(&mut self, payload: Vec<u8>) {
        let sequence = self.ack.next_sequence();
        let packet = Packet::new(
            PacketType::ReliableEvent,
            sequence,
            self.ack.remote_sequence(),
            self.ack.receive_bits(),
            payload.clone(),
        );
        self.ack.on_packet_sent(sequence);
        self.reliable.stage(sequence, ReliableEvent::new(payload));
        self.send_raw(packet.encode());
    }

    /// Retransmits reliable payloads whose carrier sequences are lost.
    fn resend_lost(&mut self) {
        let lost = self.ack.inferred_lost();
        if lost.is_empty() {
            return;
        }
        for event in self.reliable.take_lost(&lost) {
            let sequence = self.ack.next_sequence();
            let packet = Packet::new(
                PacketType::ReliableEvent,
                sequence,
                self.ack.remote_sequence(),
                self.ack.receive_bits(),
                event.payload.clone(),
            );
            self.ack.on_packet_sent(sequence);
            self.reliable.stage(sequence, event);
            self.send_raw(packet.encode());
        }
    }

    /// Drains the socket with bounded work.
    pub fn receive_packets(&mut self) {
        let mut buffer = [0u8; DEFAULT_BUFFER_SIZE];
        for _ in 0..MAX_PACKETS_PER_TICK {
            match self.socket.recv_from(&mut buffer) {
                Ok((len, _)) => {
                    self.total_bytes_recv += len as u64;
                    self.bytes_recv_window += len as u64;
                    self.handle_datagram(&buffer[..len]);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!("receive error: {}", e);
                    break;
                }
            }
        }
    }

    fn handle_datagram(&mut self, data: &[u8]) {
        let packet = match Packet::decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("dropping malformed datagram: {}", e);
                return;
            }
        };
        let Some(kind) = packet.kind() else {
            return;
        };
        self.last_packet_at = Instant::now();

        match kind {
            PacketType::ConnectAck => {
                if let Some(&id) = packet.payload.first() {
                    if !self.connected {
                        info!("connected, assigned id {}", id);
                    }
                    self.client_id = Some(id);
                    self.connected = true;
                    self.world.set_local_id(id);
                }
            }
            PacketType::Snapshot => match Snapshot::decode_with_acks(&packet.payload) {
                Ok((snapshot, acks)) => {
                    let last_processed = self
                        .client_id
                        .and_then(|id| acks.iter().find(|(cid, _)| *cid == id))
                        .map(|(_, seq)| *seq)
                        .unwrap_or(0);
                    self.queued_snapshots.push((snapshot, last_processed));
                }
                Err(e) => debug!("dropping bad snapshot: {}", e),
            },
            PacketType::Pong => match decode_ping_timestamp(&packet.payload) {
                Ok(sent_at) => {
                    let rtt_ms = (self.epoch.elapsed().as_secs_f64() - sent_at) * 1000.0;
                    if rtt_ms >= 0.0 {
                        self.metrics.log_rtt(rtt_ms);
                    }
                }
                Err(e) => debug!("dropping bad pong: {}", e),
            },
            PacketType::ReliableEvent => {
                debug!("reliable event from server ({} bytes)", packet.payload.len());
                self.events.push(packet.payload.clone());
            }
            PacketType::Disconnect => {
                warn!("server closed the session");
                self.connected = false;
                self.client_id = None;
            }
            PacketType::ConnectReq
            | PacketType::Input
            | PacketType::Ping
            | PacketType::Heartbeat => {
                debug!("unexpected {:?} from server", kind);
            }
        }

        self.ack.on_packet_received(packet.sequence);
        if packet.ack != 0 {
            let confirmed = self.ack.on_ack_received(packet.ack, packet.ack_bits);
            self.reliable.on_acked(&confirmed);
        }
    }

    fn send_raw(&mut self, data: Vec<u8>) {
        self.total_bytes_sent += data.len() as u64;
        self.bytes_sent_window += data.len() as u64;
        match &mut self.net_sim {
            Some(sim) => sim.enqueue(data, self.server_addr),
            None => {
                if let Err(e) = self.socket.send_to(&data, self.server_addr) {
                    debug!("send failed: {}", e);
                }
            }
        }
    }

    fn flush_sim(&mut self) {
        let Some(sim) = &mut self.net_sim else {
            return;
        };
        for (data, addr) in sim.drain_ready() {
            if let Err(e) = self.socket.send_to(&data, addr) {
                debug!("send failed: {}", e);
            }
        }
    }

    fn log_second_metrics(&mut self) {
        self.metrics
            .log_bandwidth(self.bytes_sent_window, self.bytes_recv_window);
        self.bytes_sent_window = 0;
        self.bytes_recv_window = 0;

        self.resend_lost();
        let loss = self.ack.loss_rate();
        self.metrics.log_packet_loss(loss);
    }

    fn status_line(&self) -> String {
        format!(
            "rtt {:.1} ms | jitter {:.1} ms | loss {:.1}% | tick {} | pending {} | players {}",
            self.metrics.current_rtt(),
            self.metrics.current_jitter(),
            self.ack.loss_rate() * 100.0,
            self.world.latest_tick().unwrap_or(0),
            self.world.pending_inputs(),
            self.world.interpolated_remotes().len() + usize::from(self.world.local_entity().is_some()),
        )
    }

    /// Runs the client loop until `duration` elapses (forever when `None`).
    ///
    /// The scheduler accumulates absolute tick deadlines so rate does not
    /// drift with sleep imprecision; an overrun tick fires immediately
    /// without catching up lost time.
    pub fn run(
        &mut self,
        source: &mut dyn InputSource,
        duration: Option<Duration>,
        headless: bool,
    ) -> io::Result<()> {
        let started = Instant::now();
        self.connect();

        let now = Instant::now();
        let mut next_tick = now;
        let mut next_ping = now;
        let mut next_retry = now + CONNECT_RETRY_INTERVAL;
        let mut next_second = now + Duration::from_secs(1);

        loop {
            if let Some(limit) = duration {
                if started.elapsed() >= limit {
                    break;
                }
            }
            let now = Instant::now();

            if !self.connected && now >= next_retry {
                self.connect();
                next_retry = now + CONNECT_RETRY_INTERVAL;
            }

            self.flush_sim();
            self.receive_packets();

            if self.connected && now >= next_ping {
                self.send_ping();
                self.send_heartbeat();
                next_ping += PING_INTERVAL;
                if now > next_ping {
                    next_ping = now + PING_INTERVAL;
                }
            }

            if now >= next_tick {
                let (move_x, move_y, actions) = source.sample();
                self.tick(move_x, move_y, actions);
                next_tick += self.tick_duration;
                if now > next_tick {
                    next_tick = now;
                }
            }

            if now >= next_second {
                self.log_second_metrics();
                if !headless && self.connected {
                    println!("{}", self.status_line());
                }
                next_second += Duration::from_secs(1);
                if now > next_second {
                    next_second = now + Duration::from_secs(1);
                }
            }

            if self.connected && self.last_packet_at.elapsed() > CLIENT_TIMEOUT {
                warn!("connection timed out");
                self.connected = false;
                self.client_id = None;
            }

            std::thread::sleep(Duration::from_millis(1));
        }

        self.disconnect();
        let name = format!("client_{}_metrics.json", self.client_id.unwrap_or(0));
        if let Err(e) = self.metrics.save(&name) {
            warn!("failed to save metrics: {}", e);
        }
        info!("metrics summary: {:?}", self.metrics.summary());
        Ok(())
    }
}

/// Resolves an address string, accepting both socket addresses and
/// `host:port` names.
fn resolve_address(addr: &str) -> io::Result<SocketAddr> {
    if let Ok(parsed) = addr.parse::<SocketAddr>() {
        return Ok(parsed);
    }
    addr.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("failed to resolve address: {}", addr),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::packet::sequence_newer_u16;
    use shared::snapshot::EntityState;

    fn test_client() -> GameClient {
        GameClient::new("127.0.0.1:9000", 20, 0.0, 0.0).unwrap()
    }

    fn connect_ack(id: u8) -> Vec<u8> {
        Packet::new(PacketType::ConnectAck, 0, 0, 0, vec![id]).encode()
    }

    fn snapshot_datagram(sequence: u16, snapshot: &Snapshot, acks: &[(u8, u32)]) -> Vec<u8> {
        Packet::new(
            PacketType::Snapshot,
            sequence,
            0,
            0,
            snapshot.encode_with_acks(acks),
        )
        .encode()
    }

    #[test]
    fn zero_tick_rate_is_rejected() {
        assert!(GameClient::new("127.0.0.1:9000", 0, 0.0, 0.0).is_err());
    }

    #[test]
    fn resolve_accepts_addresses_and_names() {
        assert!(resolve_address("127.0.0.1:9000").is_ok());
        assert!(resolve_address("localhost:9000").is_ok());
        assert!(resolve_address("definitely-not-a-host").is_err());
    }

    #[test]
    fn connect_ack_assigns_id() {
        let mut client = test_client();
        assert!(!client.connected());

        client.handle_datagram(&connect_ack(7));
        assert!(client.connected());
        assert_eq!(client.client_id(), Some(7));
        assert_eq!(client.world.local_id(), Some(7));
    }

    #[test]
    fn snapshots_queue_until_the_tick() {
        let mut client = test_client();
        client.handle_datagram(&connect_ack(1));

        let mut snapshot = Snapshot::new(5);
        snapshot.insert(EntityState::new(1, 100.0, 100.0));
        client.handle_datagram(&snapshot_datagram(1, &snapshot, &[(1, 0)]));

        // Received but not yet processed.
        assert!(client.world.latest_tick().is_none());
        assert_eq!(client.queued_snapshots.len(), 1);

        client.tick(0.0, 0.0, 0);
        assert_eq!(client.world.latest_tick(), Some(5));
        assert!(client.world.local_entity().is_some());
    }

    #[test]
    fn trailer_lookup_finds_own_entry() {
        let mut client = test_client();
        client.handle_datagram(&connect_ack(2));

        let mut snapshot = Snapshot::new(9);
        snapshot.insert(EntityState::new(1, 0.0, 0.0));
        snapshot.insert(EntityState::new(2, 50.0, 50.0));
        client.handle_datagram(&snapshot_datagram(1, &snapshot, &[(1, 10), (2, 4)]));

        assert_eq!(client.queued_snapshots[0].1, 4);
    }

    #[test]
    fn input_sequences_are_monotonic_and_redundant() {
        let mut client = test_client();
        client.handle_datagram(&connect_ack(1));

        let mut snapshot = Snapshot::new(1);
        snapshot.insert(EntityState::new(1, 10.0, 10.0));
        client.handle_datagram(&snapshot_datagram(1, &snapshot, &[(1, 0)]));

        // The first tick processes the queued snapshot and spawns us; the
        // next five are predicted.
        client.tick(0.0, 0.0, 0);
        for _ in 0..5 {
            client.tick(1.0, 0.0, 0);
        }
        assert_eq!(client.input_sequence, 6);
        assert_eq!(client.world.pending_inputs(), 5);

        // The redundancy window holds the most recent frames, oldest first.
        let frames: Vec<u32> = client.redundancy.iter().map(|f| f.sequence).collect();
        assert_eq!(frames, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn reliable_events_settle_on_ack() {
        let mut client = test_client();
        client.handle_datagram(&connect_ack(1));

        client.send_reliable_event(vec![1, 2, 3]);
        assert_eq!(client.reliable.in_flight(), 1);

        // A later server packet acks the carrier sequence.
        let carrier = client.ack.local_sequence();
        let ack_packet = Packet::new(
            PacketType::Pong,
            1,
            carrier,
            0,
            encode_ping_timestamp(client.epoch.elapsed().as_secs_f64()),
        )
        .encode();
        client.handle_datagram(&ack_packet);
        assert_eq!(client.reliable.in_flight(), 0);
    }

    #[test]
    fn lost_reliable_events_are_retransmitted() {
        let mut client = test_client();
        // Capture outbound datagrams instead of handing them to the socket.
        client.net_sim = Some(NetworkSimulator::with_seed(0.0, Duration::ZERO, 1));
        client.handle_datagram(&connect_ack(1));

        client.send_reliable_event(vec![0xCD]);
        let carrier = client.ack.local_sequence();
        assert_eq!(carrier, 1);

        // Forty pings push the outbound sequence far past the event's
        // carrier.
        for _ in 0..40 {
            client.send_ping();
        }
        let latest = client.ack.local_sequence();

        // The server acks a recent ping but never the carrier, which has
        // now fallen off the 32-slot ack window.
        let ack_packet = Packet::new(
            PacketType::Pong,
            1,
            latest,
            0,
            encode_ping_timestamp(client.epoch.elapsed().as_secs_f64()),
        )
        .encode();
        client.handle_datagram(&ack_packet);

        // Discard everything sent so far; the loss scan must put the event
        // back on the wire under a fresh sequence.
        client.net_sim.as_mut().unwrap().drain_ready();
        client.resend_lost();

        let resent: Vec<Packet> = client
            .net_sim
            .as_mut()
            .unwrap()
            .drain_ready()
            .into_iter()
            .map(|(data, _)| Packet::decode(&data).unwrap())
            .filter(|p| p.kind() == Some(PacketType::ReliableEvent))
            .collect();
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].payload, vec![0xCD]);
        assert!(sequence_newer_u16(resent[0].sequence, carrier));

        // Still in flight under the new carrier until the server acks it.
        assert_eq!(client.reliable.in_flight(), 1);
    }

    #[test]
    fn malformed_datagrams_are_dropped() {
        let mut client = test_client();
        client.handle_datagram(b"garbage");
        client.handle_datagram(&[]);

        let mut bad = connect_ack(1);
        bad[0] = 0;
        client.handle_datagram(&bad);

        assert!(!client.connected());
    }

    #[test]
    fn server_disconnect_ends_session() {
        let mut client = test_client();
        client.handle_datagram(&connect_ack(1));
        assert!(client.connected());

        let bye = Packet::new(PacketType::Disconnect, 0, 0, 0, Vec::new()).encode();
        client.handle_datagram(&bye);
        assert!(!client.connected());
        assert_eq!(client.client_id(), None);
    }

    #[test]
    fn pong_produces_rtt_sample() {
        let mut client = test_client();
        client.handle_datagram(&connect_ack(1));

        let sent_at = client.epoch.elapsed().as_secs_f64() - 0.030;
        let pong = Packet::new(
            PacketType::Pong,
            0,
            0,
            0,
            encode_ping_timestamp(sent_at),
        )
        .encode();
        client.handle_datagram(&pong);

        assert!(client.metrics.current_rtt() >= 30.0);
        assert!(client.metrics.current_rtt() < 100.0);
    }
}
