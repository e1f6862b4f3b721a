//! # Shared Netcode Library
//!
//! This crate contains everything the game server and the game client must
//! agree on: the wire protocol, the snapshot model, the movement physics, and
//! the reliability/measurement plumbing layered on top of raw UDP.
//!
//! ## Core Components
//!
//! ### Wire Protocol (`packet`)
//! A custom binary protocol with a fixed 15-byte big-endian header carrying
//! piggybacked acknowledgments (sequence, ack, 32-bit ack bitfield). Nine
//! packet types cover connection management, input transmission, state
//! snapshots, latency probing, and a reliable event channel.
//!
//! ### Snapshot Model (`snapshot`)
//! The authoritative world state at a specific server tick, serialized as a
//! flat table of entity states. Snapshots carry a trailer of per-client
//! last-processed-input sequences so each client can reconcile its
//! prediction against the authority.
//!
//! ### Physics (`physics`)
//! A single deterministic step function used verbatim by the server
//! simulation and the client predictor. Both sides must produce bit-identical
//! results for identical inputs, which is why the function lives here and is
//! never duplicated.
//!
//! ### Reliability Plumbing (`ack`, `reliable`)
//! Sequence tracking with wrap-around comparison, receive bitmaps for
//! piggybacked acks, inferred-loss detection, and a retransmitting channel
//! for events that must survive packet loss.
//!
//! ### Instrumentation (`metrics`, `sim`)
//! An in-memory metrics logger (RTT, RFC 3550 jitter, loss, bandwidth, tick
//! times) that flushes to a compact JSON document, and a network simulator
//! that injects loss and latency on the send path for testing.
//!
//! ## Design Philosophy
//!
//! All gameplay math uses `f32` with the constants below so that client
//! prediction and server simulation stay in lockstep. The codec is pure and
//! performs no I/O; sockets are owned by the server and client loops.

pub mod ack;
pub mod metrics;
pub mod packet;
pub mod physics;
pub mod reliable;
pub mod sim;
pub mod snapshot;

use std::time::Duration;

/// World width in world units. Entity positions are clamped to
/// `[0, WORLD_WIDTH]` after every physics step on both sides.
pub const WORLD_WIDTH: f32 = 800.0;

/// World height in world units.
pub const WORLD_HEIGHT: f32 = 600.0;

/// Movement speed applied to a unit-length input vector, in units per second.
///
/// The exact value matters less than the fact that server and predictor share
/// this constant bit-for-bit.
pub const PLAYER_SPEED: f32 = 200.0;

/// Default UDP port for the server.
pub const DEFAULT_PORT: u16 = 9000;

/// Default simulation rate for both server and client, in ticks per second.
pub const DEFAULT_TICK_RATE: u32 = 20;

/// Receive buffer size for a single datagram.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// A client that has been silent this long is expired and its entity removed.
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between connection request retries while unconnected.
pub const CONNECT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Interval between PING probes.
pub const PING_INTERVAL: Duration = Duration::from_secs(1);

/// Remote entities are rendered this many ticks behind the newest snapshot.
pub const INTERPOLATION_TICKS: u32 = 2;

/// Number of recent inputs carried in every INPUT datagram, oldest first.
pub const INPUT_REDUNDANCY: usize = 3;

/// Upper bound on datagrams drained per tick, to prevent receive live-lock.
pub const MAX_PACKETS_PER_TICK: usize = 1024;

/// A reliable event is retransmitted at most this many times before being
/// dropped with a warning.
pub const RELIABLE_MAX_RETRIES: u8 = 5;

/// Entity ids are `u8` with 0 reserved, so at most 255 concurrent clients.
pub const MAX_CLIENTS: usize = 255;

/// Client-side input history bound (must cover several round trips of
/// unacknowledged inputs).
pub const INPUT_HISTORY_LIMIT: usize = 128;

/// Client-side snapshot buffer bound.
pub const SNAPSHOT_BUFFER_LIMIT: usize = 64;
