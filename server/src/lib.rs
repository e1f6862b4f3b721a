//! # Game Server Library
//!
//! Authoritative server for the networked game. The server owns the only
//! true copy of the world: clients send inputs, the server simulates them at
//! a fixed tick rate, and every tick it broadcasts a snapshot that clients
//! reconcile and interpolate against.
//!
//! ## Module Organization
//!
//! ### Client Manager (`client_manager`)
//! Connection lifecycle: id assignment in [1, 255], per-client input queues,
//! ack tracking, reliable event state, and silence timeouts.
//!
//! ### Game (`game`)
//! The authoritative world state and the input application path, which runs
//! through the shared physics step so it stays bit-identical with client
//! prediction.
//!
//! ### Network (`network`)
//! The UDP tick loop: a spawned receiver task hands datagrams to the
//! single-threaded simulation loop through a bounded channel, so the tick
//! loop remains the sole mutator of game state. A slow or dead client can
//! never stall the tick.

pub mod client_manager;
pub mod game;
pub mod network;
