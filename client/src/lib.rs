//! # Game Client Library
//!
//! Predicting client for the networked game. The client applies its own
//! inputs immediately for responsive play, rebases on every authoritative
//! snapshot by replaying unacknowledged inputs, and renders remote entities
//! a couple of ticks in the past so their motion interpolates smoothly
//! between known states.
//!
//! ## Module Organization
//!
//! ### Game (`game`)
//! `ClientWorld`: the predicted local entity, the smoothed render state, the
//! input history used for reconciliation, and the snapshot buffer feeding
//! remote-entity interpolation.
//!
//! ### Input (`input`)
//! Abstract input sources. Real input capture is an external collaborator;
//! the netcode only consumes `(move_x, move_y, actions)` triples.
//!
//! ### Network (`network`)
//! `GameClient`: the non-blocking socket loop that connects, sends redundant
//! inputs at the tick rate, measures link quality, and feeds snapshots into
//! the game state.

pub mod game;
pub mod input;
pub mod network;
