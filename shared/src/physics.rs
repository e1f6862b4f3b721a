//! Deterministic movement step shared by server simulation and client
//! prediction.
//!
//! Both sides call this exact function with the same `f32` constants, so
//! identical `(state, input, dt)` produce bit-identical results. Duplicating
//! the math on either side would break reconciliation.

use crate::packet::InputFrame;
use crate::snapshot::EntityState;
use crate::{PLAYER_SPEED, WORLD_HEIGHT, WORLD_WIDTH};

/// Advances one entity by one fixed timestep under the given input.
///
/// Move axes are clamped to [-1, 1] and the vector is normalized when its
/// length exceeds 1, so diagonal movement is no faster than straight
/// movement. Positions are clamped to the world rectangle after integration.
/// Health is untouched by movement; the `actions` bitfield is interpreted by
/// game rules elsewhere.
pub fn step(entity: &mut EntityState, input: &InputFrame, dt: f32) {
    let mut move_x = if input.move_x.is_finite() { input.move_x } else { 0.0 };
    let mut move_y = if input.move_y.is_finite() { input.move_y } else { 0.0 };
    move_x = move_x.clamp(-1.0, 1.0);
    move_y = move_y.clamp(-1.0, 1.0);

    let mag_sq = move_x * move_x + move_y * move_y;
    if mag_sq > 1.0 {
        let mag = mag_sq.sqrt();
        move_x /= mag;
        move_y /= mag;
    }

    entity.vx = move_x * PLAYER_SPEED;
    entity.vy = move_y * PLAYER_SPEED;
    entity.x += entity.vx * dt;
    entity.y += entity.vy * dt;

    entity.x = entity.x.clamp(0.0, WORLD_WIDTH);
    entity.y = entity.y.clamp(0.0, WORLD_HEIGHT);
}
