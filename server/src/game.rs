//! Authoritative world state owned by the server loop.

use std::collections::BTreeMap;

use log::info;
use shared::packet::InputFrame;
use shared::physics;
use shared::snapshot::{EntityState, Snapshot};
use shared::{WORLD_HEIGHT, WORLD_WIDTH};

/// The single source of truth for the game world: a flat slot table of
/// entities keyed by id, plus the current tick.
#[derive(Debug, Clone)]
pub struct WorldState {
    pub tick: u32,
    pub entities: BTreeMap<u8, EntityState>,
}

impl WorldState {
    pub fn new() -> Self {
        Self {
            tick: 0,
            entities: BTreeMap::new(),
        }
    }

    /// Adds an entity for a newly connected client at a spread-out spawn
    /// position. Re-adding an existing id keeps the current state.
    pub fn add_entity(&mut self, id: u8) -> EntityState {
        if let Some(existing) = self.entities.get(&id) {
            return *existing;
        }

        let count = self.entities.len() as f32;
        let x = 100.0 + (count * 150.0) % (WORLD_WIDTH - 200.0);
        let y = WORLD_HEIGHT / 2.0;

        let entity = EntityState::new(id, x, y);
        info!("spawned entity {} at ({:.1}, {:.1})", id, x, y);
        self.entities.insert(id, entity);
        entity
    }

    pub fn remove_entity(&mut self, id: u8) {
        if self.entities.remove(&id).is_some() {
            info!("removed entity {}", id);
        }
    }

    /// Applies one input frame to a client's entity through the shared
    /// physics step.
    pub fn apply_input(&mut self, id: u8, input: &InputFrame, dt: f32) {
        if let Some(entity) = self.entities.get_mut(&id) {
            physics::step(entity, input, dt);
        }
    }

    /// Captures the current world state for broadcast.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            tick: self.tick,
            entities: self.entities.clone(),
        }
    }
}

impl Default for WorldState {
    fn default() -> Self {
        Self::new()
    }
}
