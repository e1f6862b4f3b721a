//! Snapshot serialization for authoritative world state.
//!
//! Wire form of a SNAPSHOT payload:
//!
//! - tick u32, entity_count u8
//! - `entity_count` entity states, 21 bytes each
//! - ack trailer: one `(client_id u8, last_processed_input_seq u32)` pair per
//!   connected client, length implied by the packet's payload length

use std::collections::BTreeMap;

use thiserror::Error;

/// Wire size of one entity state: id u8, x f32, y f32, vx f32, vy f32,
/// health f32.
pub const ENTITY_STATE_SIZE: usize = 21;

/// Wire size of the snapshot header: tick u32, entity_count u8.
pub const SNAPSHOT_HEADER_SIZE: usize = 5;

/// Wire size of one ack trailer pair.
pub const ACK_TRAILER_ENTRY_SIZE: usize = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("snapshot header truncated: {0} bytes")]
    TruncatedHeader(usize),
    #[error("snapshot truncated: expected {expected} entities, parsed {parsed}")]
    TruncatedEntities { expected: u8, parsed: u8 },
    #[error("ack trailer truncated: {0} trailing bytes")]
    TruncatedTrailer(usize),
}

/// One entity's state as carried in a snapshot. Entity ids are 1 to 255;
/// id 0 is reserved.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntityState {
    pub id: u8,
    pub x: f32,
    pub y: f32,
    pub vx: f32,
    pub vy: f32,
    pub health: f32,
}

impl EntityState {
    pub fn new(id: u8, x: f32, y: f32) -> Self {
        Self {
            id,
            x,
            y,
            vx: 0.0,
            vy: 0.0,
            health: 100.0,
        }
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.push(self.id);
        buf.extend_from_slice(&self.x.to_be_bytes());
        buf.extend_from_slice(&self.y.to_be_bytes());
        buf.extend_from_slice(&self.vx.to_be_bytes());
        buf.extend_from_slice(&self.vy.to_be_bytes());
        buf.extend_from_slice(&self.health.to_be_bytes());
    }

    fn decode(data: &[u8]) -> Self {
        debug_assert!(data.len() >= ENTITY_STATE_SIZE);
        Self {
            id: data[0],
            x: f32::from_be_bytes([data[1], data[2], data[3], data[4]]),
            y: f32::from_be_bytes([data[5], data[6], data[7], data[8]]),
            vx: f32::from_be_bytes([data[9], data[10], data[11], data[12]]),
            vy: f32::from_be_bytes([data[13], data[14], data[15], data[16]]),
            health: f32::from_be_bytes([data[17], data[18], data[19], data[20]]),
        }
    }
}

/// A full world state at a specific server tick. Entities live in a flat
/// table keyed by id, so identity is stable across snapshots without any
/// pointer graph.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub tick: u32,
    pub entities: BTreeMap<u8, EntityState>,
}

impl Snapshot {
    pub fn new(tick: u32) -> Self {
        Self {
            tick,
            entities: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, entity: EntityState) {
        self.entities.insert(entity.id, entity);
    }

    /// Byte size of the serialized snapshot, without the ack trailer.
    pub fn serialized_size(&self) -> usize {
        SNAPSHOT_HEADER_SIZE + self.entities.len() * ENTITY_STATE_SIZE
    }

    /// Serializes the snapshot without a trailer.
    pub fn encode(&self) -> Vec<u8> {
        debug_assert!(self.entities.len() <= u8::MAX as usize);
        let mut buf = Vec::with_capacity(self.serialized_size());
        buf.extend_from_slice(&self.tick.to_be_bytes());
        buf.push(self.entities.len() as u8);
        for entity in self.entities.values() {
            entity.encode_into(&mut buf);
        }
        buf
    }

    /// Serializes the snapshot followed by the per-client ack trailer.
    pub fn encode_with_acks(&self, acks: &[(u8, u32)]) -> Vec<u8> {
        let mut buf = self.encode();
        buf.reserve(acks.len() * ACK_TRAILER_ENTRY_SIZE);
        for (client_id, last_seq) in acks {
            buf.push(*client_id);
            buf.extend_from_slice(&last_seq.to_be_bytes());
        }
        buf
    }

    /// Deserializes a snapshot, discarding the ack trailer.
    pub fn decode(data: &[u8]) -> Result<Self, SnapshotError> {
        Ok(Self::decode_with_acks(data)?.0)
    }

    /// Deserializes a snapshot and its ack trailer.
    pub fn decode_with_acks(data: &[u8]) -> Result<(Self, Vec<(u8, u32)>), SnapshotError> {
        if data.len() < SNAPSHOT_HEADER_SIZE {
            return Err(SnapshotError::TruncatedHeader(data.len()));
        }

        let tick = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let count = data[4];

        let mut snapshot = Snapshot::new(tick);
        let mut offset = SNAPSHOT_HEADER_SIZE;
        for parsed in 0..count {
            if offset + ENTITY_STATE_SIZE > data.len() {
                return Err(SnapshotError::TruncatedEntities {
                    expected: count,
                    parsed,
                });
            }
            snapshot.insert(EntityState::decode(&data[offset..offset + ENTITY_STATE_SIZE]));
            offset += ENTITY_STATE_SIZE;
        }

        let mut acks = Vec::new();
        let trailing = data.len() - offset;
        if trailing % ACK_TRAILER_ENTRY_SIZE != 0 {
            return Err(SnapshotError::TruncatedTrailer(trailing));
        }
        while offset < data.len() {
            let client_id = data[offset];
            let last_seq = u32::from_be_bytes([
                data[offset + 1],
                data[offset + 2],
                data[offset + 3],
                data[offset + 4],
            ]);
            acks.push((client_id, last_seq));
            offset += ACK_TRAILER_ENTRY_SIZE;
        }

        Ok((snapshot, acks))
    }
}
