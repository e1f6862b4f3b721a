//! Client-side game state: prediction, reconciliation, and interpolation.

use std::collections::VecDeque;

use log::debug;
use shared::packet::{sequence_newer_u32, InputFrame};
use shared::physics;
use shared::snapshot::{EntityState, Snapshot};
use shared::{INPUT_HISTORY_LIMIT, INTERPOLATION_TICKS, SNAPSHOT_BUFFER_LIMIT};

/// Smoothing factor applied toward the predicted state each local tick.
const PREDICT_SMOOTHING: f32 = 0.5;

/// Smoothing factor applied toward the corrected state after reconciliation.
/// Gentler than the per-tick factor so corrections never snap visually.
const CORRECTION_SMOOTHING: f32 = 0.3;

/// An input that has been predicted locally, tagged with the state it
/// produced so prediction error can be measured when the server acks it.
#[derive(Debug, Clone, Copy)]
pub struct RecordedInput {
    pub frame: InputFrame,
    pub predicted: EntityState,
}

/// Everything the client simulates locally: the predicted entity, the
/// smoothed render state, unacknowledged input history, and the buffer of
/// recent server snapshots.
pub struct ClientWorld {
    dt: f32,
    local_id: Option<u8>,
    local: Option<EntityState>,
    visual: Option<EntityState>,
    input_history: VecDeque<RecordedInput>,
    snapshots: VecDeque<Snapshot>,
    last_reconciled_tick: Option<u32>,
}

impl ClientWorld {
    pub fn new(dt: f32) -> Self {
        Self {
            dt,
            local_id: None,
            local: None,
            visual: None,
            input_history: VecDeque::new(),
            snapshots: VecDeque::new(),
            last_reconciled_tick: None,
        }
    }

    pub fn set_local_id(&mut self, id: u8) {
        self.local_id = Some(id);
    }

    pub fn local_id(&self) -> Option<u8> {
        self.local_id
    }

    /// Predicted local entity, the authoritative-plus-replayed state.
    pub fn local_entity(&self) -> Option<&EntityState> {
        self.local.as_ref()
    }

    /// Smoothed local entity for rendering.
    pub fn render_entity(&self) -> Option<&EntityState> {
        self.visual.as_ref()
    }

    pub fn pending_inputs(&self) -> usize {
        self.input_history.len()
    }

    pub fn latest_tick(&self) -> Option<u32> {
        self.snapshots.back().map(|s| s.tick)
    }

    /// Applies one input to the predicted entity immediately and records it
    /// with its predicted post-state for later reconciliation.
    pub fn predict(&mut self, frame: InputFrame) {
        let Some(local) = self.local.as_mut() else {
            // Nothing to predict until the first snapshot spawns us.
            return;
        };

        physics::step(local, &frame, self.dt);
        let predicted = *local;

        self.input_history.push_back(RecordedInput { frame, predicted });
        while self.input_history.len() > INPUT_HISTORY_LIMIT {
            self.input_history.pop_front();
        }

        let target = *local;
        self.smooth_visual_toward(&target, PREDICT_SMOOTHING);
    }

    /// Stores a snapshot in tick order for interpolation. Duplicates and
    /// stale reordered snapshots are dropped.
    pub fn buffer_snapshot(&mut self, snapshot: Snapshot) {
        match self.snapshots.back() {
            None => self.snapshots.push_back(snapshot),
            Some(newest) if snapshot.tick > newest.tick => self.snapshots.push_back(snapshot),
            Some(_) => {
                if self.snapshots.iter().any(|s| s.tick == snapshot.tick) {
                    return;
                }
                let position = self
                    .snapshots
                    .iter()
                    .position(|s| s.tick > snapshot.tick)
                    .unwrap_or(self.snapshots.len());
                self.snapshots.insert(position, snapshot);
            }
        }

        while self.snapshots.len() > SNAPSHOT_BUFFER_LIMIT {
            self.snapshots.pop_front();
        }
    }

    /// Rebases prediction on an authoritative snapshot.
    ///
    /// The predicted entity adopts the server state, inputs the server has
    /// already processed are discarded, and the remaining history is
    /// replayed in order through the shared physics step. Returns the
    /// prediction error measured at the acked input, when known.
    pub fn reconcile(&mut self, snapshot: &Snapshot, last_processed_seq: u32) -> Option<f32> {
        if let Some(last) = self.last_reconciled_tick {
            if snapshot.tick <= last {
                return None;
            }
        }

        let id = self.local_id?;
        let server_entity = *snapshot.entities.get(&id)?;
        self.last_reconciled_tick = Some(snapshot.tick);

        // Prediction error: where we thought we were when the server
        // processed that input, versus where it says we are.
        let error = self
            .input_history
            .iter()
            .find(|rec| rec.frame.sequence == last_processed_seq)
            .map(|rec| {
                let dx = rec.predicted.x - server_entity.x;
                let dy = rec.predicted.y - server_entity.y;
                (dx * dx + dy * dy).sqrt()
            });

        self.input_history
            .retain(|rec| sequence_newer_u32(rec.frame.sequence, last_processed_seq));

        let mut corrected = server_entity;
        for rec in &self.input_history {
            physics::step(&mut corrected, &rec.frame, self.dt);
        }

        if let Some(err) = error {
            if err > 0.01 {
                debug!(
                    "reconciled tick {}: replayed {} inputs, error {:.2}",
                    snapshot.tick,
                    self.input_history.len(),
                    err
                );
            }
        }

        self.local = Some(corrected);
        self.smooth_visual_toward(&corrected, CORRECTION_SMOOTHING);
        error
    }

    fn smooth_visual_toward(&mut self, target: &EntityState, smoothing: f32) {
        match self.visual.as_mut() {
            Some(visual) => {
                visual.x += (target.x - visual.x) * smoothing;
                visual.y += (target.y - visual.y) * smoothing;
                visual.vx = target.vx;
                visual.vy = target.vy;
                visual.health = target.health;
            }
            None => self.visual = Some(*target),
        }
    }

    /// Remote entity states at the interpolated render time,
    /// `latest_tick - INTERPOLATION_TICKS`.
    ///
    /// Entities absent from the newer bracketing snapshot have disappeared
    /// and are not rendered; without a bracketing pair the newest known
    /// positions hold steady (no extrapolation).
    pub fn interpolated_remotes(&self) -> Vec<EntityState> {
        let Some(newest) = self.snapshots.back() else {
            return Vec::new();
        };
        let render_tick = newest.tick.saturating_sub(INTERPOLATION_TICKS) as f32;

        let mut bracket = None;
        for pair in 0..self.snapshots.len().saturating_sub(1) {
            let before = &self.snapshots[pair];
            let after = &self.snapshots[pair + 1];
            if before.tick as f32 <= render_tick && render_tick <= after.tick as f32 {
                bracket = Some((before, after));
                break;
            }
        }

        let Some((before, after)) = bracket else {
            return self.hold_newest(newest);
        };

        let tick_range = (after.tick - before.tick) as f32;
        let alpha = if tick_range > 0.0 {
            ((render_tick - before.tick as f32) / tick_range).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let mut remotes = Vec::new();
        for (id, newer) in &after.entities {
            if Some(*id) == self.local_id {
                continue;
            }
            match before.entities.get(id) {
                Some(older) => remotes.push(EntityState {
                    id: *id,
                    x: older.x + (newer.x - older.x) * alpha,
                    y: older.y + (newer.y - older.y) * alpha,
                    vx: newer.vx,
                    vy: newer.vy,
                    health: newer.health,
                }),
                // Just appeared between the brackets.
                None => remotes.push(*newer),
            }
        }
        remotes
    }

    fn hold_newest(&self, newest: &Snapshot) -> Vec<EntityState> {
        newest
            .entities
            .values()
            .filter(|e| Some(e.id) != self.local_id)
            .copied()
            .collect()
    }

    /// Adopts the spawn state from the first snapshot that contains us.
    pub fn ensure_spawned(&mut self, snapshot: &Snapshot) {
        if self.local.is_some() {
            return;
        }
        let Some(id) = self.local_id else {
            return;
        };
        if let Some(entity) = snapshot.entities.get(&id) {
            self.local = Some(*entity);
            self.visual = Some(*entity);
        }
    }
}
