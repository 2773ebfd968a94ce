//! Cube registry — the canonical store of per-cube state.
//!
//! DESIGN
//! ======
//! Telemetry arrives as partial patches from relay ingest and from gateway
//! command side effects. The registry merges patches field-wise behind one
//! mutex and reports a changed state only when an observable field actually
//! differed, so downstream fan-out stays quiet for redundant telemetry.
//! Entries are created lazily on first update and never removed.
//!
//! The registry is the only mutator of stored cube records. Readers get
//! clones, never references into the map.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// Change records retained for history snapshots.
const HISTORY_CAP: usize = 256;

// =============================================================================
// TYPES
// =============================================================================

/// Pose on the mat. Telemetry is discretized upstream, so exact equality is
/// the right change test.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub deg: f64,
    pub on_mat: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

/// Partial pose patch. Relays report pose components independently, so each
/// one is optional and an unreported component leaves the stored value
/// untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PoseUpdate {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub deg: Option<f64>,
    pub on_mat: Option<bool>,
}

impl PoseUpdate {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.x.is_none() && self.y.is_none() && self.deg.is_none() && self.on_mat.is_none()
    }

    /// Overlay this patch on a prior pose. A cube first sighted through a
    /// sparse frame starts from the zero pose.
    fn apply(self, prior: Option<Pose>) -> Pose {
        let mut pose = prior.unwrap_or(Pose { x: 0.0, y: 0.0, deg: 0.0, on_mat: false });
        if let Some(x) = self.x {
            pose.x = x;
        }
        if let Some(y) = self.y {
            pose.y = y;
        }
        if let Some(deg) = self.deg {
            pose.deg = deg;
        }
        if let Some(on_mat) = self.on_mat {
            pose.on_mat = on_mat;
        }
        pose
    }
}

impl From<Pose> for PoseUpdate {
    fn from(pose: Pose) -> Self {
        Self {
            x: Some(pose.x),
            y: Some(pose.y),
            deg: Some(pose.deg),
            on_mat: Some(pose.on_mat),
        }
    }
}

/// Partial LED patch, per channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedUpdate {
    pub r: Option<u8>,
    pub g: Option<u8>,
    pub b: Option<u8>,
}

impl LedUpdate {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.r.is_none() && self.g.is_none() && self.b.is_none()
    }

    fn apply(self, prior: LedColor) -> LedColor {
        LedColor {
            r: self.r.unwrap_or(prior.r),
            g: self.g.unwrap_or(prior.g),
            b: self.b.unwrap_or(prior.b),
        }
    }
}

impl From<LedColor> for LedUpdate {
    fn from(led: LedColor) -> Self {
        Self { r: Some(led.r), g: Some(led.g), b: Some(led.b) }
    }
}

/// Canonical per-cube state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CubeState {
    pub cube_id: String,
    pub relay_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Pose>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery: Option<i64>,
    pub led: LedColor,
    pub goal_id: String,
    pub last_updated: i64,
}

impl CubeState {
    fn new(cube_id: String) -> Self {
        Self {
            cube_id,
            relay_id: String::new(),
            position: None,
            battery: None,
            led: LedColor::default(),
            goal_id: String::new(),
            last_updated: 0,
        }
    }

    /// Whether a pose has ever been observed for this cube.
    #[must_use]
    pub fn has_position(&self) -> bool {
        self.position.is_some()
    }
}

/// A partial update. Absent fields never clear stored values; position and
/// led patch at sub-field granularity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CubeUpdate {
    pub cube_id: String,
    pub relay_id: Option<String>,
    pub timestamp: i64,
    pub position: Option<PoseUpdate>,
    pub battery: Option<i64>,
    pub led: Option<LedUpdate>,
    pub goal_id: Option<String>,
}

/// One entry of the bounded change log.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    pub timestamp: i64,
    pub state: CubeState,
}

// =============================================================================
// REGISTRY
// =============================================================================

#[derive(Default)]
pub struct CubeRegistry {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    cubes: HashMap<String, CubeState>,
    history: VecDeque<ChangeRecord>,
}

impl CubeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one patch. Returns the new state iff any observable field
    /// changed. `last_updated` takes the patch timestamp either way.
    pub fn apply_update(&self, update: &CubeUpdate) -> Option<CubeState> {
        let mut inner = self.inner.lock().unwrap();
        Self::merge(&mut inner, update)
    }

    /// Merge a batch. Changed results preserve the input order.
    pub fn apply_updates(&self, updates: &[CubeUpdate]) -> Vec<CubeState> {
        let mut inner = self.inner.lock().unwrap();
        updates
            .iter()
            .filter_map(|update| Self::merge(&mut inner, update))
            .collect()
    }

    /// Full copy of every known cube, ordered by cube id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<CubeState> {
        let inner = self.inner.lock().unwrap();
        let mut cubes: Vec<CubeState> = inner.cubes.values().cloned().collect();
        cubes.sort_by(|a, b| a.cube_id.cmp(&b.cube_id));
        cubes
    }

    /// The most recent `n` change records, oldest first.
    #[must_use]
    pub fn history(&self, n: usize) -> Vec<ChangeRecord> {
        let inner = self.inner.lock().unwrap();
        let skip = inner.history.len().saturating_sub(n);
        inner.history.iter().skip(skip).cloned().collect()
    }

    fn merge(inner: &mut Inner, update: &CubeUpdate) -> Option<CubeState> {
        let state = inner
            .cubes
            .entry(update.cube_id.clone())
            .or_insert_with(|| CubeState::new(update.cube_id.clone()));

        let mut changed = false;
        if let Some(relay_id) = &update.relay_id {
            if state.relay_id != *relay_id {
                state.relay_id = relay_id.clone();
                changed = true;
            }
        }
        if let Some(patch) = update.position {
            if !patch.is_empty() {
                let merged = patch.apply(state.position);
                if state.position != Some(merged) {
                    state.position = Some(merged);
                    changed = true;
                }
            }
        }
        if let Some(battery) = update.battery {
            if state.battery != Some(battery) {
                state.battery = Some(battery);
                changed = true;
            }
        }
        if let Some(patch) = update.led {
            if !patch.is_empty() {
                let merged = patch.apply(state.led);
                if state.led != merged {
                    state.led = merged;
                    changed = true;
                }
            }
        }
        if let Some(goal_id) = &update.goal_id {
            if state.goal_id != *goal_id {
                state.goal_id = goal_id.clone();
                changed = true;
            }
        }

        state.last_updated = update.timestamp;
        if !changed {
            return None;
        }

        let snapshot = state.clone();
        inner.history.push_back(ChangeRecord {
            timestamp: update.timestamp,
            state: snapshot.clone(),
        });
        if inner.history.len() > HISTORY_CAP {
            inner.history.pop_front();
        }
        Some(snapshot)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[path = "registry_test.rs"]
mod tests;
