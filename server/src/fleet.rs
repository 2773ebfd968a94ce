//! Fleet orchestrator — goal assignments and fleet snapshots.
//!
//! Assignments are bookkeeping only: kinematic planning happens outside the
//! server. A goal is assigned to every requested target (one assignment per
//! cube, sharing the goal id), and a new assignment replaces any prior one
//! for the same cube.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::envelope::now_ms;
use crate::registry::CubeRegistry;

/// Nominal orchestrator tick rate reported in fleet snapshots.
const TICK_HZ: f64 = 30.0;

/// Assignments retained for history when a request asks for it.
const HISTORY_CAP: usize = 64;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("set_goal requires at least one target")]
    EmptyTargets,
}

/// Target pose for one cube. `angle` is optional; position-only goals leave
/// the final heading to the planner.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GoalPose {
    pub x: f64,
    pub y: f64,
    pub angle: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GoalRequest {
    pub targets: Vec<String>,
    pub pose: GoalPose,
    pub priority: i64,
    pub keep_history: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GoalAssignment {
    pub goal_id: String,
    pub cube_id: String,
    pub pose: GoalPose,
    pub priority: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FleetState {
    pub tick_hz: f64,
    pub tasks_in_queue: usize,
    pub active_goals: Vec<GoalAssignment>,
    pub warnings: Vec<String>,
}

// =============================================================================
// ORCHESTRATOR
// =============================================================================

pub struct FleetOrchestrator {
    registry: Arc<CubeRegistry>,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    active_goals: HashMap<String, GoalAssignment>,
    history: VecDeque<GoalAssignment>,
    goal_counter: u64,
}

impl FleetOrchestrator {
    #[must_use]
    pub fn new(registry: Arc<CubeRegistry>) -> Self {
        Self { registry, inner: Mutex::new(Inner::default()) }
    }

    /// Assign a goal to every target. Returns the generated goal id.
    pub fn assign_goal(&self, request: &GoalRequest) -> Result<String, FleetError> {
        if request.targets.is_empty() {
            return Err(FleetError::EmptyTargets);
        }

        let created_at = now_ms();
        let mut inner = self.inner.lock().unwrap();
        inner.goal_counter += 1;
        let goal_id = format!("goal-{}", inner.goal_counter);

        for cube_id in &request.targets {
            let assignment = GoalAssignment {
                goal_id: goal_id.clone(),
                cube_id: cube_id.clone(),
                pose: request.pose,
                priority: request.priority,
                created_at,
            };
            if request.keep_history {
                inner.history.push_back(assignment.clone());
                if inner.history.len() > HISTORY_CAP {
                    inner.history.pop_front();
                }
            }
            inner.active_goals.insert(cube_id.clone(), assignment);
        }
        drop(inner);

        info!(%goal_id, targets = request.targets.len(), "assigned goal");
        Ok(goal_id)
    }

    /// Remove the assignment for one cube, if any.
    pub fn clear_goal(&self, cube_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.active_goals.remove(cube_id);
    }

    /// Current fleet state plus a warning per cube with no observed position.
    #[must_use]
    pub fn snapshot(&self) -> FleetState {
        let (tasks_in_queue, mut active_goals) = {
            let inner = self.inner.lock().unwrap();
            let goals: Vec<GoalAssignment> = inner.active_goals.values().cloned().collect();
            (goals.len(), goals)
        };
        active_goals.sort_by(|a, b| a.cube_id.cmp(&b.cube_id));

        let warnings = self
            .registry
            .snapshot()
            .iter()
            .filter(|cube| !cube.has_position())
            .map(|cube| format!("Cube {} position unknown", cube.cube_id))
            .collect();

        FleetState { tick_hz: TICK_HZ, tasks_in_queue, active_goals, warnings }
    }

    /// Recent assignments recorded with `keep_history`, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<GoalAssignment> {
        let inner = self.inner.lock().unwrap();
        inner.history.iter().cloned().collect()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[path = "fleet_test.rs"]
mod tests;
