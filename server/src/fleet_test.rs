use super::*;
use crate::registry::{CubeUpdate, Pose};

fn orchestrator() -> FleetOrchestrator {
    FleetOrchestrator::new(Arc::new(CubeRegistry::new()))
}

fn request(targets: &[&str]) -> GoalRequest {
    GoalRequest {
        targets: targets.iter().map(|t| (*t).to_string()).collect(),
        pose: GoalPose { x: 200.0, y: 200.0, angle: None },
        priority: 1,
        keep_history: false,
    }
}

#[test]
fn goal_ids_are_sequential() {
    let fleet = orchestrator();
    assert_eq!(fleet.assign_goal(&request(&["A01"])).unwrap(), "goal-1");
    assert_eq!(fleet.assign_goal(&request(&["A02"])).unwrap(), "goal-2");
    assert_eq!(fleet.assign_goal(&request(&["A01"])).unwrap(), "goal-3");
}

#[test]
fn empty_targets_rejected() {
    let fleet = orchestrator();
    assert!(matches!(fleet.assign_goal(&request(&[])), Err(FleetError::EmptyTargets)));
}

#[test]
fn goal_is_assigned_to_every_target() {
    let fleet = orchestrator();
    let goal_id = fleet.assign_goal(&request(&["A01", "A02"])).unwrap();

    let state = fleet.snapshot();
    assert_eq!(state.tasks_in_queue, 2);
    assert_eq!(state.active_goals.len(), 2);
    assert!(state.active_goals.iter().all(|g| g.goal_id == goal_id));
    let cubes: Vec<&str> = state.active_goals.iter().map(|g| g.cube_id.as_str()).collect();
    assert_eq!(cubes, vec!["A01", "A02"]);
}

#[test]
fn new_assignment_replaces_prior_for_same_cube() {
    let fleet = orchestrator();
    fleet.assign_goal(&request(&["A01"])).unwrap();
    let second = fleet.assign_goal(&request(&["A01"])).unwrap();

    let state = fleet.snapshot();
    assert_eq!(state.tasks_in_queue, 1);
    assert_eq!(state.active_goals[0].goal_id, second);
}

#[test]
fn clear_goal_removes_assignment() {
    let fleet = orchestrator();
    fleet.assign_goal(&request(&["A01"])).unwrap();
    fleet.clear_goal("A01");
    assert_eq!(fleet.snapshot().tasks_in_queue, 0);

    // Clearing an unknown cube is a no-op.
    fleet.clear_goal("ZZZ");
}

#[test]
fn history_only_kept_when_requested() {
    let fleet = orchestrator();
    fleet.assign_goal(&request(&["A01"])).unwrap();
    assert!(fleet.history().is_empty());

    let mut keep = request(&["A01"]);
    keep.keep_history = true;
    fleet.assign_goal(&keep).unwrap();
    assert_eq!(fleet.history().len(), 1);
    assert_eq!(fleet.history()[0].goal_id, "goal-2");
}

#[test]
fn history_is_bounded() {
    let fleet = orchestrator();
    let mut keep = request(&["A01"]);
    keep.keep_history = true;
    for _ in 0..70 {
        fleet.assign_goal(&keep).unwrap();
    }
    let history = fleet.history();
    assert_eq!(history.len(), 64);
    assert_eq!(history[0].goal_id, "goal-7", "oldest entries evicted first");
}

#[test]
fn snapshot_reports_tick_rate() {
    let state = orchestrator().snapshot();
    assert!((state.tick_hz - 30.0).abs() < f64::EPSILON);
}

#[test]
fn snapshot_warns_about_cubes_without_position() {
    let registry = Arc::new(CubeRegistry::new());
    // Battery-only cube: known but never localized.
    registry.apply_update(&CubeUpdate {
        cube_id: "A01".into(),
        timestamp: 1,
        battery: Some(90),
        ..CubeUpdate::default()
    });
    // Localized cube: no warning.
    registry.apply_update(&CubeUpdate {
        cube_id: "A02".into(),
        timestamp: 1,
        position: Some(Pose { x: 1.0, y: 1.0, deg: 0.0, on_mat: true }.into()),
        ..CubeUpdate::default()
    });

    let fleet = FleetOrchestrator::new(registry);
    let state = fleet.snapshot();
    assert_eq!(state.warnings, vec!["Cube A01 position unknown"]);
}

#[test]
fn assignment_carries_pose_and_priority() {
    let fleet = orchestrator();
    let mut req = request(&["A01"]);
    req.pose.angle = Some(45.0);
    req.priority = 5;
    fleet.assign_goal(&req).unwrap();

    let goal = &fleet.snapshot().active_goals[0];
    assert!((goal.pose.x - 200.0).abs() < f64::EPSILON);
    assert_eq!(goal.pose.angle, Some(45.0));
    assert_eq!(goal.priority, 5);
    assert!(goal.created_at > 0);
}
