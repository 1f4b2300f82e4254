//! Watches the active trajectory for newly sensed obstacles

use log::{debug, info};

use crate::common::{Point2D, Trajectory, TrajectoryPoint};
use crate::mapping::{MapUpdate, ObstacleSet};
use crate::vehicle::{pose_collides, VehicleConfig, VehicleState};

/// Trajectory points searched ahead of the progress index per update
const PROGRESS_SEARCH_WINDOW: usize = 40;

#[derive(Debug, Clone, PartialEq)]
pub struct CollisionEvent {
    /// Index of the first trajectory point that collides
    pub index: usize,
    pub point: TrajectoryPoint,
}

/// Emits at most one collision per trajectory
pub struct CollisionMonitor {
    vehicle: VehicleConfig,
    trajectory: Option<Trajectory>,
    progress: usize,
    signalled: bool,
    cancelled: bool,
}

impl CollisionMonitor {
    pub fn new(vehicle: VehicleConfig) -> Self {
        Self { vehicle, trajectory: None, progress: 0, signalled: false, cancelled: false }
    }

    /// Start watching `trajectory`, re-arming the monitor
    pub fn set_trajectory(&mut self, trajectory: Trajectory) {
        self.trajectory = Some(trajectory);
        self.progress = 0;
        self.signalled = false;
        self.cancelled = false;
    }

    pub fn clear(&mut self) {
        self.trajectory = None;
        self.progress = 0;
    }

    /// Further checks are no-ops until the next trajectory
    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    pub fn is_armed(&self) -> bool {
        self.trajectory.is_some() && !self.signalled && !self.cancelled
    }

    /// Index of the trajectory point nearest to the vehicle, never decreasing
    pub fn progress(&self) -> usize {
        self.progress
    }

    /// Move the progress index forward to the first local minimum of the
    /// distance to `state`
    pub fn update_progress(&mut self, state: &VehicleState) {
        let trajectory = match &self.trajectory {
            Some(trajectory) => trajectory,
            None => return,
        };
        let position = state.position();
        let end = (self.progress + PROGRESS_SEARCH_WINDOW).min(trajectory.len());
        let mut best = self.progress;
        let mut best_distance = f64::INFINITY;
        for (i, p) in trajectory.points.iter().enumerate().take(end).skip(self.progress) {
            let d = p.position().distance(&position);
            if d < best_distance {
                best_distance = d;
                best = i;
            } else {
                break;
            }
        }
        self.progress = best;
    }

    /// Check obstacles revealed by one sensor update
    pub fn on_map_update(&mut self, update: &MapUpdate) -> Option<CollisionEvent> {
        self.check_new_obstacles(&update.new)
    }

    pub fn check_new_obstacles(&mut self, points: &[Point2D]) -> Option<CollisionEvent> {
        if points.is_empty() {
            return None;
        }
        let obstacles = ObstacleSet::new(points.to_vec());
        self.check(&obstacles)
    }

    /// Check the whole known set, used when a trajectory is first set
    pub fn check_known_set(&mut self, obstacles: &ObstacleSet) -> Option<CollisionEvent> {
        self.check(obstacles)
    }

    fn check(&mut self, obstacles: &ObstacleSet) -> Option<CollisionEvent> {
        if !self.is_armed() || obstacles.is_empty() {
            return None;
        }
        let trajectory = self.trajectory.as_ref()?;
        let hit = trajectory
            .points
            .iter()
            .enumerate()
            .skip(self.progress)
            .find(|(_, p)| pose_collides(&p.pose(), obstacles, &self.vehicle))
            .map(|(index, point)| CollisionEvent { index, point: *point });
        match &hit {
            Some(event) => {
                info!(
                    "collision ahead at trajectory point {} ({:.2}, {:.2})",
                    event.index, event.point.x, event.point.y
                );
                self.signalled = true;
            }
            None => debug!("{} obstacles clear of the trajectory", obstacles.len()),
        }
        hit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Direction;
    use std::sync::Arc;

    fn straight() -> Trajectory {
        Trajectory::from_points(
            (0..=40)
                .map(|i| TrajectoryPoint::new(i as f64 * 0.5, 0.0, 0.0, Direction::Forward, 0.0))
                .collect(),
        )
    }

    fn monitor() -> CollisionMonitor {
        let mut monitor = CollisionMonitor::new(VehicleConfig::default());
        monitor.set_trajectory(straight());
        monitor
    }

    #[test]
    fn test_signals_once_per_trajectory() {
        let mut monitor = monitor();
        let obstacle = vec![Point2D::new(12.0, 0.3)];
        let event = monitor.check_new_obstacles(&obstacle).unwrap();
        assert!(event.point.x < 12.0);
        assert!(!monitor.is_armed());
        assert!(monitor.check_new_obstacles(&obstacle).is_none());

        monitor.set_trajectory(straight());
        assert!(monitor.check_new_obstacles(&obstacle).is_some());
    }

    #[test]
    fn test_ignores_obstacles_off_the_path() {
        let mut monitor = monitor();
        assert!(monitor.check_new_obstacles(&[Point2D::new(10.0, 5.0)]).is_none());
        assert!(monitor.is_armed());
    }

    #[test]
    fn test_passed_section_is_not_checked() {
        let mut monitor = monitor();
        let mut state = VehicleState::new(0.0, 0.0, 0.0);
        for i in 0..=30 {
            state.x = i as f64 * 0.5;
            monitor.update_progress(&state);
        }
        assert_eq!(monitor.progress(), 30);
        // Behind the rear bumper of every remaining pose
        assert!(monitor.check_new_obstacles(&[Point2D::new(5.0, 0.0)]).is_none());
        assert!(monitor.check_new_obstacles(&[Point2D::new(18.0, 0.0)]).is_some());
    }

    #[test]
    fn test_cancel_silences_until_next_trajectory() {
        let mut monitor = monitor();
        monitor.cancel();
        let update = MapUpdate {
            known: Arc::new(ObstacleSet::new(vec![Point2D::new(12.0, 0.0)])),
            new: Arc::new(vec![Point2D::new(12.0, 0.0)]),
        };
        assert!(monitor.on_map_update(&update).is_none());
        assert!(monitor.check_known_set(&update.known).is_none());
        monitor.set_trajectory(straight());
        assert!(monitor.on_map_update(&update).is_some());
    }
}
