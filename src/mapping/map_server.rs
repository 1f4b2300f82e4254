//! Map / sensing service
//!
//! Owns the obstacle ground truth and the monotone "known" subset revealed by a
//! range sensor mounted at the body centre of the vehicle.

use log::{debug, info};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::sync::Arc;

use crate::common::{DriveError, DriveResult, Point2D};
use crate::mapping::obstacles::{MapBounds, ObstacleSet};
use crate::vehicle::{VehicleConfig, VehicleState};

const MAX_POSE_SAMPLES: usize = 10_000;

/// Layout of the generated map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapConfig {
    /// Map width [m]
    pub width: f64,
    /// Map height [m]
    pub height: f64,
    /// Spacing of wall points [m]
    pub step: f64,
    /// Number of randomly placed point obstacles
    pub num_random_obstacles: usize,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            width: 60.0,
            height: 60.0,
            step: 1.0,
            num_random_obstacles: 40,
        }
    }
}

impl MapConfig {
    pub fn validate(&self) -> DriveResult<()> {
        if !(self.width > 0.0 && self.height > 0.0) {
            return Err(DriveError::InvalidParameter("map size must be positive".to_string()));
        }
        if !(self.step > 0.0) {
            return Err(DriveError::InvalidParameter(format!("map step must be positive, got {}", self.step)));
        }
        Ok(())
    }

    pub fn bounds(&self) -> DriveResult<MapBounds> {
        MapBounds::new(0.0, 0.0, self.width, self.height)
    }
}

fn arange(start: f64, stop: f64, step: f64) -> impl Iterator<Item = f64> {
    let n = ((stop - start) / step).ceil().max(0.0) as usize;
    (0..n).map(move |i| start + i as f64 * step)
}

/// Boundary walls, two staggered interior walls and random point obstacles
pub fn generate_obstacles<R: Rng>(config: &MapConfig, rng: &mut R) -> Vec<Point2D> {
    let (w, h, step) = (config.width, config.height, config.step);
    let mut points = Vec::new();

    points.extend(arange(0.0, w, step).map(|x| Point2D::new(x, 0.0)));
    points.extend(arange(0.0, h, step).map(|y| Point2D::new(w, y)));
    points.extend(arange(0.0, w + step, step).map(|x| Point2D::new(x, h)));
    points.extend(arange(0.0, h + step, step).map(|y| Point2D::new(0.0, y)));

    points.extend(arange(0.0, h * 2.0 / 3.0, step).map(|y| Point2D::new(w / 3.0, y)));
    points.extend(arange(0.0, h * 2.0 / 3.0, step).map(|y| Point2D::new(2.0 * w / 3.0, h - y)));

    for _ in 0..config.num_random_obstacles {
        points.push(Point2D::new(rng.gen_range(0.0..w), rng.gen_range(0.0..h)));
    }
    points
}

/// Collision-free vehicle state with a uniformly sampled pose
pub fn random_free_state<R: Rng>(
    obstacles: &ObstacleSet,
    bounds: &MapBounds,
    vehicle: &VehicleConfig,
    rng: &mut R,
) -> DriveResult<VehicleState> {
    for _ in 0..MAX_POSE_SAMPLES {
        let state = VehicleState::new(
            rng.gen_range(bounds.min_x..bounds.max_x),
            rng.gen_range(bounds.min_y..bounds.max_y),
            rng.gen_range(-PI..PI),
        );
        if !state.check_collision(obstacles, vehicle) {
            return Ok(state);
        }
    }
    Err(DriveError::InvalidParameter(format!(
        "no collision-free pose found after {} samples",
        MAX_POSE_SAMPLES
    )))
}

/// Change of the known obstacle set caused by one sensor update
#[derive(Debug, Clone)]
pub struct MapUpdate {
    /// Whole known set after the update
    pub known: Arc<ObstacleSet>,
    /// Points revealed by this update only
    pub new: Arc<Vec<Point2D>>,
}

/// Ground truth plus the monotonically growing known subset
pub struct MapServer {
    vehicle: VehicleConfig,
    bounds: MapBounds,
    ground_truth: ObstacleSet,
    known_mask: Vec<bool>,
    known: Arc<ObstacleSet>,
}

impl MapServer {
    /// Map with the given ground truth and nothing known yet
    pub fn new(obstacles: Vec<Point2D>, bounds: MapBounds, vehicle: VehicleConfig) -> Self {
        let known_mask = vec![false; obstacles.len()];
        Self {
            vehicle,
            bounds,
            ground_truth: ObstacleSet::new(obstacles),
            known_mask,
            known: Arc::new(ObstacleSet::empty()),
        }
    }

    /// Randomly generated map
    pub fn generate<R: Rng>(config: &MapConfig, vehicle: VehicleConfig, rng: &mut R) -> DriveResult<Self> {
        config.validate()?;
        let obstacles = generate_obstacles(config, rng);
        info!("generated map with {} obstacles", obstacles.len());
        Ok(Self::new(obstacles, config.bounds()?, vehicle))
    }

    pub fn bounds(&self) -> MapBounds {
        self.bounds
    }

    pub fn ground_truth(&self) -> &ObstacleSet {
        &self.ground_truth
    }

    pub fn known_obstacles(&self) -> Arc<ObstacleSet> {
        Arc::clone(&self.known)
    }

    pub fn unknown_obstacles(&self) -> Vec<Point2D> {
        self.ground_truth
            .points()
            .iter()
            .zip(self.known_mask.iter())
            .filter(|(_, known)| !**known)
            .map(|(p, _)| *p)
            .collect()
    }

    /// Reveal everything within sensor range of `state`
    ///
    /// Returns `None` when the known set did not grow.
    pub fn update(&mut self, state: &VehicleState) -> Option<MapUpdate> {
        let center = state.center(&self.vehicle);
        let mut revealed: Vec<usize> = self
            .ground_truth
            .within_indices(center, self.vehicle.scan_radius)
            .filter(|&i| !self.known_mask[i])
            .collect();
        if revealed.is_empty() {
            return None;
        }
        revealed.sort_unstable();
        let new: Vec<Point2D> = revealed
            .iter()
            .map(|&i| {
                self.known_mask[i] = true;
                self.ground_truth.points()[i]
            })
            .collect();
        self.known = Arc::new(self.known.extended(&new));
        debug!("sensor revealed {} obstacles, {} known", new.len(), self.known.len());
        Some(MapUpdate {
            known: Arc::clone(&self.known),
            new: Arc::new(new),
        })
    }

    pub fn random_initial_state<R: Rng>(&self, rng: &mut R) -> DriveResult<VehicleState> {
        random_free_state(&self.ground_truth, &self.bounds, &self.vehicle, rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn wall_server() -> MapServer {
        let mut points = Vec::new();
        for i in 0..40 {
            points.push(Point2D::new(20.0, i as f64));
        }
        points.push(Point2D::new(5.0, 5.0));
        MapServer::new(points, MapBounds::new(0.0, 0.0, 40.0, 40.0).unwrap(), VehicleConfig::default())
    }

    #[test]
    fn test_generated_map_has_walls() {
        let mut rng = StdRng::seed_from_u64(7);
        let config = MapConfig::default();
        let obstacles = generate_obstacles(&config, &mut rng);
        assert!(obstacles.len() > 240);
        assert!(obstacles.iter().all(|p| p.x >= 0.0 && p.x <= 60.0 && p.y >= 0.0 && p.y <= 60.0));
        assert!(obstacles.iter().any(|p| p.x == 20.0 && p.y == 10.0));
    }

    #[test]
    fn test_known_set_grows_monotonically() {
        let mut server = wall_server();
        assert!(server.known_obstacles().is_empty());

        let mut state = VehicleState::new(2.0, 2.0, 0.0);
        let first = server.update(&state).expect("obstacle at (5, 5) is in range");
        assert_eq!(first.new.len(), 1);
        assert_eq!(first.known.len(), 1);

        assert!(server.update(&state).is_none());

        state.x = 12.0;
        state.y = 10.0;
        let second = server.update(&state).expect("wall comes into range");
        assert!(second.new.iter().all(|p| p.x == 20.0));
        assert_eq!(second.known.len(), 1 + second.new.len());
        assert_eq!(server.unknown_obstacles().len(), 41 - second.known.len());
    }

    #[test]
    fn test_random_initial_state_is_free() {
        let mut rng = StdRng::seed_from_u64(3);
        let config = MapConfig::default();
        let server = MapServer::generate(&config, VehicleConfig::default(), &mut rng).unwrap();
        for _ in 0..10 {
            let state = server.random_initial_state(&mut rng).unwrap();
            assert!(!state.check_collision(server.ground_truth(), &VehicleConfig::default()));
        }
    }
}
