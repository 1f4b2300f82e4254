//! Reference trajectory for the tracker
//!
//! A planned trajectory is turned into an arclength-indexed profile of
//! `[x, y, v, yaw]`: the vehicle stops at every direction change and at the
//! goal, and speeds respect the deceleration and lateral acceleration limits.

use crate::common::{smooth_yaw, Direction, DriveError, DriveResult, Trajectory, TrajectoryPoint};
use crate::utils::spline::{cumulative_length, CubicSpline2D, LinearSpline};
use crate::vehicle::VehicleConfig;

/// Index of each channel in a reference sample
pub const X: usize = 0;
pub const Y: usize = 1;
pub const V: usize = 2;
pub const YAW: usize = 3;

#[derive(Debug, Clone, Copy)]
struct Row {
    x: f64,
    y: f64,
    yaw: f64,
    direction: f64,
}

impl Row {
    fn midpoint(&self, other: &Row, direction: f64) -> Row {
        Row {
            x: (self.x + other.x) / 2.0,
            y: (self.y + other.y) / 2.0,
            yaw: (self.yaw + other.yaw) / 2.0,
            direction,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReferenceTrajectory {
    spline: LinearSpline<4>,
    direction_changes: Vec<f64>,
}

impl ReferenceTrajectory {
    /// `brake_accel_ratio` is the share of the deceleration limit used when
    /// planning to stop
    pub fn new(trajectory: &Trajectory, vehicle: &VehicleConfig, brake_accel_ratio: f64) -> DriveResult<Self> {
        let mut rows: Vec<Row> = Vec::with_capacity(trajectory.len());
        for p in trajectory.points.iter() {
            if p.direction == Direction::Stop {
                return Err(DriveError::InvalidTrajectory(
                    "every point of a planned trajectory needs a driving direction".to_string(),
                ));
            }
            let duplicate = rows.last().map_or(false, |last| last.x == p.x && last.y == p.y);
            if !duplicate {
                rows.push(Row { x: p.x, y: p.y, yaw: p.yaw, direction: p.direction.sign() });
            }
        }
        if rows.len() < 2 {
            return Err(DriveError::InvalidTrajectory(format!(
                "need at least 2 distinct positions, got {}",
                rows.len()
            )));
        }
        let yaws: Vec<f64> = rows.iter().map(|r| r.yaw).collect();
        for (row, yaw) in rows.iter_mut().zip(smooth_yaw(&yaws)) {
            row.yaw = yaw;
        }

        // Stop on every direction change, with a half-way point on each side
        let mut profile: Vec<Row> = vec![rows[0]];
        for point in rows.iter().skip(1) {
            let last = profile[profile.len() - 1];
            if last.direction != point.direction {
                if profile.len() > 1 {
                    let before = profile[profile.len() - 2];
                    let n = profile.len();
                    profile[n - 1] = last.midpoint(&before, last.direction);
                    profile.push(Row { direction: 0.0, ..last });
                } else {
                    profile[0].direction = 0.0;
                }
                profile.push(point.midpoint(&last, point.direction));
            }
            profile.push(*point);
        }
        if let Some(goal) = profile.last_mut() {
            goal.direction = 0.0;
        }

        let xs: Vec<f64> = profile.iter().map(|r| r.x).collect();
        let ys: Vec<f64> = profile.iter().map(|r| r.y).collect();
        let u = cumulative_length(&xs, &ys);
        let mut v: Vec<f64> = profile
            .iter()
            .map(|r| (r.direction * vehicle.target_speed).clamp(vehicle.min_speed, vehicle.max_speed))
            .collect();

        let mut next_zero: Option<f64> = None;
        for i in (0..v.len()).rev() {
            if v[i] == 0.0 {
                next_zero = Some(u[i]);
            } else if let Some(zero) = next_zero {
                let limit = (2.0 * brake_accel_ratio * vehicle.max_accel * (zero - u[i])).sqrt();
                v[i] = v[i].clamp(-limit, limit);
            }
        }

        let mut direction_changes: Vec<f64> =
            u.iter().zip(v.iter()).filter(|&(_, &vi)| vi == 0.0).map(|(&ui, _)| ui).collect();
        direction_changes.pop();

        let shape = CubicSpline2D::new(&u, &xs, &ys)?;
        for (vi, &ui) in v.iter_mut().zip(u.iter()) {
            let limit = (vehicle.max_centripetal_accel / shape.calc_curvature(ui)).sqrt();
            *vi = vi.clamp(-limit, limit);
        }

        let values: Vec<[f64; 4]> = profile
            .iter()
            .zip(v.iter())
            .map(|(r, &vi)| [r.x, r.y, vi, r.yaw])
            .collect();
        Ok(Self { spline: LinearSpline::new(u, values)?, direction_changes })
    }

    /// `[x, y, v, yaw]` at arclength `u`
    pub fn sample(&self, u: f64) -> [f64; 4] {
        self.spline.evaluate(u)
    }

    pub fn length(&self) -> f64 {
        self.spline.end()
    }

    /// Arclengths where the vehicle reverses, the goal excluded
    pub fn direction_changes(&self) -> &[f64] {
        &self.direction_changes
    }

    /// First direction change strictly after `u`
    pub fn next_direction_change(&self, u: f64) -> f64 {
        let i = self.direction_changes.partition_point(|&c| c <= u);
        self.direction_changes.get(i).copied().unwrap_or(f64::INFINITY)
    }

    pub fn knots(&self) -> &[f64] {
        self.spline.knots()
    }

    pub fn points(&self) -> Vec<TrajectoryPoint> {
        self.spline.values().iter().map(|s| to_point(s)).collect()
    }
}

pub(crate) fn to_point(sample: &[f64; 4]) -> TrajectoryPoint {
    TrajectoryPoint::new(sample[X], sample[Y], sample[YAW], Direction::from_sign(sample[V]), sample[V])
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::PI;

    fn point(x: f64, y: f64, yaw: f64, direction: Direction) -> TrajectoryPoint {
        TrajectoryPoint::new(x, y, yaw, direction, 0.0)
    }

    #[test]
    fn test_straight_profile_stops_at_goal() {
        let vehicle = VehicleConfig::default();
        let points = (0..=40).map(|i| point(i as f64 * 0.5, 0.0, 0.0, Direction::Forward)).collect();
        let reference = ReferenceTrajectory::new(&Trajectory::from_points(points), &vehicle, 0.7).unwrap();
        assert_relative_eq!(reference.length(), 20.0, epsilon = 1e-9);
        assert!(reference.direction_changes().is_empty());
        assert_relative_eq!(reference.sample(0.0)[V], vehicle.target_speed, epsilon = 1e-9);
        assert_relative_eq!(reference.sample(20.0)[V], 0.0);
        // sqrt(2 * 0.7 * 2.0 * 1.0) just before the goal
        assert_relative_eq!(reference.sample(19.0)[V], (2.8_f64).sqrt(), epsilon = 1e-9);
    }

    #[test]
    fn test_single_reversal_inserts_one_stop() {
        let vehicle = VehicleConfig::default();
        let mut points: Vec<TrajectoryPoint> =
            (0..=20).map(|i| point(i as f64 * 0.5, 0.0, 0.0, Direction::Forward)).collect();
        points.extend((1..=20).map(|i| point(10.0 - i as f64 * 0.5, 0.0, 0.0, Direction::Backward)));
        let reference = ReferenceTrajectory::new(&Trajectory::from_points(points), &vehicle, 0.7).unwrap();

        assert_eq!(reference.direction_changes().len(), 1);
        let change = reference.direction_changes()[0];
        assert_relative_eq!(reference.sample(change)[X], 10.0, epsilon = 1e-9);

        let samples = reference.points();
        let interior_stops = samples[..samples.len() - 1].iter().filter(|p| p.speed == 0.0).count();
        assert_eq!(interior_stops, 1);
        assert!(reference.sample(change - 1.0)[V] > 0.0);
        assert!(reference.sample(change + 1.0)[V] < 0.0);
        assert_relative_eq!(reference.next_direction_change(0.0), change);
        assert!(reference.next_direction_change(change).is_infinite());
    }

    #[test]
    fn test_curvature_limits_speed_on_tight_arc() {
        let vehicle = VehicleConfig::default();
        let radius = 3.0;
        let points = (0..=60)
            .map(|i| {
                let t = i as f64 * 0.05;
                point(radius * t.sin(), radius * (1.0 - t.cos()), t, Direction::Forward)
            })
            .collect();
        let reference = ReferenceTrajectory::new(&Trajectory::from_points(points), &vehicle, 0.7).unwrap();
        assert!((vehicle.max_centripetal_accel * radius).sqrt() < vehicle.target_speed);

        let samples = reference.points();
        let xs: Vec<f64> = samples.iter().map(|p| p.x).collect();
        let ys: Vec<f64> = samples.iter().map(|p| p.y).collect();
        let shape = CubicSpline2D::new(reference.knots(), &xs, &ys).unwrap();
        let limits: Vec<f64> = reference
            .knots()
            .iter()
            .map(|&u| (vehicle.max_centripetal_accel / shape.calc_curvature(u)).sqrt())
            .collect();
        for (p, limit) in samples.iter().zip(limits.iter()) {
            assert!(p.speed.abs() <= limit + 1e-9);
        }
        // Away from the goal the lateral limit is the binding one
        let mid = samples.len() / 2;
        assert_relative_eq!(samples[mid].speed, limits[mid], epsilon = 1e-9);
    }

    #[test]
    fn test_yaw_is_unwrapped() {
        let vehicle = VehicleConfig::default();
        let points = vec![
            point(0.0, 0.0, PI - 0.05, Direction::Forward),
            point(-1.0, 0.0, -PI + 0.05, Direction::Forward),
            point(-2.0, 0.0, -PI + 0.1, Direction::Forward),
        ];
        let reference = ReferenceTrajectory::new(&Trajectory::from_points(points), &vehicle, 0.7).unwrap();
        let samples = reference.points();
        assert!((samples[1].yaw - samples[0].yaw).abs() < 0.2);
        assert!((samples[2].yaw - samples[1].yaw).abs() < 0.2);
    }

    #[test]
    fn test_rejects_degenerate_trajectories() {
        let vehicle = VehicleConfig::default();
        let single = Trajectory::from_points(vec![point(1.0, 1.0, 0.0, Direction::Forward); 3]);
        assert!(ReferenceTrajectory::new(&single, &vehicle, 0.7).is_err());
        let stop = Trajectory::from_points(vec![
            point(0.0, 0.0, 0.0, Direction::Forward),
            point(1.0, 0.0, 0.0, Direction::Stop),
        ]);
        assert!(ReferenceTrajectory::new(&stop, &vehicle, 0.7).is_err());
    }
}
