//! Common types used throughout autonomous_driving

use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// 2D point representation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point2D {
    pub x: f64,
    pub y: f64,
}

impl Point2D {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn origin() -> Self {
        Self { x: 0.0, y: 0.0 }
    }

    pub fn distance(&self, other: &Point2D) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }

    pub fn to_vector(&self) -> Vector2<f64> {
        Vector2::new(self.x, self.y)
    }
}

impl From<(f64, f64)> for Point2D {
    fn from(tuple: (f64, f64)) -> Self {
        Self { x: tuple.0, y: tuple.1 }
    }
}

/// 2D pose (position + orientation)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose2D {
    pub x: f64,
    pub y: f64,
    pub yaw: f64,
}

impl Pose2D {
    pub fn new(x: f64, y: f64, yaw: f64) -> Self {
        Self { x, y, yaw }
    }

    pub fn position(&self) -> Point2D {
        Point2D::new(self.x, self.y)
    }

    pub fn to_vector(&self) -> Vector3<f64> {
        Vector3::new(self.x, self.y, self.yaw)
    }

    /// Heading difference to `other`, wrapped into (-pi, pi]
    pub fn yaw_error(&self, other: &Pose2D) -> f64 {
        wrap_angle(self.yaw - other.yaw)
    }
}

/// Wrap an angle into (-pi, pi]
pub fn wrap_angle(angle: f64) -> f64 {
    let a = angle.rem_euclid(2.0 * PI);
    if a > PI {
        a - 2.0 * PI
    } else {
        a
    }
}

/// Unwrap a heading sequence so that adjacent values never jump by more than pi
pub fn smooth_yaw(yaws: &[f64]) -> Vec<f64> {
    let mut smoothed = Vec::with_capacity(yaws.len());
    for (i, &yaw) in yaws.iter().enumerate() {
        if i == 0 {
            smoothed.push(yaw);
            continue;
        }
        let prev = smoothed[i - 1];
        smoothed.push(prev + wrap_angle(yaw - prev));
    }
    smoothed
}

/// Equivalent angle of `angle` that is closest to `target`
pub fn align_angle(angle: f64, target: f64) -> f64 {
    target + wrap_angle(angle - target)
}

/// Sign of `value` with `0.0` mapping to `0.0`
pub fn sign(value: f64) -> f64 {
    if value > 0.0 {
        1.0
    } else if value < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// Driving direction attached to every trajectory point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Forward,
    Backward,
    /// The vehicle must be stationary at this point
    Stop,
}

impl Direction {
    pub fn sign(self) -> f64 {
        match self {
            Direction::Forward => 1.0,
            Direction::Backward => -1.0,
            Direction::Stop => 0.0,
        }
    }

    pub fn from_sign(value: f64) -> Self {
        if value > 0.0 {
            Direction::Forward
        } else if value < 0.0 {
            Direction::Backward
        } else {
            Direction::Stop
        }
    }
}

/// One pose of a drivable trajectory
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryPoint {
    pub x: f64,
    pub y: f64,
    pub yaw: f64,
    pub direction: Direction,
    /// Target speed [m/s], signed like `direction`
    pub speed: f64,
}

impl TrajectoryPoint {
    pub fn new(x: f64, y: f64, yaw: f64, direction: Direction, speed: f64) -> Self {
        Self { x, y, yaw, direction, speed }
    }

    pub fn pose(&self) -> Pose2D {
        Pose2D::new(self.x, self.y, self.yaw)
    }

    pub fn position(&self) -> Point2D {
        Point2D::new(self.x, self.y)
    }
}

/// Ordered sequence of poses produced by the global planner
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Trajectory {
    pub points: Vec<TrajectoryPoint>,
}

impl Trajectory {
    pub fn new() -> Self {
        Self { points: Vec::new() }
    }

    pub fn from_points(points: Vec<TrajectoryPoint>) -> Self {
        Self { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn first(&self) -> Option<&TrajectoryPoint> {
        self.points.first()
    }

    pub fn last(&self) -> Option<&TrajectoryPoint> {
        self.points.last()
    }

    pub fn x_coords(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.x).collect()
    }

    pub fn y_coords(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.y).collect()
    }

    pub fn total_length(&self) -> f64 {
        self.points
            .windows(2)
            .map(|w| w[0].position().distance(&w[1].position()))
            .sum()
    }

    /// Number of direction reversals between consecutive moving points
    pub fn direction_changes(&self) -> usize {
        let moving: Vec<Direction> = self
            .points
            .iter()
            .map(|p| p.direction)
            .filter(|d| *d != Direction::Stop)
            .collect();
        moving.windows(2).filter(|w| w[0] != w[1]).count()
    }
}
