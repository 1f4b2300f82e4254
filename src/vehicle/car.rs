//! Car-like vehicle: geometry, dynamic limits, bicycle kinematics and
//! footprint collision test.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::common::{align_angle, wrap_angle, DriveError, DriveResult, Point2D, Pose2D};
use crate::mapping::ObstacleSet;

/// Vehicle geometry and limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleConfig {
    /// Distance between rear and front axle [m]
    pub wheel_base: f64,
    /// Body length [m]
    pub length: f64,
    /// Body width [m]
    pub width: f64,
    /// Distance from the rear bumper to the rear axle [m]
    pub back_to_wheel: f64,
    /// Range of the simulated sensor [m]
    pub scan_radius: f64,
    /// Extra clearance added around the body in collision tests [m]
    pub collision_margin: f64,
    /// Forward speed limit [m/s]
    pub max_speed: f64,
    /// Reverse speed limit [m/s], negative
    pub min_speed: f64,
    /// Nominal cruising speed [m/s]
    pub target_speed: f64,
    /// Acceleration / deceleration limit [m/s^2]
    pub max_accel: f64,
    /// Steering angle limit [rad]
    pub max_steer: f64,
    /// Steering rate limit [rad/s]
    pub max_steer_speed: f64,
    /// Lateral acceleration limit used for speed profiling [m/s^2]
    pub max_centripetal_accel: f64,
}

impl Default for VehicleConfig {
    fn default() -> Self {
        Self {
            wheel_base: 2.5,
            length: 4.5,
            width: 2.0,
            back_to_wheel: 1.0,
            scan_radius: 10.0,
            collision_margin: 0.0,
            max_speed: 20.0 / 3.6,
            min_speed: -10.0 / 3.6,
            target_speed: 15.0 / 3.6,
            max_accel: 2.0,
            max_steer: 40.0 * PI / 180.0,
            max_steer_speed: 60.0 * PI / 180.0,
            max_centripetal_accel: 1.5,
        }
    }
}

impl VehicleConfig {
    /// Distance from the rear axle to the geometric centre of the body
    pub fn back_to_center(&self) -> f64 {
        self.length / 2.0 - self.back_to_wheel
    }

    /// Radius of the circle around the body centre enclosing the footprint
    pub fn bubble_radius(&self) -> f64 {
        (self.length / 2.0 + self.collision_margin).hypot(self.width / 2.0 + self.collision_margin)
    }

    /// Minimum turning radius at full steering lock
    pub fn min_turning_radius(&self) -> f64 {
        self.wheel_base / self.max_steer.tan()
    }

    pub fn validate(&self) -> DriveResult<()> {
        let positive = [
            ("wheel_base", self.wheel_base),
            ("length", self.length),
            ("width", self.width),
            ("scan_radius", self.scan_radius),
            ("max_speed", self.max_speed),
            ("target_speed", self.target_speed),
            ("max_accel", self.max_accel),
            ("max_steer", self.max_steer),
            ("max_steer_speed", self.max_steer_speed),
            ("max_centripetal_accel", self.max_centripetal_accel),
        ];
        for (name, value) in positive.iter() {
            if !(*value > 0.0) {
                return Err(DriveError::InvalidParameter(format!("{} must be positive, got {}", name, value)));
            }
        }
        if !(self.min_speed < 0.0) {
            return Err(DriveError::InvalidParameter(format!(
                "min_speed must be negative, got {}",
                self.min_speed
            )));
        }
        if self.max_steer >= PI / 2.0 {
            return Err(DriveError::InvalidParameter("max_steer must be below 90 degrees".to_string()));
        }
        if self.back_to_wheel < 0.0 || self.back_to_wheel > self.length {
            return Err(DriveError::InvalidParameter(
                "back_to_wheel must lie within the body length".to_string(),
            ));
        }
        Ok(())
    }
}

/// Vehicle state referenced at the rear axle
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VehicleState {
    pub x: f64,
    pub y: f64,
    /// Heading [rad], kept in (-pi, pi] by the simulator
    pub yaw: f64,
    /// Signed speed [m/s], the sign is the driving direction
    pub velocity: f64,
    /// Front wheel steering angle [rad]
    pub steer: f64,
}

impl VehicleState {
    pub fn new(x: f64, y: f64, yaw: f64) -> Self {
        Self { x, y, yaw, velocity: 0.0, steer: 0.0 }
    }

    pub fn from_pose(pose: Pose2D) -> Self {
        Self::new(pose.x, pose.y, pose.yaw)
    }

    pub fn pose(&self) -> Pose2D {
        Pose2D::new(self.x, self.y, self.yaw)
    }

    pub fn position(&self) -> Point2D {
        Point2D::new(self.x, self.y)
    }

    /// Centre of the body, where the range sensor is mounted
    pub fn center(&self, config: &VehicleConfig) -> Point2D {
        let d = config.back_to_center();
        Point2D::new(self.x + d * self.yaw.cos(), self.y + d * self.yaw.sin())
    }

    /// Advance one step toward `target_velocity` and `target_steer`
    ///
    /// Speed and steering move toward their targets no faster than the
    /// acceleration and steering-rate limits allow. Position and heading are
    /// integrated with the speed at the start of the step.
    pub fn update_with_control(
        &mut self,
        target_velocity: f64,
        target_steer: f64,
        dt: f64,
        config: &VehicleConfig,
        wrap_yaw: bool,
    ) {
        let max_dsteer = config.max_steer_speed * dt;
        let steer = target_steer
            .clamp(-config.max_steer, config.max_steer)
            .clamp(self.steer - max_dsteer, self.steer + max_dsteer);
        self.steer = steer;

        self.x += self.velocity * self.yaw.cos() * dt;
        self.y += self.velocity * self.yaw.sin() * dt;
        self.yaw += self.velocity / config.wheel_base * steer.tan() * dt;
        if wrap_yaw {
            self.yaw = wrap_angle(self.yaw);
        }

        let max_dv = config.max_accel * dt;
        self.velocity = target_velocity
            .clamp(config.min_speed, config.max_speed)
            .clamp(self.velocity - max_dv, self.velocity + max_dv);
    }

    /// Replace the heading by the equivalent angle closest to `target`
    pub fn align_yaw(&mut self, target: f64) {
        self.yaw = align_angle(self.yaw, target);
    }

    pub fn check_collision(&self, obstacles: &ObstacleSet, config: &VehicleConfig) -> bool {
        pose_collides(&self.pose(), obstacles, config)
    }
}

/// Whether any obstacle point lies inside the vehicle body at `pose`
///
/// Candidates are taken from the bubble around the body centre, then tested
/// against the oriented rectangle.
pub fn pose_collides(pose: &Pose2D, obstacles: &ObstacleSet, config: &VehicleConfig) -> bool {
    let (s, c) = pose.yaw.sin_cos();
    let d = config.back_to_center();
    let center = Point2D::new(pose.x + d * c, pose.y + d * s);
    obstacles
        .within(center, config.bubble_radius())
        .any(|p| point_in_footprint(pose, p, config))
}

/// Whether `point` lies inside the vehicle rectangle at `pose`
pub fn point_in_footprint(pose: &Pose2D, point: &Point2D, config: &VehicleConfig) -> bool {
    let (s, c) = pose.yaw.sin_cos();
    let dx = point.x - pose.x;
    let dy = point.y - pose.y;
    let rx = c * dx + s * dy;
    let ry = -s * dx + c * dy;
    let margin = config.collision_margin;
    rx >= -config.back_to_wheel - margin
        && rx <= config.length - config.back_to_wheel + margin
        && ry.abs() <= config.width / 2.0 + margin
}
