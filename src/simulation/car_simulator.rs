//! Fixed-timestep car simulation driven by tracker control sequences

use log::debug;
use serde::{Deserialize, Serialize};

use crate::common::{sign, DriveError, DriveResult};
use crate::path_tracking::Control;
use crate::utils::spline::LinearSpline;
use crate::vehicle::{VehicleConfig, VehicleState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Integration step [s]
    pub delta_time: f64,
    /// Wall-clock period of the real-time loop [s]
    pub interval: f64,
    /// Period of measured state publication [s]
    pub publish_interval: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self { delta_time: 0.015, interval: 0.02, publish_interval: 0.05 }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> DriveResult<()> {
        if !(self.delta_time > 0.0 && self.interval > 0.0 && self.publish_interval > 0.0) {
            return Err(DriveError::InvalidParameter("simulation periods must be positive".to_string()));
        }
        if self.publish_interval < self.delta_time {
            return Err(DriveError::InvalidParameter(format!(
                "publish interval {} is shorter than the time step {}",
                self.publish_interval, self.delta_time
            )));
        }
        Ok(())
    }
}

/// Target velocity and steer over time
///
/// Interpolated linearly between timestamps and held after the last one.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlSequence {
    spline: LinearSpline<2>,
}

impl ControlSequence {
    pub fn new(timestamps: Vec<f64>, targets: Vec<[f64; 2]>) -> DriveResult<Self> {
        Ok(Self { spline: LinearSpline::new(timestamps, targets)? })
    }

    /// Velocities integrated from the accelerations of `controls`, one
    /// control every `dt` starting at `start_time`
    pub fn from_controls(start_time: f64, velocity: f64, controls: &[Control], dt: f64) -> DriveResult<Self> {
        let mut v = velocity;
        let mut timestamps = Vec::with_capacity(controls.len());
        let mut targets = Vec::with_capacity(controls.len());
        for (i, c) in controls.iter().enumerate() {
            v += c.acceleration * dt;
            timestamps.push(start_time + i as f64 * dt);
            targets.push([v, c.steer]);
        }
        Self::new(timestamps, targets)
    }

    /// Full deceleration from `state` to a standstill, steering held
    pub fn braking(start_time: f64, state: &VehicleState, max_accel: f64, dt: f64) -> DriveResult<Self> {
        if !(max_accel > 0.0 && dt > 0.0) {
            return Err(DriveError::InvalidParameter(
                "braking needs a positive deceleration and time step".to_string(),
            ));
        }
        let speed = state.velocity.abs();
        let steps = (speed / (max_accel * dt)).ceil() as usize;
        let direction = sign(state.velocity);
        let mut timestamps = Vec::with_capacity(steps + 1);
        let mut targets = Vec::with_capacity(steps + 1);
        for k in 0..=steps {
            let remaining = (speed - max_accel * dt * k as f64).max(0.0);
            timestamps.push(start_time + k as f64 * dt);
            targets.push([direction * remaining, state.steer]);
        }
        Self::new(timestamps, targets)
    }

    pub fn start_time(&self) -> f64 {
        self.spline.start()
    }

    pub fn end_time(&self) -> f64 {
        self.spline.end()
    }

    /// (target velocity, target steer) at `time`
    pub fn sample(&self, time: f64) -> (f64, f64) {
        let [velocity, steer] = self.spline.evaluate(time);
        (velocity, steer)
    }
}

/// State published at the measurement rate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeasuredState {
    pub timestamp: f64,
    pub state: VehicleState,
}

pub struct CarSimulator {
    config: SimulationConfig,
    vehicle: VehicleConfig,
    state: VehicleState,
    time: f64,
    controls: Option<ControlSequence>,
    next_publish: f64,
}

impl CarSimulator {
    pub fn new(config: SimulationConfig, vehicle: VehicleConfig, state: VehicleState) -> DriveResult<Self> {
        config.validate()?;
        vehicle.validate()?;
        Ok(Self { config, vehicle, state, time: 0.0, controls: None, next_publish: 0.0 })
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn state(&self) -> VehicleState {
        self.state
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn measured(&self) -> MeasuredState {
        MeasuredState { timestamp: self.time, state: self.state }
    }

    pub fn has_controls(&self) -> bool {
        self.controls.is_some()
    }

    /// Teleport the vehicle; it stands still until new controls arrive
    pub fn set_state(&mut self, state: VehicleState) {
        self.state = state;
        self.controls = None;
        self.next_publish = self.time;
    }

    pub fn set_control_sequence(&mut self, controls: ControlSequence) {
        self.controls = Some(controls);
    }

    /// Drop the control sequence; the vehicle decelerates to a standstill
    pub fn stop(&mut self) {
        if self.controls.take().is_some() {
            debug!("simulator stopping at t = {:.2}", self.time);
        }
    }

    /// Advance one time step, returning the state when it is due for publication
    pub fn step(&mut self) -> Option<MeasuredState> {
        self.time += self.config.delta_time;
        let (velocity, steer) = match &self.controls {
            Some(controls) => controls.sample(self.time),
            None => (0.0, self.state.steer),
        };
        self.state.update_with_control(velocity, steer, self.config.delta_time, &self.vehicle, true);

        if self.time + 1e-9 >= self.next_publish {
            self.next_publish += self.config.publish_interval;
            while self.next_publish <= self.time {
                self.next_publish += self.config.publish_interval;
            }
            Some(self.measured())
        } else {
            None
        }
    }

    /// Step until the clock reaches `time`, collecting published states
    pub fn advance_to(&mut self, time: f64) -> Vec<MeasuredState> {
        let mut published = Vec::new();
        while self.time + self.config.delta_time <= time + 1e-9 {
            if let Some(measured) = self.step() {
                published.push(measured);
            }
        }
        published
    }
}
