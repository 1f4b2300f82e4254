// Model Predictive Control (MPC) for trajectory tracking
//
// The nonlinear bicycle model is linearized around the motion predicted from
// the previous control guess. Each linearization is condensed into a dense QP
// over the control sequence and solved until the controls stop changing.

use log::{debug, error, info, warn};
use nalgebra::{DMatrix, DVector, Matrix4, Matrix4x2, Vector4};
use serde::{Deserialize, Serialize};

use super::qp_solver::{self, QpProblem, QpSettings, QpStatus};
use super::reference::{to_point, ReferenceTrajectory, V, X, Y, YAW};
use crate::common::{sign, Direction, DriveError, DriveResult, Trajectory, TrajectoryPoint};
use crate::vehicle::{VehicleConfig, VehicleState};

const NX: usize = 4; // state dimension [x, y, v, yaw]
const NU: usize = 2; // control dimension [accel, steer]

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MpcConfig {
    /// Prediction horizon [steps]
    pub horizon: usize,
    /// Sequential linearization iterations per update
    pub max_iterations: usize,
    /// Control change below which the iteration has converged
    pub du_threshold: f64,
    /// Shortest reference window [m]
    pub min_horizon_distance: f64,
    /// How far ahead of the cursor the nearest point is searched [m]
    pub nearest_search_range: f64,
    pub nearest_search_step: f64,
    /// A direction change closer than this to the cursor is skipped over [m]
    pub direction_change_distance: f64,
    /// Share of the deceleration limit used when planning to stop
    pub brake_accel_ratio: f64,
    /// Spacing of the braking trajectory samples [m]
    pub brake_resolution: f64,
    pub allow_steer_change_on_first_point: bool,
    /// R over [accel, steer]
    pub input_weight: [f64; 2],
    /// R_D over the control rate
    pub input_rate_weight: [f64; 2],
    /// Q over [x, y, v, yaw]
    pub state_weight: [f64; 4],
    /// Q_F on the last predicted state
    pub final_state_weight: [f64; 4],
    /// Consecutive infeasible updates tolerated before an emergency stop
    pub max_infeasible_ticks: usize,
    pub qp: QpSettings,
}

impl Default for MpcConfig {
    fn default() -> Self {
        let state_weight = [1.1, 1.1, 0.05, 1.1];
        Self {
            horizon: 5,
            max_iterations: 5,
            du_threshold: 0.1,
            min_horizon_distance: 0.3,
            nearest_search_range: 20.0,
            nearest_search_step: 0.1,
            direction_change_distance: 0.1,
            brake_accel_ratio: 0.7,
            brake_resolution: 0.5,
            allow_steer_change_on_first_point: false,
            input_weight: [0.01, 0.005],
            input_rate_weight: [1e-5, 1e-3],
            state_weight,
            final_state_weight: state_weight.map(|w| 2.0 * w),
            max_infeasible_ticks: 3,
            qp: QpSettings::default(),
        }
    }
}

impl MpcConfig {
    pub fn validate(&self) -> DriveResult<()> {
        if self.horizon == 0 || self.max_iterations == 0 {
            return Err(DriveError::InvalidParameter(
                "MPC horizon and iteration count must be positive".to_string(),
            ));
        }
        let positive = [
            ("du_threshold", self.du_threshold),
            ("min_horizon_distance", self.min_horizon_distance),
            ("nearest_search_range", self.nearest_search_range),
            ("nearest_search_step", self.nearest_search_step),
            ("brake_resolution", self.brake_resolution),
        ];
        for (name, value) in positive.iter() {
            if !(*value > 0.0) {
                return Err(DriveError::InvalidParameter(format!("{} must be positive, got {}", name, value)));
            }
        }
        if !(self.brake_accel_ratio > 0.0 && self.brake_accel_ratio <= 1.0) {
            return Err(DriveError::InvalidParameter(format!(
                "brake_accel_ratio must lie in (0, 1], got {}",
                self.brake_accel_ratio
            )));
        }
        if self.direction_change_distance < 0.0 {
            return Err(DriveError::InvalidParameter("direction_change_distance must not be negative".to_string()));
        }
        let weights = self
            .input_weight
            .iter()
            .chain(self.input_rate_weight.iter())
            .chain(self.state_weight.iter())
            .chain(self.final_state_weight.iter());
        for w in weights {
            if !(*w >= 0.0) {
                return Err(DriveError::InvalidParameter(format!("MPC weights must not be negative, got {}", w)));
            }
        }
        self.qp.validate()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Control {
    /// [m/s^2]
    pub acceleration: f64,
    /// [rad]
    pub steer: f64,
}

#[derive(Debug, Clone)]
pub struct MpcResult {
    /// One control per horizon step
    pub controls: Vec<Control>,
    /// Predicted states, the current one first
    pub states: Vec<TrajectoryPoint>,
    /// Reference the prediction was fitted to
    pub references: Vec<TrajectoryPoint>,
    pub brake_trajectory: Vec<TrajectoryPoint>,
    /// Linearizations solved this update
    pub iterations: usize,
}

#[derive(Debug, Clone)]
pub enum MpcOutcome {
    Converged(MpcResult),
    /// Iteration cap reached; the last iterate is still usable
    NotConverged(MpcResult),
    /// No feasible control this update; the previous command stays in effect
    Infeasible,
    /// Infeasible for too long; braking has been committed
    EmergencyStop { brake_trajectory: Vec<TrajectoryPoint> },
}

impl MpcOutcome {
    pub fn result(&self) -> Option<&MpcResult> {
        match self {
            MpcOutcome::Converged(result) | MpcOutcome::NotConverged(result) => Some(result),
            _ => None,
        }
    }
}

/// Linearized state-space matrices at an operating point
fn linear_model(v: f64, phi: f64, delta: f64, dt: f64, wb: f64) -> (Matrix4<f64>, Matrix4x2<f64>, Vector4<f64>) {
    let a = Matrix4::new(
        1.0, 0.0, dt * phi.cos(), -dt * v * phi.sin(),
        0.0, 1.0, dt * phi.sin(), dt * v * phi.cos(),
        0.0, 0.0, 1.0, 0.0,
        0.0, 0.0, dt * delta.tan() / wb, 1.0,
    );

    let b = Matrix4x2::new(
        0.0, 0.0,
        0.0, 0.0,
        dt, 0.0,
        0.0, dt * v / (wb * delta.cos().powi(2)),
    );

    let c = Vector4::new(
        dt * v * phi.sin() * phi,
        -dt * v * phi.cos() * phi,
        0.0,
        -dt * v * delta / (wb * delta.cos().powi(2)),
    );

    (a, b, c)
}

fn state_row(state: &VehicleState) -> [f64; 4] {
    [state.x, state.y, state.velocity, state.yaw]
}

pub struct ModelPredictiveControl {
    config: MpcConfig,
    vehicle: VehicleConfig,
    reference: ReferenceTrajectory,
    cursor: f64,
    u_limit: f64,
    brake_requested: bool,
    braked: bool,
    brake_trajectory: Vec<TrajectoryPoint>,
    brake_limit: f64,
    infeasible_ticks: usize,
}

impl ModelPredictiveControl {
    pub fn new(trajectory: &Trajectory, config: MpcConfig, vehicle: VehicleConfig) -> DriveResult<Self> {
        config.validate()?;
        vehicle.validate()?;
        let reference = ReferenceTrajectory::new(trajectory, &vehicle, config.brake_accel_ratio)?;
        let u_limit = reference.length();
        Ok(Self {
            config,
            vehicle,
            reference,
            cursor: 0.0,
            u_limit,
            brake_requested: false,
            braked: false,
            brake_trajectory: Vec::new(),
            brake_limit: u_limit,
            infeasible_ticks: 0,
        })
    }

    /// Stop as soon as the deceleration limit allows
    ///
    /// The braking trajectory is frozen on the next update.
    pub fn brake(&mut self) {
        self.brake_requested = true;
    }

    pub fn is_braking(&self) -> bool {
        self.brake_requested
    }

    pub fn is_braked(&self) -> bool {
        self.braked
    }

    pub fn brake_trajectory(&self) -> &[TrajectoryPoint] {
        &self.brake_trajectory
    }

    /// Arclength of the reference point nearest to the vehicle
    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    pub fn reference(&self) -> &ReferenceTrajectory {
        &self.reference
    }

    /// Compute the controls for the next horizon from `state`
    pub fn update(&mut self, state: &VehicleState, dt: f64) -> DriveResult<MpcOutcome> {
        if !(dt > 0.0) {
            return Err(DriveError::InvalidParameter(format!("MPC time step must be positive, got {}", dt)));
        }
        let xref = self.reference_window(state, dt);

        let mut state = *state;
        state.align_yaw(xref[0][YAW]);

        let mut controls = vec![Control::default(); self.config.horizon];
        let mut predicted: Option<Vec<[f64; 4]>> = None;
        let mut iterations = 0;
        let mut converged = false;
        for _ in 0..self.config.max_iterations {
            let xbar = self.predict_motion(&state, &controls, dt);
            let (next, states) = match self.solve_linearized(&xref, &xbar, state.steer, dt, &controls)? {
                Some(solution) => solution,
                None => break,
            };
            let du = controls
                .iter()
                .zip(next.iter())
                .map(|(p, n)| (n.acceleration - p.acceleration).powi(2) + (n.steer - p.steer).powi(2))
                .sum::<f64>()
                .sqrt();
            controls = next;
            predicted = Some(states);
            iterations += 1;
            if du < self.config.du_threshold {
                converged = true;
                break;
            }
        }

        let states = match predicted {
            Some(states) => states,
            None => return Ok(self.skip_update()),
        };
        self.infeasible_ticks = 0;
        let result = MpcResult {
            controls,
            states: states.iter().map(to_point).collect(),
            references: xref.iter().map(to_point).collect(),
            brake_trajectory: self.brake_trajectory.clone(),
            iterations,
        };
        if converged {
            debug!("MPC converged in {} iterations at u = {:.2}", iterations, self.cursor);
            Ok(MpcOutcome::Converged(result))
        } else {
            warn!("MPC did not converge in {} iterations", iterations);
            Ok(MpcOutcome::NotConverged(result))
        }
    }

    fn skip_update(&mut self) -> MpcOutcome {
        self.infeasible_ticks += 1;
        if self.infeasible_ticks > self.config.max_infeasible_ticks {
            error!("MPC infeasible for {} consecutive updates, emergency stop", self.infeasible_ticks);
            self.brake_requested = true;
            if !self.braked {
                self.braked = true;
                self.u_limit = self.brake_limit;
            }
            return MpcOutcome::EmergencyStop { brake_trajectory: self.brake_trajectory.clone() };
        }
        warn!("MPC infeasible, keeping the previous command ({} in a row)", self.infeasible_ticks);
        MpcOutcome::Infeasible
    }

    /// Advance the cursor while the reference keeps getting closer
    fn find_nearest_point(&mut self, state: &VehicleState) {
        let step = self.config.nearest_search_step;
        let limit = self.u_limit.min(self.cursor + self.config.nearest_search_range);
        let count = ((limit + step / 2.0 - self.cursor) / step).ceil().max(0.0) as usize;
        let mut min_distance = f64::INFINITY;
        let mut nearest = self.cursor;
        for k in 0..count {
            let u = self.cursor + k as f64 * step;
            let p = self.reference.sample(u);
            let d = (p[X] - state.x).hypot(p[Y] - state.y);
            if d < min_distance {
                min_distance = d;
                nearest = u;
            } else {
                break;
            }
        }
        self.cursor = nearest.min(self.u_limit);
    }

    /// Reference states over the horizon, starting at the cursor
    fn reference_window(&mut self, state: &VehicleState, dt: f64) -> Vec<[f64; 4]> {
        let horizon = self.config.horizon;
        loop {
            self.find_nearest_point(state);

            let v = sign(self.reference.sample(self.cursor)[V]) * state.velocity;
            let length = (v.max(0.0) * dt * horizon as f64).max(self.config.min_horizon_distance);
            let ref_u: Vec<f64> = (0..=horizon)
                .map(|k| (self.cursor + length * k as f64 / horizon as f64).min(self.u_limit))
                .collect();
            let mut xref: Vec<[f64; 4]> = ref_u.iter().map(|&u| self.reference.sample(u)).collect();

            let changing_point = self.reference.next_direction_change(self.cursor);
            if ref_u[horizon] >= changing_point {
                if self.cursor + self.config.direction_change_distance >= changing_point {
                    debug!("skipping to the direction change at u = {:.2}", changing_point);
                    self.cursor = changing_point;
                    continue;
                }
                // Stop at the direction change
                let kept = ref_u.partition_point(|&u| u <= changing_point);
                xref.truncate(kept);
                let stop = self.reference.sample(changing_point);
                xref.resize(horizon + 1, stop);
            }

            if !self.braked {
                self.update_brake_trajectory(state, changing_point);
            }

            if self.brake_requested {
                for x in xref.iter_mut() {
                    x[V] = 0.0;
                }
                xref[horizon][V] = -0.5 * state.velocity;
            } else if ref_u[horizon] == self.u_limit {
                for (x, &u) in xref.iter_mut().zip(ref_u.iter()) {
                    if u == self.u_limit {
                        x[V] = 0.0;
                    }
                }
                xref[horizon][V] = -0.5 * state.velocity;
            }
            return xref;
        }
    }

    fn update_brake_trajectory(&mut self, state: &VehicleState, changing_point: f64) {
        let brake_length =
            state.velocity.powi(2) / (2.0 * self.vehicle.max_accel * self.config.brake_accel_ratio);
        let brake_limit = self.u_limit.min(self.cursor + brake_length).min(changing_point);
        let step = self.config.brake_resolution;
        let count = ((brake_limit + step / 2.0 - self.cursor) / step).ceil().max(1.0) as usize;
        let samples: Vec<[f64; 4]> = (0..count).map(|k| self.reference.sample(self.cursor + k as f64 * step)).collect();
        let direction = Direction::from_sign(samples.iter().map(|s| s[V]).sum());
        self.brake_trajectory = samples
            .iter()
            .map(|s| TrajectoryPoint::new(s[X], s[Y], s[YAW], direction, 0.0))
            .collect();
        self.brake_limit = brake_limit;
        if self.brake_requested {
            info!("braking, stopping at u = {:.2}", brake_limit);
            self.braked = true;
            self.u_limit = brake_limit;
        }
    }

    fn predict_motion(&self, state: &VehicleState, controls: &[Control], dt: f64) -> Vec<[f64; 4]> {
        let mut s = *state;
        let mut xbar = Vec::with_capacity(controls.len() + 1);
        xbar.push(state_row(&s));
        for c in controls {
            s.update_with_control(s.velocity + c.acceleration * dt, c.steer, dt, &self.vehicle, false);
            xbar.push(state_row(&s));
        }
        xbar
    }

    /// One linearized problem; `None` when it is infeasible
    fn solve_linearized(
        &self,
        xref: &[[f64; 4]],
        xbar: &[[f64; 4]],
        last_steer: f64,
        dt: f64,
        guess: &[Control],
    ) -> DriveResult<Option<(Vec<Control>, Vec<[f64; 4]>)>> {
        let horizon = self.config.horizon;
        let n = NU * horizon;
        let wb = self.vehicle.wheel_base;

        // x_t = offsets[t] + gains[t] * u
        let mut offsets: Vec<Vector4<f64>> = vec![Vector4::from_column_slice(&xbar[0])];
        let mut gains: Vec<DMatrix<f64>> = vec![DMatrix::zeros(NX, n)];
        for t in 0..horizon {
            let (a, b, c) = linear_model(xbar[t][V], xbar[t][YAW], last_steer, dt, wb);
            let a_dyn = DMatrix::from_fn(NX, NX, |r, k| a[(r, k)]);
            let mut gain = &a_dyn * &gains[t];
            for r in 0..NX {
                for k in 0..NU {
                    gain[(r, NU * t + k)] += b[(r, k)];
                }
            }
            offsets.push(a * offsets[t] + c);
            gains.push(gain);
        }

        let mut h = DMatrix::<f64>::zeros(n, n);
        let mut f = DVector::<f64>::zeros(n);
        for t in 0..horizon {
            for k in 0..NU {
                h[(NU * t + k, NU * t + k)] += 2.0 * self.config.input_weight[k];
            }
        }
        for t in 1..=horizon {
            let weight = if t == horizon { &self.config.final_state_weight } else { &self.config.state_weight };
            let w = DMatrix::from_diagonal(&DVector::from_column_slice(weight));
            let residual = DVector::from_fn(NX, |i, _| offsets[t][i] - xref[t][i]);
            let gw = gains[t].transpose() * w;
            h += &gw * &gains[t] * 2.0;
            f += &gw * residual * 2.0;
        }
        let dt2 = dt * dt;
        for t in 1..horizon {
            for k in 0..NU {
                let (i, j) = (NU * t + k, NU * (t - 1) + k);
                let w = 2.0 * self.config.input_rate_weight[k] / dt2;
                h[(i, i)] += w;
                h[(j, j)] += w;
                h[(i, j)] -= w;
                h[(j, i)] -= w;
            }
        }
        if self.config.allow_steer_change_on_first_point {
            let w = 2.0 * self.config.input_rate_weight[1] / dt2;
            h[(1, 1)] += w;
            f[1] -= w * last_steer;
        }

        let max_steer = self.vehicle.max_steer;
        let max_accel = self.vehicle.max_accel;
        let steer_step = self.vehicle.max_steer_speed * dt;
        let rows = n + (horizon - 1) + horizon;
        let mut g = DMatrix::<f64>::zeros(rows, n);
        let mut lower = DVector::<f64>::zeros(rows);
        let mut upper = DVector::<f64>::zeros(rows);
        for t in 0..horizon {
            let (ia, is) = (NU * t, NU * t + 1);
            g[(ia, ia)] = 1.0;
            lower[ia] = -max_accel;
            upper[ia] = max_accel;
            g[(is, is)] = 1.0;
            lower[is] = -max_steer;
            upper[is] = max_steer;
        }
        if self.config.allow_steer_change_on_first_point {
            lower[1] = (last_steer - steer_step).max(-max_steer);
            upper[1] = (last_steer + steer_step).min(max_steer);
        } else {
            let pinned = last_steer.clamp(-max_steer, max_steer);
            lower[1] = pinned;
            upper[1] = pinned;
        }
        for t in 1..horizon {
            let row = n + t - 1;
            g[(row, NU * t + 1)] = 1.0;
            g[(row, NU * (t - 1) + 1)] = -1.0;
            lower[row] = -steer_step;
            upper[row] = steer_step;
        }
        for t in 1..=horizon {
            let row = n + horizon - 1 + t - 1;
            for k in 0..n {
                g[(row, k)] = gains[t][(V, k)];
            }
            lower[row] = self.vehicle.min_speed - offsets[t][V];
            upper[row] = self.vehicle.max_speed - offsets[t][V];
        }

        let problem = QpProblem { h, f, g, lower, upper };
        let warm = DVector::from_iterator(n, guess.iter().flat_map(|c| [c.acceleration, c.steer]));
        let solution = qp_solver::solve(&problem, &self.config.qp, Some(&warm))?;
        match solution.status {
            QpStatus::PrimalInfeasible => return Ok(None),
            QpStatus::MaxIterations => debug!("QP hit its iteration cap, using the last iterate"),
            QpStatus::Solved => {}
        }

        let u = solution.x;
        let controls = (0..horizon)
            .map(|t| Control { acceleration: u[NU * t], steer: u[NU * t + 1] })
            .collect();
        let states = (0..=horizon)
            .map(|t| {
                let dx = &gains[t] * &u;
                [offsets[t][0] + dx[0], offsets[t][1] + dx[1], offsets[t][2] + dx[2], offsets[t][3] + dx[3]]
            })
            .collect();
        Ok(Some((controls, states)))
    }
}
