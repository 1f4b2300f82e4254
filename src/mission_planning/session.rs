//! Driving session coordinator
//!
//! Owns every pipeline component and wires them together: the simulator
//! publishes measured states, the map server reveals obstacles around them,
//! the collision monitor watches the active trajectory, the tracker turns it
//! into control sequences and the global planner runs on a worker thread.
//! `step()` advances the whole session by one simulation time step, so tests
//! can drive it deterministically; `run()` paces it against the wall clock.

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::cancellation::CancellationToken;
use super::global_planner_worker::{GlobalPlannerWorker, PlannerMessage};
use super::state_machine::{SessionEvent, SessionState, StateMachine};
use crate::common::{DriveError, DriveResult, Point2D, Pose2D, Trajectory, TrajectoryPoint};
use crate::mapping::{MapBounds, MapConfig, MapServer, MapUpdate, ObstacleSet};
use crate::path_planning::{HybridAStar, HybridAStarConfig, PlanningOutcome};
use crate::path_tracking::{CollisionEvent, CollisionMonitor, ModelPredictiveControl, MpcConfig, MpcOutcome, MpcResult};
use crate::simulation::{CarSimulator, ControlSequence, MeasuredState, SimulationConfig};
use crate::vehicle::{VehicleConfig, VehicleState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub vehicle: VehicleConfig,
    pub map: MapConfig,
    pub planner: HybridAStarConfig,
    pub mpc: MpcConfig,
    pub simulation: SimulationConfig,
    /// Tracker prediction step [s]
    pub local_planner_delta_time: f64,
    /// Simulation time between tracker updates [s]
    pub local_planner_interval: f64,
    /// A braking vehicle slower than this counts as stopped [m/s]
    ///
    /// The replan then starts at the end of the braking trajectory, unless
    /// the vehicle is already slower than `standstill_speed`.
    pub replan_max_speed: f64,
    /// Distance to the trajectory end at which the goal counts as reached [m]
    pub arrival_tolerance: f64,
    /// Speed below which the vehicle counts as standing [m/s]
    pub standstill_speed: f64,
    /// Seed of the map and initial pose generator
    pub seed: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            vehicle: VehicleConfig::default(),
            map: MapConfig::default(),
            planner: HybridAStarConfig::default(),
            mpc: MpcConfig::default(),
            simulation: SimulationConfig::default(),
            local_planner_delta_time: 0.07,
            local_planner_interval: 0.1,
            replan_max_speed: 5.0 / 3.6,
            arrival_tolerance: 1.0,
            standstill_speed: 0.1,
            seed: 0,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> DriveResult<()> {
        self.vehicle.validate()?;
        self.map.validate()?;
        self.planner.validate()?;
        self.mpc.validate()?;
        self.simulation.validate()?;
        let positive = [
            ("local_planner_delta_time", self.local_planner_delta_time),
            ("local_planner_interval", self.local_planner_interval),
            ("replan_max_speed", self.replan_max_speed),
            ("arrival_tolerance", self.arrival_tolerance),
            ("standstill_speed", self.standstill_speed),
        ];
        for (name, value) in positive.iter() {
            if !(*value > 0.0) {
                return Err(DriveError::InvalidParameter(format!("{} must be positive, got {}", name, value)));
            }
        }
        Ok(())
    }
}

/// User command delivered to a running session
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SessionCommand {
    /// Teleport the vehicle, aborting the current goal
    SetPose(Pose2D),
    SetGoal(Pose2D),
    Brake,
    Cancel,
    /// Cancel and load a newly generated map and initial pose
    Restart,
}

/// Event published by the session
#[derive(Debug, Clone)]
pub enum SessionOutput {
    /// A map was loaded and nothing of it is known yet
    MapReset { bounds: MapBounds, ground_truth: Vec<Point2D> },
    MeasuredState(MeasuredState),
    /// Whole known obstacle set after a sensor update
    KnownObstacles(Arc<ObstacleSet>),
    /// Obstacles revealed by the last sensor update only
    NewObstacles(Arc<Vec<Point2D>>),
    /// Explored arcs of the running search
    SearchProgress(Vec<Vec<Point2D>>),
    Planned(PlanningOutcome),
    LocalPlan(MpcResult),
    Collision(CollisionEvent),
    EmergencyStop { brake_trajectory: Vec<TrajectoryPoint> },
    StateChanged(SessionState),
    /// Every derived trajectory and pending search progress was dropped
    Cleared,
}

pub struct DrivingSession {
    config: SessionConfig,
    rng: StdRng,
    map: MapServer,
    simulator: CarSimulator,
    worker: GlobalPlannerWorker,
    machine: StateMachine,
    tracker: Option<ModelPredictiveControl>,
    monitor: CollisionMonitor,
    /// Cancelled when the current goal pursuit is aborted
    token: CancellationToken,
    plan_token: Option<CancellationToken>,
    pending_request: Option<u64>,
    goal: Option<Pose2D>,
    trajectory_end: Option<Point2D>,
    measured: MeasuredState,
    next_local_update: f64,
    outputs: Vec<SessionOutput>,
}

impl DrivingSession {
    /// Session on a randomly generated map with a random initial pose
    pub fn new(config: SessionConfig) -> DriveResult<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let map = MapServer::generate(&config.map, config.vehicle.clone(), &mut rng)?;
        let state = map.random_initial_state(&mut rng)?;
        Self::build(config, map, state, rng)
    }

    /// Session on the given obstacle ground truth
    ///
    /// A restart still loads a generated map.
    pub fn with_map(
        config: SessionConfig,
        obstacles: Vec<Point2D>,
        bounds: MapBounds,
        state: VehicleState,
    ) -> DriveResult<Self> {
        config.validate()?;
        let rng = StdRng::seed_from_u64(config.seed);
        let map = MapServer::new(obstacles, bounds, config.vehicle.clone());
        Self::build(config, map, state, rng)
    }

    fn build(config: SessionConfig, map: MapServer, state: VehicleState, rng: StdRng) -> DriveResult<Self> {
        let planner = HybridAStar::new(config.planner.clone(), config.vehicle.clone())?;
        let worker = GlobalPlannerWorker::spawn(planner)?;
        let simulator = CarSimulator::new(config.simulation.clone(), config.vehicle.clone(), state)?;
        let monitor = CollisionMonitor::new(config.vehicle.clone());
        let measured = simulator.measured();
        let mut session = Self {
            config,
            rng,
            map,
            simulator,
            worker,
            machine: StateMachine::session(),
            tracker: None,
            monitor,
            token: CancellationToken::new(),
            plan_token: None,
            pending_request: None,
            goal: None,
            trajectory_end: None,
            measured,
            next_local_update: 0.0,
            outputs: Vec::new(),
        };
        session.announce_map();
        Ok(session)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn session_state(&self) -> SessionState {
        self.machine.current_state()
    }

    pub fn state_machine(&self) -> &StateMachine {
        &self.machine
    }

    /// Last published vehicle state
    pub fn measured(&self) -> MeasuredState {
        self.measured
    }

    pub fn time(&self) -> f64 {
        self.simulator.time()
    }

    pub fn goal(&self) -> Option<Pose2D> {
        self.goal
    }

    pub fn known_obstacles(&self) -> Arc<ObstacleSet> {
        self.map.known_obstacles()
    }

    pub fn map(&self) -> &MapServer {
        &self.map
    }

    /// Whether a global plan request is in flight
    pub fn plan_pending(&self) -> bool {
        self.pending_request.is_some()
    }

    pub fn tracker(&self) -> Option<&ModelPredictiveControl> {
        self.tracker.as_ref()
    }

    pub fn handle(&mut self, command: SessionCommand) -> DriveResult<()> {
        debug!("command {:?} in <{}>", command, self.machine.current_state());
        match command {
            SessionCommand::SetPose(pose) => {
                if self.machine.current_state() != SessionState::Idle {
                    self.cancel();
                }
                self.simulator.set_state(VehicleState::from_pose(pose));
                self.measured = self.simulator.measured();
                Ok(())
            }
            SessionCommand::SetGoal(goal) => self.set_goal(goal),
            SessionCommand::Brake => {
                if self.transition(SessionEvent::BrakeRequested).is_some() {
                    self.begin_braking();
                }
                Ok(())
            }
            SessionCommand::Cancel => {
                self.cancel();
                Ok(())
            }
            SessionCommand::Restart => self.restart(),
        }
    }

    /// Advance the session by one simulation time step
    ///
    /// Returns the outputs produced since the previous call.
    pub fn step(&mut self) -> DriveResult<Vec<SessionOutput>> {
        while let Some(message) = self.worker.try_recv()? {
            self.on_planner_message(message)?;
        }
        if let Some(measured) = self.simulator.step() {
            self.on_measured(measured)?;
        }
        if self.simulator.time() + 1e-9 >= self.next_local_update {
            self.next_local_update = self.simulator.time() + self.config.local_planner_interval;
            self.update_local_plan()?;
        }
        Ok(self.drain_outputs())
    }

    pub fn drain_outputs(&mut self) -> Vec<SessionOutput> {
        std::mem::take(&mut self.outputs)
    }

    /// Run in real time until `stop` is cancelled or a channel closes
    pub fn run(
        &mut self,
        commands: &Receiver<SessionCommand>,
        outputs: &Sender<SessionOutput>,
        stop: &CancellationToken,
    ) -> DriveResult<()> {
        let interval = Duration::from_secs_f64(self.config.simulation.interval);
        let started = Instant::now();
        let sim_start = self.simulator.time();
        info!("session running, tick {:?}", interval);
        while !stop.is_cancelled() {
            let tick = Instant::now();
            loop {
                match commands.try_recv() {
                    Ok(command) => self.handle(command)?,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        info!("command channel closed, session stops");
                        return Ok(());
                    }
                }
            }

            let target = sim_start + started.elapsed().as_secs_f64();
            let mut published = self.drain_outputs();
            while self.simulator.time() + self.config.simulation.delta_time <= target {
                published.extend(self.step()?);
            }
            for output in published {
                if outputs.send(output).is_err() {
                    info!("output channel closed, session stops");
                    return Ok(());
                }
            }

            if let Some(rest) = interval.checked_sub(tick.elapsed()) {
                thread::sleep(rest);
            }
        }
        info!("session stopped at t = {:.2}", self.simulator.time());
        Ok(())
    }

    fn transition(&mut self, event: SessionEvent) -> Option<SessionState> {
        let state = self.machine.process(event)?;
        self.outputs.push(SessionOutput::StateChanged(state));
        Some(state)
    }

    fn announce_map(&mut self) {
        self.outputs.push(SessionOutput::MapReset {
            bounds: self.map.bounds(),
            ground_truth: self.map.ground_truth().points().to_vec(),
        });
        let state = self.measured.state;
        if let Some(update) = self.map.update(&state) {
            self.publish_map_update(&update);
        }
    }

    fn publish_map_update(&mut self, update: &MapUpdate) {
        self.outputs.push(SessionOutput::KnownObstacles(Arc::clone(&update.known)));
        self.outputs.push(SessionOutput::NewObstacles(Arc::clone(&update.new)));
    }

    fn set_goal(&mut self, goal: Pose2D) -> DriveResult<()> {
        if self.token.is_cancelled() {
            self.token = CancellationToken::new();
        }
        self.goal = Some(goal);
        info!("goal set to ({:.2}, {:.2}, {:.2})", goal.x, goal.y, goal.yaw);
        match self.transition(SessionEvent::GoalSet) {
            Some(SessionState::Planning) => self.request_plan(self.replan_start()),
            // Replanned once the vehicle stands
            Some(SessionState::Braking) => {
                self.begin_braking();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// End of the committed braking trajectory while still rolling, else the vehicle pose
    fn replan_start(&self) -> Pose2D {
        if self.measured.state.velocity.abs() <= self.config.standstill_speed {
            return self.measured.state.pose();
        }
        self.tracker
            .as_ref()
            .filter(|tracker| tracker.is_braked())
            .and_then(|tracker| tracker.brake_trajectory().last())
            .map(|p| p.pose())
            .unwrap_or_else(|| self.measured.state.pose())
    }

    fn request_plan(&mut self, start: Pose2D) -> DriveResult<()> {
        let goal = match self.goal {
            Some(goal) => goal,
            None => return Ok(()),
        };
        self.cancel_pending_plan();
        let token = self.token.child();
        let id = self.worker.request(start, goal, self.map.known_obstacles(), self.map.bounds(), token.clone())?;
        info!("plan request {} from ({:.2}, {:.2}, {:.2})", id, start.x, start.y, start.yaw);
        self.plan_token = Some(token);
        self.pending_request = Some(id);
        Ok(())
    }

    fn cancel_pending_plan(&mut self) {
        if let Some(token) = self.plan_token.take() {
            token.cancel();
        }
        if let Some(id) = self.pending_request.take() {
            debug!("plan request {} cancelled", id);
        }
    }

    fn begin_braking(&mut self) {
        if let Some(tracker) = self.tracker.as_mut() {
            tracker.brake();
        }
        self.cancel_pending_plan();
        self.monitor.cancel();
    }

    fn cancel(&mut self) {
        self.token.cancel();
        self.cancel_pending_plan();
        self.tracker = None;
        self.trajectory_end = None;
        self.goal = None;
        self.monitor.cancel();
        self.monitor.clear();
        self.simulator.stop();
        self.transition(SessionEvent::Cancelled);
        self.outputs.push(SessionOutput::Cleared);
    }

    fn restart(&mut self) -> DriveResult<()> {
        self.cancel();
        self.map = MapServer::generate(&self.config.map, self.config.vehicle.clone(), &mut self.rng)?;
        let state = self.map.random_initial_state(&mut self.rng)?;
        self.simulator.set_state(state);
        self.measured = self.simulator.measured();
        info!("restarted at ({:.2}, {:.2})", state.x, state.y);
        self.announce_map();
        Ok(())
    }

    fn on_planner_message(&mut self, message: PlannerMessage) -> DriveResult<()> {
        if self.pending_request != Some(message.id()) {
            warn!("dropping stale message of plan request {}", message.id());
            return Ok(());
        }
        match message {
            PlannerMessage::Progress { segments, .. } => {
                self.outputs.push(SessionOutput::SearchProgress(segments));
            }
            PlannerMessage::Finished { id, outcome } => {
                self.pending_request = None;
                self.plan_token = None;
                self.outputs.push(SessionOutput::Planned(outcome.clone()));
                match outcome {
                    PlanningOutcome::Succeeded(trajectory) => {
                        info!("plan request {} succeeded with {} points", id, trajectory.len());
                        self.start_tracking(trajectory)?;
                    }
                    PlanningOutcome::Failed(reason) => {
                        info!("plan request {} failed: {:?}", id, reason);
                        self.abandon_plan();
                    }
                    PlanningOutcome::Cancelled => debug!("plan request {} cancelled", id),
                }
            }
        }
        Ok(())
    }

    fn abandon_plan(&mut self) {
        self.tracker = None;
        self.trajectory_end = None;
        self.simulator.stop();
        self.transition(SessionEvent::PlanFailed);
    }

    fn start_tracking(&mut self, trajectory: Trajectory) -> DriveResult<()> {
        let (mpc, vehicle) = (self.config.mpc.clone(), self.config.vehicle.clone());
        let tracker = match ModelPredictiveControl::new(&trajectory, mpc, vehicle) {
            Ok(tracker) => tracker,
            Err(DriveError::InvalidTrajectory(reason)) => {
                warn!("planned trajectory cannot be tracked: {}", reason);
                self.abandon_plan();
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        self.trajectory_end = trajectory.last().map(|p| p.position());
        self.tracker = Some(tracker);
        self.monitor.set_trajectory(trajectory);
        self.next_local_update = self.simulator.time();
        self.transition(SessionEvent::PlanSucceeded);

        let known = self.map.known_obstacles();
        if let Some(event) = self.monitor.check_known_set(&known) {
            self.on_collision(event);
        }
        Ok(())
    }

    fn on_measured(&mut self, measured: MeasuredState) -> DriveResult<()> {
        self.measured = measured;
        self.outputs.push(SessionOutput::MeasuredState(measured));
        let tracking = self.machine.current_state() == SessionState::Tracking;
        if tracking {
            self.monitor.update_progress(&measured.state);
        }
        if let Some(update) = self.map.update(&measured.state) {
            self.publish_map_update(&update);
            if tracking {
                if let Some(event) = self.monitor.on_map_update(&update) {
                    self.on_collision(event);
                }
            }
        }

        match self.machine.current_state() {
            SessionState::Tracking => self.check_arrival(),
            SessionState::Braking => self.check_stopped()?,
            _ => {}
        }
        Ok(())
    }

    fn on_collision(&mut self, event: CollisionEvent) {
        self.outputs.push(SessionOutput::Collision(event));
        if self.transition(SessionEvent::CollisionDetected).is_some() {
            self.begin_braking();
        }
    }

    fn check_arrival(&mut self) {
        let end = match self.trajectory_end {
            Some(end) => end,
            None => return,
        };
        let state = self.measured.state;
        if state.position().distance(&end) > self.config.arrival_tolerance
            || state.velocity.abs() > self.config.standstill_speed
        {
            return;
        }
        if self.transition(SessionEvent::Arrived).is_some() {
            info!("goal reached at ({:.2}, {:.2})", state.x, state.y);
            self.tracker = None;
            self.trajectory_end = None;
            self.monitor.clear();
            self.simulator.stop();
        }
    }

    fn check_stopped(&mut self) -> DriveResult<()> {
        if self.measured.state.velocity.abs() > self.config.replan_max_speed {
            return Ok(());
        }
        let start = self.replan_start();
        if self.transition(SessionEvent::Stopped).is_some() {
            self.request_plan(start)?;
        }
        Ok(())
    }

    fn update_local_plan(&mut self) -> DriveResult<()> {
        if self.token.is_cancelled() {
            return Ok(());
        }
        let dt = self.config.local_planner_delta_time;
        let measured = self.measured;
        let tracker = match self.tracker.as_mut() {
            Some(tracker) => tracker,
            None => return Ok(()),
        };
        match tracker.update(&measured.state, dt)? {
            MpcOutcome::Converged(result) | MpcOutcome::NotConverged(result) => {
                let controls =
                    ControlSequence::from_controls(measured.timestamp, measured.state.velocity, &result.controls, dt)?;
                self.simulator.set_control_sequence(controls);
                self.outputs.push(SessionOutput::LocalPlan(result));
            }
            MpcOutcome::Infeasible => {}
            MpcOutcome::EmergencyStop { brake_trajectory } => {
                let controls =
                    ControlSequence::braking(measured.timestamp, &measured.state, self.config.vehicle.max_accel, dt)?;
                self.simulator.set_control_sequence(controls);
                self.outputs.push(SessionOutput::EmergencyStop { brake_trajectory });
                if self.transition(SessionEvent::EmergencyStop).is_some() {
                    self.cancel_pending_plan();
                    self.monitor.cancel();
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    fn boundary_walls(size: f64) -> Vec<Point2D> {
        let mut points = Vec::new();
        for i in 0..size as usize {
            let s = i as f64;
            points.push(Point2D::new(s, 0.0));
            points.push(Point2D::new(size, s));
            points.push(Point2D::new(s + 1.0, size));
            points.push(Point2D::new(0.0, s + 1.0));
        }
        points
    }

    fn session_with(extra: &[Point2D]) -> DrivingSession {
        let mut obstacles = boundary_walls(40.0);
        obstacles.extend_from_slice(extra);
        DrivingSession::with_map(
            SessionConfig::default(),
            obstacles,
            MapBounds::new(0.0, 0.0, 40.0, 40.0).unwrap(),
            VehicleState::new(8.0, 20.0, 0.0),
        )
        .unwrap()
    }

    /// Step until `done` holds, sleeping while the planner thread works
    fn step_until<F>(session: &mut DrivingSession, max_steps: usize, mut done: F) -> Vec<SessionOutput>
    where
        F: FnMut(&DrivingSession, &[SessionOutput]) -> bool,
    {
        let mut seen = Vec::new();
        for _ in 0..max_steps {
            let outputs = session.step().unwrap();
            let finished = done(session, &outputs);
            seen.extend(outputs);
            if finished {
                return seen;
            }
            if session.plan_pending() {
                thread::sleep(Duration::from_millis(1));
            }
        }
        panic!("condition not reached in <{}>", session.session_state());
    }

    fn in_state(state: SessionState) -> impl FnMut(&DrivingSession, &[SessionOutput]) -> bool {
        move |session: &DrivingSession, _: &[SessionOutput]| session.session_state() == state
    }

    #[test]
    fn test_config_validation() {
        assert!(SessionConfig::default().validate().is_ok());
        let mut config = SessionConfig::default();
        config.replan_max_speed = 0.0;
        assert!(config.validate().is_err());
        let mut config = SessionConfig::default();
        config.mpc.horizon = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_new_session_is_idle_on_a_revealed_map() {
        let mut session = DrivingSession::new(SessionConfig { seed: 11, ..SessionConfig::default() }).unwrap();
        assert_eq!(session.session_state(), SessionState::Idle);
        let outputs = session.drain_outputs();
        assert!(matches!(outputs.first(), Some(SessionOutput::MapReset { .. })));
        let state = session.measured().state;
        assert!(!state.check_collision(session.map().ground_truth(), &session.config().vehicle));
        assert!(session.known_obstacles().len() <= session.map().ground_truth().len());
    }

    #[test]
    fn test_drives_to_goal() {
        let mut session = session_with(&[]);
        session.handle(SessionCommand::SetGoal(Pose2D::new(24.0, 20.0, 0.0))).unwrap();
        assert_eq!(session.session_state(), SessionState::Planning);
        assert!(session.plan_pending());

        let outputs = step_until(&mut session, 20_000, in_state(SessionState::Tracking));
        assert!(outputs.iter().any(|o| matches!(o, SessionOutput::Planned(PlanningOutcome::Succeeded(_)))));

        let outputs = step_until(&mut session, 3_000, in_state(SessionState::GoalReached));
        assert!(outputs.iter().any(|o| matches!(o, SessionOutput::LocalPlan(_))));
        let state = session.measured().state;
        assert!((state.x - 24.0).abs() < 1.0);
        assert!((state.y - 20.0).abs() < 1.0);
        assert!(session.tracker().is_none());
    }

    #[test]
    fn test_cancel_drops_the_pending_plan() {
        let mut session = session_with(&[]);
        session.handle(SessionCommand::SetGoal(Pose2D::new(30.0, 30.0, 1.0))).unwrap();
        session.handle(SessionCommand::Cancel).unwrap();
        assert_eq!(session.session_state(), SessionState::Idle);
        assert!(!session.plan_pending());
        assert!(session.goal().is_none());

        for _ in 0..300 {
            let outputs = session.step().unwrap();
            assert!(!outputs.iter().any(|o| matches!(o, SessionOutput::Planned(_) | SessionOutput::LocalPlan(_))));
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(session.session_state(), SessionState::Idle);
    }

    #[test]
    fn test_brake_stops_then_replans() {
        let mut session = session_with(&[]);
        session.handle(SessionCommand::SetGoal(Pose2D::new(30.0, 20.0, 0.0))).unwrap();
        step_until(&mut session, 20_000, in_state(SessionState::Tracking));
        for _ in 0..100 {
            session.step().unwrap();
        }

        session.handle(SessionCommand::Brake).unwrap();
        assert_eq!(session.session_state(), SessionState::Braking);
        assert!(session.tracker().map(|t| t.is_braking()).unwrap_or(false));

        step_until(&mut session, 3_000, in_state(SessionState::Planning));
        let history = session.state_machine().transition_history();
        assert!(history.iter().any(|t| t.event == SessionEvent::Stopped));
        assert!(session.plan_pending());
    }

    #[test]
    fn test_replan_starts_at_brake_end_only_while_rolling() {
        let mut session = session_with(&[]);
        session.handle(SessionCommand::SetGoal(Pose2D::new(30.0, 20.0, 0.0))).unwrap();
        step_until(&mut session, 20_000, in_state(SessionState::Tracking));

        session.handle(SessionCommand::Brake).unwrap();
        session.measured.state.velocity = 4.0;
        session.update_local_plan().unwrap();
        let end = {
            let tracker = session.tracker().unwrap();
            assert!(tracker.is_braked());
            *tracker.brake_trajectory().last().unwrap()
        };
        assert!(end.x > session.measured.state.x + 2.0);
        assert!((session.replan_start().x - end.x).abs() < 1e-9);

        session.measured.state.velocity = 0.0;
        assert_eq!(session.replan_start(), session.measured.state.pose());
    }

    #[test]
    fn test_sustained_infeasibility_brakes_the_vehicle() {
        let mut session = session_with(&[]);
        session.handle(SessionCommand::SetGoal(Pose2D::new(30.0, 20.0, 0.0))).unwrap();
        step_until(&mut session, 20_000, in_state(SessionState::Tracking));
        session.drain_outputs();

        session.measured.state.velocity = 20.0;
        for _ in 0..=session.config.mpc.max_infeasible_ticks {
            session.update_local_plan().unwrap();
        }
        let outputs = session.drain_outputs();
        assert!(!outputs.iter().any(|o| matches!(o, SessionOutput::LocalPlan(_))));
        assert!(outputs.iter().any(|o| matches!(o, SessionOutput::EmergencyStop { .. })));
        assert_eq!(session.session_state(), SessionState::Braking);
        let history = session.state_machine().transition_history();
        assert!(history
            .iter()
            .any(|t| t.event == SessionEvent::EmergencyStop && t.dst_state == SessionState::Braking));
        assert!(session.tracker().map(|t| t.is_braked()).unwrap_or(false));
        assert!(session.simulator.has_controls());
        assert!(!session.plan_pending());
    }

    #[test]
    fn test_unseen_obstacle_interrupts_tracking() {
        let wall: Vec<Point2D> = (17..=23).map(|y| Point2D::new(24.0, y as f64)).collect();
        let mut session = session_with(&wall);
        assert!(session.known_obstacles().points().iter().all(|p| p.x != 24.0));

        session.handle(SessionCommand::SetGoal(Pose2D::new(32.0, 20.0, 0.0))).unwrap();
        step_until(&mut session, 20_000, in_state(SessionState::Tracking));
        let outputs = step_until(&mut session, 3_000, |_, outputs| {
            outputs.iter().any(|o| matches!(o, SessionOutput::Collision(_)))
        });
        assert!(outputs.iter().any(|o| matches!(o, SessionOutput::NewObstacles(_))));
        let history = session.state_machine().transition_history();
        assert!(history
            .iter()
            .any(|t| t.event == SessionEvent::CollisionDetected && t.dst_state == SessionState::Braking));
        assert!(session.tracker().map(|t| t.is_braking()).unwrap_or(false));
    }

    #[test]
    fn test_set_pose_teleports_and_publishes() {
        let mut session = session_with(&[]);
        session.handle(SessionCommand::SetPose(Pose2D::new(15.0, 12.0, 0.5))).unwrap();
        let outputs = session.step().unwrap();
        let measured = outputs
            .iter()
            .find_map(|o| match o {
                SessionOutput::MeasuredState(m) => Some(*m),
                _ => None,
            })
            .unwrap();
        assert!((measured.state.x - 15.0).abs() < 1e-9);
        assert!((measured.state.y - 12.0).abs() < 1e-9);
        assert_eq!(measured.state.velocity, 0.0);
    }

    #[test]
    fn test_restart_loads_a_new_map() {
        let mut session = session_with(&[]);
        session.drain_outputs();
        session.handle(SessionCommand::Restart).unwrap();
        let outputs = session.drain_outputs();
        assert!(outputs.iter().any(|o| matches!(o, SessionOutput::Cleared)));
        assert!(outputs.iter().any(|o| matches!(o, SessionOutput::MapReset { .. })));
        assert_eq!(session.map().bounds().width(), 60.0);
        assert_eq!(session.session_state(), SessionState::Idle);
    }

    #[test]
    fn test_run_publishes_until_stopped() {
        let mut session = session_with(&[]);
        let (_command_tx, command_rx) = unbounded();
        let (output_tx, output_rx) = unbounded();
        let stop = CancellationToken::new();
        let stopper = {
            let stop = stop.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(300));
                stop.cancel();
            })
        };
        session.run(&command_rx, &output_tx, &stop).unwrap();
        stopper.join().unwrap();

        let outputs: Vec<SessionOutput> = output_rx.try_iter().collect();
        assert!(matches!(outputs.first(), Some(SessionOutput::MapReset { .. })));
        assert!(outputs.iter().any(|o| matches!(o, SessionOutput::MeasuredState(_))));
        assert!(session.time() > 0.1);
    }
}
