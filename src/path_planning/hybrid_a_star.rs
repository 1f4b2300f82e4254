// Hybrid A* path planner
//
// A* over a discretized (x, y, yaw, direction) lattice whose edges are short
// constant-steering arcs of the bicycle model. Every expanded node also tries
// a collision-free Reeds-Shepp connection to the goal.

use log::{debug, info};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::hash_map::Entry;
use std::collections::{BinaryHeap, HashMap};
use std::f64::consts::PI;

use crate::common::{
    wrap_angle, Direction, DriveError, DriveResult, Point2D, Pose2D, ProgressSink, Trajectory, TrajectoryPoint,
};
use crate::mapping::{MapBounds, ObstacleSet};
use crate::path_planning::holonomic_heuristic::HolonomicHeuristic;
use crate::path_planning::reeds_shepp_path::{self, ReedsSheppPath, SegmentType};
use crate::vehicle::{pose_collides, VehicleConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HybridAStarConfig {
    /// Lattice position resolution [m]
    pub xy_resolution: f64,
    /// Lattice heading resolution [rad]
    pub yaw_resolution: f64,
    /// Sample spacing along motion primitives [m]
    pub motion_resolution: f64,
    /// Number of steering angles spread over [-max_steer, max_steer]
    pub n_steer: usize,
    pub switch_back_cost: f64,
    pub back_cost: f64,
    pub steer_change_cost: f64,
    pub steer_cost: f64,
    /// Weight of the heuristic in the open set priority
    pub heuristic_weight: f64,
    /// Clearance used when blocking cells of the distance transform [m]
    pub heuristic_inflation: f64,
    pub max_expansions: usize,
    pub goal_position_tolerance: f64,
    pub goal_yaw_tolerance: f64,
    /// Number of explored arcs per progress batch
    pub progress_batch_size: usize,
    pub analytic_expansion: bool,
}

impl Default for HybridAStarConfig {
    fn default() -> Self {
        Self {
            xy_resolution: 2.0,
            yaw_resolution: 15.0_f64.to_radians(),
            motion_resolution: 0.5,
            n_steer: 20,
            switch_back_cost: 100.0,
            back_cost: 5.0,
            steer_change_cost: 5.0,
            steer_cost: 1.0,
            heuristic_weight: 5.0,
            heuristic_inflation: 1.0,
            max_expansions: 50_000,
            goal_position_tolerance: 0.5,
            goal_yaw_tolerance: 5.0_f64.to_radians(),
            progress_batch_size: 50,
            analytic_expansion: true,
        }
    }
}

impl HybridAStarConfig {
    pub fn validate(&self) -> DriveResult<()> {
        let positive = [
            ("xy_resolution", self.xy_resolution),
            ("yaw_resolution", self.yaw_resolution),
            ("motion_resolution", self.motion_resolution),
            ("goal_position_tolerance", self.goal_position_tolerance),
            ("goal_yaw_tolerance", self.goal_yaw_tolerance),
        ];
        for (name, value) in positive.iter() {
            if !(*value > 0.0) {
                return Err(DriveError::InvalidParameter(format!("{} must be positive, got {}", name, value)));
            }
        }
        if self.n_steer < 2 {
            return Err(DriveError::InvalidParameter("n_steer must be at least 2".to_string()));
        }
        if self.max_expansions == 0 || self.progress_batch_size == 0 {
            return Err(DriveError::InvalidParameter(
                "max_expansions and progress_batch_size must be positive".to_string(),
            ));
        }
        if self.heuristic_inflation < 0.0 || self.heuristic_weight < 0.0 {
            return Err(DriveError::InvalidParameter(
                "heuristic weight and inflation must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// Discretized lattice state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LatticeKey {
    pub x: i32,
    pub y: i32,
    pub yaw: i32,
    pub direction: Direction,
}

/// Node of the search tree
#[derive(Debug, Clone)]
pub struct SearchNode {
    pub key: LatticeKey,
    pub direction: Direction,
    pub steer: f64,
    /// Samples of the arc driven from the parent's end pose to this node
    pub arc: Vec<TrajectoryPoint>,
    pub cost: f64,
    pub heuristic: f64,
    /// Index of the parent in the node arena
    pub parent: Option<usize>,
}

impl SearchNode {
    pub fn pose(&self) -> Pose2D {
        self.arc.last().map(|p| p.pose()).unwrap_or_else(|| Pose2D::new(0.0, 0.0, 0.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    StartInCollision,
    GoalInCollision,
    OutOfBounds,
    /// Every lattice state reachable from the start was explored
    Unreachable,
    ExpansionLimit,
}

/// Result of one global planning request
#[derive(Debug, Clone)]
pub enum PlanningOutcome {
    Succeeded(Trajectory),
    Failed(FailureReason),
    Cancelled,
}

impl PlanningOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, PlanningOutcome::Succeeded(_))
    }
}

struct Primitive {
    steer: f64,
    direction: Direction,
}

pub struct HybridAStar {
    config: HybridAStarConfig,
    vehicle: VehicleConfig,
    primitives: Vec<Primitive>,
}

impl HybridAStar {
    pub fn new(config: HybridAStarConfig, vehicle: VehicleConfig) -> DriveResult<Self> {
        config.validate()?;
        vehicle.validate()?;
        let n = config.n_steer;
        let mut steers: Vec<f64> = (0..n)
            .map(|i| -vehicle.max_steer + 2.0 * vehicle.max_steer * i as f64 / (n - 1) as f64)
            .collect();
        steers.push(0.0);
        let primitives = steers
            .iter()
            .flat_map(|&steer| {
                vec![
                    Primitive { steer, direction: Direction::Forward },
                    Primitive { steer, direction: Direction::Backward },
                ]
            })
            .collect();
        Ok(Self { config, vehicle, primitives })
    }

    pub fn config(&self) -> &HybridAStarConfig {
        &self.config
    }

    fn max_curvature(&self) -> f64 {
        self.vehicle.max_steer.tan() / self.vehicle.wheel_base
    }

    fn key(&self, pose: &Pose2D, direction: Direction) -> LatticeKey {
        let yaw_bins = ((2.0 * PI / self.config.yaw_resolution).round() as i32).max(1);
        LatticeKey {
            x: (pose.x / self.config.xy_resolution).round() as i32,
            y: (pose.y / self.config.xy_resolution).round() as i32,
            yaw: ((pose.yaw.rem_euclid(2.0 * PI) / self.config.yaw_resolution).round() as i32).rem_euclid(yaw_bins),
            direction,
        }
    }

    fn point(&self, pose: Pose2D, direction: Direction) -> TrajectoryPoint {
        TrajectoryPoint::new(pose.x, pose.y, pose.yaw, direction, direction.sign() * self.vehicle.target_speed)
    }

    fn pose_is_free(&self, pose: &Pose2D, obstacles: &ObstacleSet, bounds: &MapBounds) -> bool {
        bounds.contains(&pose.position()) && !pose_collides(pose, obstacles, &self.vehicle)
    }

    fn heuristic(&self, pose: &Pose2D, goal: &Pose2D, distance: &HolonomicHeuristic) -> f64 {
        let holonomic = distance.cost_at(pose.position());
        if !holonomic.is_finite() {
            return f64::INFINITY;
        }
        let nonholonomic = reeds_shepp_path::shortest_length(pose, goal, self.max_curvature()).unwrap_or(0.0);
        holonomic.max(nonholonomic)
    }

    fn reached_goal(&self, pose: &Pose2D, goal: &Pose2D) -> bool {
        pose.position().distance(&goal.position()) <= self.config.goal_position_tolerance
            && wrap_angle(pose.yaw - goal.yaw).abs() <= self.config.goal_yaw_tolerance
    }

    /// Drive one motion primitive from `parent`; `None` if any sample collides
    fn expand(
        &self,
        parent: &SearchNode,
        primitive: &Primitive,
        obstacles: &ObstacleSet,
        bounds: &MapBounds,
    ) -> Option<SearchNode> {
        let arc_length = self.config.xy_resolution * 1.5;
        let n = (arc_length / self.config.motion_resolution).ceil() as usize;
        let d = self.config.motion_resolution * primitive.direction.sign();
        let mut pose = parent.pose();
        let mut arc = Vec::with_capacity(n);
        for _ in 0..n {
            pose = Pose2D::new(
                pose.x + d * pose.yaw.cos(),
                pose.y + d * pose.yaw.sin(),
                wrap_angle(pose.yaw + d * primitive.steer.tan() / self.vehicle.wheel_base),
            );
            if !self.pose_is_free(&pose, obstacles, bounds) {
                return None;
            }
            arc.push(self.point(pose, primitive.direction));
        }

        let mut added_cost = 0.0;
        if primitive.direction != parent.direction {
            added_cost += self.config.switch_back_cost;
        }
        added_cost += self.config.steer_cost * primitive.steer.abs();
        added_cost += self.config.steer_change_cost * (parent.steer - primitive.steer).abs();
        added_cost += match primitive.direction {
            Direction::Backward => arc_length * self.config.back_cost,
            _ => arc_length,
        };

        Some(SearchNode {
            key: self.key(&pose, primitive.direction),
            direction: primitive.direction,
            steer: primitive.steer,
            arc,
            cost: parent.cost + added_cost,
            heuristic: 0.0,
            parent: None,
        })
    }

    fn reeds_shepp_cost(&self, path: &ReedsSheppPath) -> f64 {
        let mut cost: f64 = path
            .lengths
            .iter()
            .map(|&l| if l >= 0.0 { l } else { -l * self.config.back_cost })
            .sum();
        cost += path.lengths.windows(2).filter(|w| w[0] * w[1] < 0.0).count() as f64 * self.config.switch_back_cost;
        let steer = |s: &SegmentType| match s {
            SegmentType::Left => self.vehicle.max_steer,
            SegmentType::Right => -self.vehicle.max_steer,
            SegmentType::Straight => 0.0,
        };
        cost += path.segments.iter().map(|s| self.config.steer_cost * steer(s).abs()).sum::<f64>();
        cost += path
            .segments
            .windows(2)
            .map(|w| self.config.steer_change_cost * (steer(&w[1]) - steer(&w[0])).abs())
            .sum::<f64>();
        cost
    }

    /// Cheapest collision-free Reeds-Shepp connection from `node` to `goal`
    fn analytic_expansion(
        &self,
        node: &SearchNode,
        goal: &Pose2D,
        obstacles: &ObstacleSet,
        bounds: &MapBounds,
    ) -> Option<SearchNode> {
        let start = node.pose();
        let max_curvature = self.max_curvature();
        let step = self.config.motion_resolution;
        let mut candidates: Vec<(f64, ReedsSheppPath)> =
            reeds_shepp_path::candidate_paths(&start, goal, max_curvature, step)
                .into_iter()
                .map(|path| (self.reeds_shepp_cost(&path), path))
                .collect();
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0));

        let (cost, path) = candidates.into_iter().find_map(|(cost, path)| {
            let path = path.sampled(&start, max_curvature, step);
            let free = path.reaches(goal) && path.poses().all(|pose| self.pose_is_free(&pose, obstacles, bounds));
            if free {
                Some((cost, path))
            } else {
                None
            }
        })?;

        let mut arc: Vec<TrajectoryPoint> = path
            .poses()
            .zip(path.directions.iter())
            .skip(1)
            .map(|(pose, &direction)| self.point(pose, direction))
            .collect();
        // The connection ends exactly on the goal
        if let Some(last) = arc.last_mut() {
            last.x = goal.x;
            last.y = goal.y;
            last.yaw = goal.yaw;
        }
        let direction = path.directions.last().copied().unwrap_or(Direction::Forward);
        Some(SearchNode {
            key: self.key(goal, direction),
            direction,
            steer: 0.0,
            arc,
            cost: node.cost + cost,
            heuristic: 0.0,
            parent: None,
        })
    }

    /// Search a drivable trajectory from `start` to `goal`
    ///
    /// `cancel` is invoked with every expanded node and stops the search when
    /// it returns true. Explored arcs reach `progress` in batches of
    /// `progress_batch_size`. At most `max_expansions` nodes are expanded.
    pub fn plan<C, P>(
        &self,
        start: Pose2D,
        goal: Pose2D,
        obstacles: &ObstacleSet,
        bounds: &MapBounds,
        mut cancel: C,
        progress: &mut P,
    ) -> PlanningOutcome
    where
        C: FnMut(&SearchNode) -> bool,
        P: ProgressSink + ?Sized,
    {
        if !bounds.contains(&start.position()) || !bounds.contains(&goal.position()) {
            info!("start or goal outside the map");
            return PlanningOutcome::Failed(FailureReason::OutOfBounds);
        }
        if pose_collides(&start, obstacles, &self.vehicle) {
            info!("start pose is in collision");
            return PlanningOutcome::Failed(FailureReason::StartInCollision);
        }
        if pose_collides(&goal, obstacles, &self.vehicle) {
            info!("goal pose is in collision");
            return PlanningOutcome::Failed(FailureReason::GoalInCollision);
        }

        let distance = match HolonomicHeuristic::new(
            goal.position(),
            obstacles,
            bounds,
            self.config.xy_resolution,
            self.config.heuristic_inflation,
        ) {
            Ok(distance) => distance,
            Err(_) => return PlanningOutcome::Failed(FailureReason::Unreachable),
        };

        let start_node = SearchNode {
            key: self.key(&start, Direction::Forward),
            direction: Direction::Forward,
            steer: 0.0,
            arc: vec![self.point(start, Direction::Forward)],
            cost: 0.0,
            heuristic: self.heuristic(&start, &goal, &distance),
            parent: None,
        };
        if !start_node.heuristic.is_finite() {
            info!("goal is not reachable from the start");
            return PlanningOutcome::Failed(FailureReason::Unreachable);
        }

        let mut nodes: Vec<SearchNode> = Vec::new();
        let mut open: HashMap<LatticeKey, usize> = HashMap::new();
        let mut closed: HashMap<LatticeKey, usize> = HashMap::new();
        let mut queue = BinaryHeap::new();
        let mut batch: Vec<Vec<Point2D>> = Vec::new();

        queue.push((
            Reverse(OrderedFloat(self.config.heuristic_weight * start_node.heuristic)),
            0usize,
        ));
        open.insert(start_node.key, 0);
        nodes.push(start_node);

        let mut expansions = 0;
        while let Some((_, index)) = queue.pop() {
            let key = nodes[index].key;
            // Lazy deletion: skip entries superseded by a cheaper node
            if open.get(&key) != Some(&index) {
                continue;
            }
            if expansions == self.config.max_expansions {
                info!("search gave up after {} expansions", expansions);
                flush(progress, batch);
                return PlanningOutcome::Failed(FailureReason::ExpansionLimit);
            }
            open.remove(&key);
            closed.insert(key, index);
            expansions += 1;

            if cancel(&nodes[index]) {
                info!("search cancelled after {} expansions", expansions);
                return PlanningOutcome::Cancelled;
            }

            let current_pose = nodes[index].pose();
            if self.reached_goal(&current_pose, &goal) {
                info!("goal reached after {} expansions", expansions);
                flush(progress, batch);
                return PlanningOutcome::Succeeded(reconstruct(&nodes, index));
            }
            if self.config.analytic_expansion {
                if let Some(mut last) = self.analytic_expansion(&nodes[index], &goal, obstacles, bounds) {
                    info!("goal connected after {} expansions", expansions);
                    last.parent = Some(index);
                    nodes.push(last);
                    flush(progress, batch);
                    return PlanningOutcome::Succeeded(reconstruct(&nodes, nodes.len() - 1));
                }
            }

            for primitive in self.primitives.iter() {
                let mut next = match self.expand(&nodes[index], primitive, obstacles, bounds) {
                    Some(next) => next,
                    None => continue,
                };
                batch.push(next.arc.iter().map(|p| p.position()).collect());
                if batch.len() >= self.config.progress_batch_size {
                    progress.explored(std::mem::take(&mut batch));
                }

                if closed.contains_key(&next.key) {
                    continue;
                }
                next.heuristic = self.heuristic(&next.pose(), &goal, &distance);
                if !next.heuristic.is_finite() {
                    continue;
                }
                next.parent = Some(index);
                let priority = next.cost + self.config.heuristic_weight * next.heuristic;
                let next_index = nodes.len();
                match open.entry(next.key) {
                    Entry::Occupied(mut entry) => {
                        if nodes[*entry.get()].cost <= next.cost {
                            continue;
                        }
                        entry.insert(next_index);
                    }
                    Entry::Vacant(entry) => {
                        entry.insert(next_index);
                    }
                }
                nodes.push(next);
                queue.push((Reverse(OrderedFloat(priority)), next_index));
            }
            debug!("expansion {}: open {}, closed {}", expansions, open.len(), closed.len());
        }

        info!("open set exhausted after {} expansions", expansions);
        flush(progress, batch);
        PlanningOutcome::Failed(FailureReason::Unreachable)
    }
}

fn flush<P: ProgressSink + ?Sized>(progress: &mut P, batch: Vec<Vec<Point2D>>) {
    if !batch.is_empty() {
        progress.explored(batch);
    }
}

/// Walk parent links back from `index` and lay the arcs out start to end
fn reconstruct(nodes: &[SearchNode], index: usize) -> Trajectory {
    let mut chain = vec![index];
    let mut current = index;
    while let Some(parent) = nodes[current].parent {
        chain.push(parent);
        current = parent;
    }
    chain.reverse();

    let mut points: Vec<TrajectoryPoint> = chain.iter().flat_map(|&i| nodes[i].arc.iter().copied()).collect();
    // The start pose is driven in the direction of the first move
    if points.len() > 1 {
        let direction = points[1].direction;
        points[0].direction = direction;
        points[0].speed = points[1].speed;
    }
    Trajectory::from_points(points)
}
