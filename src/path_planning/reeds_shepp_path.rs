// Reeds-Shepp curves
//
// Shortest paths for a car that drives forward and backward with a bounded
// turning radius. Twelve curve families, each tried as is, time-flipped,
// reflected and both.

use std::f64::consts::PI;

use crate::common::{wrap_angle, Direction, Pose2D};

const ENDPOINT_TOLERANCE: f64 = 1e-3;

/// Steering mode of one path segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentType {
    Left,
    Straight,
    Right,
}

impl SegmentType {
    fn reflected(self) -> Self {
        match self {
            SegmentType::Left => SegmentType::Right,
            SegmentType::Right => SegmentType::Left,
            SegmentType::Straight => SegmentType::Straight,
        }
    }
}

use self::SegmentType::{Left as L, Right as R, Straight as S};

/// A Reeds-Shepp path, with sampled poses once interpolated
#[derive(Debug, Clone)]
pub struct ReedsSheppPath {
    /// Signed segment lengths [m], negative when driven backward
    pub lengths: Vec<f64>,
    pub segments: Vec<SegmentType>,
    /// Total driven length [m]
    pub length: f64,
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub yaw: Vec<f64>,
    pub directions: Vec<Direction>,
}

impl ReedsSheppPath {
    pub fn poses(&self) -> impl Iterator<Item = Pose2D> + '_ {
        self.x
            .iter()
            .zip(self.y.iter())
            .zip(self.yaw.iter())
            .map(|((&x, &y), &yaw)| Pose2D::new(x, y, yaw))
    }

    /// The same path sampled every `step_size` metres from `start`
    pub fn sampled(&self, start: &Pose2D, max_curvature: f64, step_size: f64) -> ReedsSheppPath {
        let word = (
            self.lengths.iter().map(|l| l * max_curvature).collect(),
            self.segments.clone(),
        );
        sample_word(&word, start, max_curvature, step_size)
    }

    /// Whether the sampled path ends at `goal`
    pub fn reaches(&self, goal: &Pose2D) -> bool {
        match (self.x.last(), self.y.last(), self.yaw.last()) {
            (Some(&x), Some(&y), Some(&yaw)) => {
                (x - goal.x).hypot(y - goal.y) <= ENDPOINT_TOLERANCE
                    && wrap_angle(yaw - goal.yaw).abs() <= ENDPOINT_TOLERANCE
            }
            _ => false,
        }
    }
}

fn mod2pi(x: f64) -> f64 {
    let v = x % (2.0 * PI);
    if v < -PI {
        v + 2.0 * PI
    } else if v > PI {
        v - 2.0 * PI
    } else {
        v
    }
}

fn polar(x: f64, y: f64) -> (f64, f64) {
    (x.hypot(y), y.atan2(x))
}

type Word = (Vec<f64>, Vec<SegmentType>);

fn left_straight_left(x: f64, y: f64, phi: f64) -> Option<Word> {
    let (u, t) = polar(x - phi.sin(), y - 1.0 + phi.cos());
    if (0.0..=PI).contains(&t) {
        let v = mod2pi(phi - t);
        if (0.0..=PI).contains(&v) {
            return Some((vec![t, u, v], vec![L, S, L]));
        }
    }
    None
}

fn left_straight_right(x: f64, y: f64, phi: f64) -> Option<Word> {
    let (u1, t1) = polar(x + phi.sin(), y - 1.0 - phi.cos());
    let u1_sq = u1 * u1;
    if u1_sq >= 4.0 {
        let u = (u1_sq - 4.0).sqrt();
        let t = mod2pi(t1 + 2.0_f64.atan2(u));
        let v = mod2pi(t - phi);
        if t >= 0.0 && v >= 0.0 {
            return Some((vec![t, u, v], vec![L, S, R]));
        }
    }
    None
}

fn left_x_right_x_left(x: f64, y: f64, phi: f64) -> Option<Word> {
    let (u1, theta) = polar(x - phi.sin(), y - 1.0 + phi.cos());
    if u1 <= 4.0 {
        let a = (0.25 * u1).acos();
        let t = mod2pi(a + theta + PI / 2.0);
        let u = mod2pi(PI - 2.0 * a);
        let v = mod2pi(phi - t - u);
        return Some((vec![t, -u, v], vec![L, R, L]));
    }
    None
}

fn left_x_right_left(x: f64, y: f64, phi: f64) -> Option<Word> {
    let (u1, theta) = polar(x - phi.sin(), y - 1.0 + phi.cos());
    if u1 <= 4.0 {
        let a = (0.25 * u1).acos();
        let t = mod2pi(a + theta + PI / 2.0);
        let u = mod2pi(PI - 2.0 * a);
        let v = mod2pi(-phi + t + u);
        return Some((vec![t, -u, -v], vec![L, R, L]));
    }
    None
}

fn left_right_x_left(x: f64, y: f64, phi: f64) -> Option<Word> {
    let (u1, theta) = polar(x - phi.sin(), y - 1.0 + phi.cos());
    if u1 <= 4.0 && u1 > 0.0 {
        let u = (1.0 - u1 * u1 * 0.125).acos();
        let a = (2.0 * u.sin() / u1).clamp(-1.0, 1.0).asin();
        let t = mod2pi(-a + theta + PI / 2.0);
        let v = mod2pi(t - u - phi);
        return Some((vec![t, u, -v], vec![L, R, L]));
    }
    None
}

fn left_right_x_left_right(x: f64, y: f64, phi: f64) -> Option<Word> {
    let (u1, theta) = polar(x + phi.sin(), y - 1.0 - phi.cos());
    // 2 < u1 <= 4 only yields sub-optimal solutions
    if u1 <= 2.0 {
        let a = ((u1 + 2.0) * 0.25).acos();
        let t = mod2pi(theta + a + PI / 2.0);
        let u = mod2pi(a);
        let v = mod2pi(phi - t + 2.0 * u);
        if t >= 0.0 && u >= 0.0 && v >= 0.0 {
            return Some((vec![t, u, -u, -v], vec![L, R, L, R]));
        }
    }
    None
}

fn left_x_right_left_x_right(x: f64, y: f64, phi: f64) -> Option<Word> {
    let (u1, theta) = polar(x + phi.sin(), y - 1.0 - phi.cos());
    let u2 = (20.0 - u1 * u1) / 16.0;
    if (0.0..=1.0).contains(&u2) && u1 > 0.0 {
        let u = u2.acos();
        let a = (2.0 * u.sin() / u1).clamp(-1.0, 1.0).asin();
        let t = mod2pi(theta + a + PI / 2.0);
        let v = mod2pi(t - phi);
        if t >= 0.0 && v >= 0.0 {
            return Some((vec![t, -u, -u, v], vec![L, R, L, R]));
        }
    }
    None
}

fn left_x_right90_straight_left(x: f64, y: f64, phi: f64) -> Option<Word> {
    let (u1, theta) = polar(x - phi.sin(), y - 1.0 + phi.cos());
    if u1 >= 2.0 {
        let r = (u1 * u1 - 4.0).sqrt();
        let u = r - 2.0;
        let a = 2.0_f64.atan2(r);
        let t = mod2pi(theta + a + PI / 2.0);
        let v = mod2pi(t - phi + PI / 2.0);
        if t >= 0.0 && v >= 0.0 {
            return Some((vec![t, -PI / 2.0, -u, -v], vec![L, R, S, L]));
        }
    }
    None
}

fn left_straight_right90_x_left(x: f64, y: f64, phi: f64) -> Option<Word> {
    let (u1, theta) = polar(x - phi.sin(), y - 1.0 + phi.cos());
    if u1 >= 2.0 {
        let r = (u1 * u1 - 4.0).sqrt();
        let u = r - 2.0;
        let a = r.atan2(2.0);
        let t = mod2pi(theta - a + PI / 2.0);
        let v = mod2pi(t - phi - PI / 2.0);
        if t >= 0.0 && v >= 0.0 {
            return Some((vec![t, u, PI / 2.0, -v], vec![L, S, R, L]));
        }
    }
    None
}

fn left_x_right90_straight_right(x: f64, y: f64, phi: f64) -> Option<Word> {
    let (u1, theta) = polar(x + phi.sin(), y - 1.0 - phi.cos());
    if u1 >= 2.0 {
        let t = mod2pi(theta + PI / 2.0);
        let u = u1 - 2.0;
        let v = mod2pi(phi - t - PI / 2.0);
        if t >= 0.0 && v >= 0.0 {
            return Some((vec![t, -PI / 2.0, -u, -v], vec![L, R, S, R]));
        }
    }
    None
}

fn left_straight_left90_x_right(x: f64, y: f64, phi: f64) -> Option<Word> {
    let (u1, theta) = polar(x + phi.sin(), y - 1.0 - phi.cos());
    if u1 >= 2.0 {
        let t = mod2pi(theta);
        let u = u1 - 2.0;
        let v = mod2pi(phi - t - PI / 2.0);
        if t >= 0.0 && v >= 0.0 {
            return Some((vec![t, u, PI / 2.0, -v], vec![L, S, L, R]));
        }
    }
    None
}

fn left_x_right90_straight_left90_x_right(x: f64, y: f64, phi: f64) -> Option<Word> {
    let (u1, theta) = polar(x + phi.sin(), y - 1.0 - phi.cos());
    if u1 >= 4.0 {
        let r = (u1 * u1 - 4.0).sqrt();
        let u = r - 4.0;
        let a = 2.0_f64.atan2(r);
        let t = mod2pi(theta + a + PI / 2.0);
        let v = mod2pi(t - phi);
        if t >= 0.0 && v >= 0.0 {
            return Some((vec![t, -PI / 2.0, -u, -PI / 2.0, v], vec![L, R, S, L, R]));
        }
    }
    None
}

const WORDS: [fn(f64, f64, f64) -> Option<Word>; 12] = [
    left_straight_left,
    left_straight_right,
    left_x_right_x_left,
    left_x_right_left,
    left_right_x_left,
    left_right_x_left_right,
    left_x_right_left_x_right,
    left_x_right90_straight_left,
    left_x_right90_straight_right,
    left_straight_right90_x_left,
    left_straight_left90_x_right,
    left_x_right90_straight_left90_x_right,
];

fn push_word(paths: &mut Vec<Word>, word: Word, step_size: f64) {
    let total: f64 = word.0.iter().map(|d| d.abs()).sum();
    // A segment too long to drop but too short to sample cannot be followed
    if word.0.iter().any(|d| 0.1 * total < d.abs() && d.abs() < step_size) {
        return;
    }
    let duplicate = paths.iter().any(|(lengths, segments)| {
        let length: f64 = lengths.iter().map(|d| d.abs()).sum();
        *segments == word.1 && (length - total).abs() <= step_size
    });
    if duplicate || total <= step_size {
        return;
    }
    paths.push(word);
}

/// Candidate words in the normalized frame of `start` (unit turning radius)
fn generate_words(start: &Pose2D, goal: &Pose2D, max_curvature: f64, step_size: f64) -> Vec<Word> {
    let dx = goal.x - start.x;
    let dy = goal.y - start.y;
    let dth = goal.yaw - start.yaw;
    let (s, c) = start.yaw.sin_cos();
    let x = (c * dx + s * dy) * max_curvature;
    let y = (-s * dx + c * dy) * max_curvature;
    let step_size = step_size * max_curvature;

    let mut paths = Vec::new();
    for word in WORDS.iter() {
        if let Some(w) = word(x, y, dth) {
            push_word(&mut paths, w, step_size);
        }
        if let Some((lengths, segments)) = word(-x, y, -dth) {
            push_word(&mut paths, (lengths.iter().map(|d| -d).collect(), segments), step_size);
        }
        if let Some((lengths, segments)) = word(x, -y, -dth) {
            push_word(&mut paths, (lengths, segments.iter().map(|m| m.reflected()).collect()), step_size);
        }
        if let Some((lengths, segments)) = word(-x, -y, dth) {
            push_word(
                &mut paths,
                (
                    lengths.iter().map(|d| -d).collect(),
                    segments.iter().map(|m| m.reflected()).collect(),
                ),
                step_size,
            );
        }
    }
    paths
}

/// Pose reached after driving `dist` (normalized) of one segment from `origin`
fn interpolate(dist: f64, mode: SegmentType, max_curvature: f64, origin: (f64, f64, f64)) -> (f64, f64, f64) {
    let (ox, oy, oyaw) = origin;
    match mode {
        SegmentType::Straight => (
            ox + dist / max_curvature * oyaw.cos(),
            oy + dist / max_curvature * oyaw.sin(),
            oyaw,
        ),
        SegmentType::Left | SegmentType::Right => {
            let ldx = dist.sin() / max_curvature;
            let (ldy, yaw) = if mode == SegmentType::Left {
                ((1.0 - dist.cos()) / max_curvature, oyaw + dist)
            } else {
                ((1.0 - dist.cos()) / -max_curvature, oyaw - dist)
            };
            let (s, c) = oyaw.sin_cos();
            (ox + c * ldx - s * ldy, oy + s * ldx + c * ldy, yaw)
        }
    }
}

/// Sample a normalized word into a metric path starting at `start`
fn sample_word(word: &Word, start: &Pose2D, max_curvature: f64, step_size: f64) -> ReedsSheppPath {
    let (lengths, segments) = word;
    let step = step_size * max_curvature;
    let mut xs = vec![0.0];
    let mut ys = vec![0.0];
    let mut yaws = vec![0.0];
    let mut directions = Vec::new();
    let mut origin = (0.0, 0.0, 0.0);

    for (&length, &mode) in lengths.iter().zip(segments.iter()) {
        if length.abs() <= f64::EPSILON {
            continue;
        }
        let direction = if length > 0.0 { Direction::Forward } else { Direction::Backward };
        if directions.is_empty() {
            directions.push(direction);
        }
        let d_dist = step.copysign(length);
        let mut dist = d_dist;
        loop {
            let reached_end = dist.abs() >= length.abs();
            let p = interpolate(if reached_end { length } else { dist }, mode, max_curvature, origin);
            xs.push(p.0);
            ys.push(p.1);
            yaws.push(p.2);
            directions.push(direction);
            if reached_end {
                origin = p;
                break;
            }
            dist += d_dist;
        }
    }
    if directions.is_empty() {
        directions.push(Direction::Forward);
    }

    let (s, c) = start.yaw.sin_cos();
    ReedsSheppPath {
        lengths: lengths.iter().map(|l| l / max_curvature).collect(),
        segments: segments.clone(),
        length: lengths.iter().map(|l| l.abs()).sum::<f64>() / max_curvature,
        x: xs.iter().zip(ys.iter()).map(|(&ix, &iy)| c * ix - s * iy + start.x).collect(),
        y: xs.iter().zip(ys.iter()).map(|(&ix, &iy)| s * ix + c * iy + start.y).collect(),
        yaw: yaws.iter().map(|&yaw| wrap_angle(yaw + start.yaw)).collect(),
        directions,
    }
}

/// Whether the segment end poses of `word` chain from `start` to `goal`
fn word_reaches(word: &Word, start: &Pose2D, goal: &Pose2D, max_curvature: f64) -> bool {
    let (ix, iy, iyaw) = word
        .0
        .iter()
        .zip(word.1.iter())
        .fold((0.0, 0.0, 0.0), |origin, (&length, &mode)| interpolate(length, mode, max_curvature, origin));
    let (s, c) = start.yaw.sin_cos();
    let x = c * ix - s * iy + start.x;
    let y = s * ix + c * iy + start.y;
    (x - goal.x).hypot(y - goal.y) <= ENDPOINT_TOLERANCE
        && wrap_angle(iyaw + start.yaw - goal.yaw).abs() <= ENDPOINT_TOLERANCE
}

/// Endpoint-verified paths from `start` to `goal`, shortest first, not sampled yet
pub fn candidate_paths(start: &Pose2D, goal: &Pose2D, max_curvature: f64, step_size: f64) -> Vec<ReedsSheppPath> {
    if !(max_curvature > 0.0 && step_size > 0.0) {
        return Vec::new();
    }
    let mut paths: Vec<ReedsSheppPath> = generate_words(start, goal, max_curvature, step_size)
        .into_iter()
        .filter(|w| word_reaches(w, start, goal, max_curvature))
        .map(|(lengths, segments)| ReedsSheppPath {
            length: lengths.iter().map(|l| l.abs()).sum::<f64>() / max_curvature,
            lengths: lengths.iter().map(|l| l / max_curvature).collect(),
            segments,
            x: Vec::new(),
            y: Vec::new(),
            yaw: Vec::new(),
            directions: Vec::new(),
        })
        .collect();
    paths.sort_by(|a, b| a.length.total_cmp(&b.length));
    paths
}

/// Length of the shortest path without sampling it
pub fn shortest_length(start: &Pose2D, goal: &Pose2D, max_curvature: f64) -> Option<f64> {
    if !(max_curvature > 0.0) {
        return None;
    }
    generate_words(start, goal, max_curvature, 1e-6)
        .iter()
        .filter(|w| word_reaches(w, start, goal, max_curvature))
        .map(|(lengths, _)| lengths.iter().map(|l| l.abs()).sum::<f64>() / max_curvature)
        .min_by(|a, b| a.total_cmp(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// All sampled paths ending at the goal, shortest first
    fn calc_paths(start: &Pose2D, goal: &Pose2D, max_curvature: f64, step_size: f64) -> Vec<ReedsSheppPath> {
        candidate_paths(start, goal, max_curvature, step_size)
            .iter()
            .map(|p| p.sampled(start, max_curvature, step_size))
            .filter(|p| p.reaches(goal))
            .collect()
    }

    fn shortest_path(start: &Pose2D, goal: &Pose2D, max_curvature: f64, step_size: f64) -> Option<ReedsSheppPath> {
        calc_paths(start, goal, max_curvature, step_size).into_iter().next()
    }

    #[test]
    fn test_straight_ahead() {
        let start = Pose2D::new(0.0, 0.0, 0.0);
        let goal = Pose2D::new(10.0, 0.0, 0.0);
        let path = shortest_path(&start, &goal, 0.2, 0.1).unwrap();
        assert_relative_eq!(path.length, 10.0, epsilon = 1e-6);
        assert!(path.directions.iter().all(|d| *d == Direction::Forward));
        assert_relative_eq!(shortest_length(&start, &goal, 0.2).unwrap(), 10.0, epsilon = 1e-6);
    }

    #[test]
    fn test_straight_behind_is_driven_backward() {
        let start = Pose2D::new(0.0, 0.0, 0.0);
        let goal = Pose2D::new(-6.0, 0.0, 0.0);
        let path = shortest_path(&start, &goal, 0.2, 0.1).unwrap();
        assert_relative_eq!(path.length, 6.0, epsilon = 1e-6);
        assert!(path.directions.iter().all(|d| *d == Direction::Backward));
    }

    #[test]
    fn test_paths_end_at_goal() {
        let start = Pose2D::new(-1.0, -4.0, (-20.0_f64).to_radians());
        let goal = Pose2D::new(5.0, 5.0, 25.0_f64.to_radians());
        let paths = calc_paths(&start, &goal, 0.3, 0.05);
        assert!(!paths.is_empty());
        for path in &paths {
            assert!(path.reaches(&goal));
            assert_eq!(path.x.len(), path.directions.len());
            assert_relative_eq!(path.x[0], start.x, epsilon = 1e-9);
            assert_relative_eq!(path.y[0], start.y, epsilon = 1e-9);
        }
        assert!(paths.windows(2).all(|w| w[0].length <= w[1].length));
    }

    #[test]
    fn test_length_is_at_least_euclidean() {
        let start = Pose2D::new(0.0, 0.0, PI / 2.0);
        let goal = Pose2D::new(3.0, 2.0, -PI / 2.0);
        let length = shortest_length(&start, &goal, 0.4).unwrap();
        assert!(length >= (3.0_f64).hypot(2.0));
        let sampled = shortest_path(&start, &goal, 0.4, 0.1).unwrap();
        assert!(sampled.length >= length - 1e-9);
        assert!(sampled.length <= length + 0.1);
    }
}
