// Obstacle-aware distance-to-goal heuristic
//
// Dijkstra distance transform from the goal over an 8-connected grid spanning
// the map bounds. Cells whose centre lies within the inflation radius of a
// known obstacle are blocked.

use itertools::iproduct;
use ordered_float::OrderedFloat;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::common::{DriveError, DriveResult, Point2D};
use crate::mapping::{MapBounds, ObstacleSet};

pub struct HolonomicHeuristic {
    min_x: f64,
    min_y: f64,
    resolution: f64,
    x_width: usize,
    y_width: usize,
    blocked: Vec<bool>,
    cost: Vec<f64>,
}

impl HolonomicHeuristic {
    pub fn new(
        goal: Point2D,
        obstacles: &ObstacleSet,
        bounds: &MapBounds,
        resolution: f64,
        inflation_radius: f64,
    ) -> DriveResult<Self> {
        if !(resolution > 0.0) {
            return Err(DriveError::InvalidParameter(format!(
                "heuristic grid resolution must be positive, got {}",
                resolution
            )));
        }
        let x_width = (bounds.width() / resolution).ceil() as usize + 1;
        let y_width = (bounds.height() / resolution).ceil() as usize + 1;

        let mut heuristic = HolonomicHeuristic {
            min_x: bounds.min_x,
            min_y: bounds.min_y,
            resolution,
            x_width,
            y_width,
            blocked: vec![false; x_width * y_width],
            cost: vec![f64::INFINITY; x_width * y_width],
        };
        for (ix, iy) in iproduct!(0..x_width, 0..y_width) {
            let center = heuristic.cell_center(ix, iy);
            heuristic.blocked[iy * x_width + ix] =
                obstacles.nearest(center).map_or(false, |p| p.distance(&center) <= inflation_radius);
        }
        heuristic.run_dijkstra(goal);
        Ok(heuristic)
    }

    fn cell_center(&self, ix: usize, iy: usize) -> Point2D {
        Point2D::new(
            self.min_x + ix as f64 * self.resolution,
            self.min_y + iy as f64 * self.resolution,
        )
    }

    /// Up to four cells whose centres surround `p`
    fn surrounding_cells(&self, p: Point2D) -> Vec<(usize, usize)> {
        let fx = ((p.x - self.min_x) / self.resolution).floor();
        let fy = ((p.y - self.min_y) / self.resolution).floor();
        iproduct!(0..2, 0..2)
            .map(|(dx, dy)| (fx as i64 + dx, fy as i64 + dy))
            .filter(|&(ix, iy)| ix >= 0 && iy >= 0 && (ix as usize) < self.x_width && (iy as usize) < self.y_width)
            .map(|(ix, iy)| (ix as usize, iy as usize))
            .collect()
    }

    fn run_dijkstra(&mut self, goal: Point2D) {
        let mut queue = BinaryHeap::new();
        let seeds = self.surrounding_cells(goal);
        let free_seeds: Vec<(usize, usize)> = seeds
            .iter()
            .copied()
            .filter(|&(ix, iy)| !self.blocked[iy * self.x_width + ix])
            .collect();
        // A goal hugging an obstacle may have every surrounding cell blocked
        let seeds = if free_seeds.is_empty() { seeds } else { free_seeds };
        for (ix, iy) in seeds {
            let d = goal.distance(&self.cell_center(ix, iy));
            let index = iy * self.x_width + ix;
            if d < self.cost[index] {
                self.cost[index] = d;
                queue.push((Reverse(OrderedFloat(d)), ix, iy));
            }
        }

        while let Some((Reverse(OrderedFloat(cost)), ix, iy)) = queue.pop() {
            if cost > self.cost[iy * self.x_width + ix] {
                continue;
            }
            for (dx, dy) in iproduct!(-1i64..=1, -1i64..=1) {
                if dx == 0 && dy == 0 {
                    continue;
                }
                let nx = ix as i64 + dx;
                let ny = iy as i64 + dy;
                if nx < 0 || ny < 0 || nx as usize >= self.x_width || ny as usize >= self.y_width {
                    continue;
                }
                let (nx, ny) = (nx as usize, ny as usize);
                let index = ny * self.x_width + nx;
                if self.blocked[index] {
                    continue;
                }
                let alt = cost + ((dx * dx + dy * dy) as f64).sqrt() * self.resolution;
                if alt < self.cost[index] {
                    self.cost[index] = alt;
                    queue.push((Reverse(OrderedFloat(alt)), nx, ny));
                }
            }
        }
    }

    /// Estimated obstacle-avoiding distance from `p` to the goal
    ///
    /// Infinite when no reachable cell surrounds `p`.
    pub fn cost_at(&self, p: Point2D) -> f64 {
        self.surrounding_cells(p)
            .into_iter()
            .map(|(ix, iy)| self.cost[iy * self.x_width + ix] + p.distance(&self.cell_center(ix, iy)))
            .fold(f64::INFINITY, f64::min)
    }

    pub fn is_reachable(&self, p: Point2D) -> bool {
        self.cost_at(p).is_finite()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn bounds() -> MapBounds {
        MapBounds::new(0.0, 0.0, 20.0, 20.0).unwrap()
    }

    #[test]
    fn test_free_space_distance() {
        let h = HolonomicHeuristic::new(Point2D::new(2.0, 2.0), &ObstacleSet::empty(), &bounds(), 1.0, 0.5).unwrap();
        assert_relative_eq!(h.cost_at(Point2D::new(2.0, 2.0)), 0.0, epsilon = 1e-9);
        assert_relative_eq!(h.cost_at(Point2D::new(12.0, 2.0)), 10.0, epsilon = 1e-9);
        assert_relative_eq!(h.cost_at(Point2D::new(5.0, 5.0)), 3.0 * 2.0_f64.sqrt(), epsilon = 1e-9);
    }

    #[test]
    fn test_wall_forces_detour() {
        let wall: Vec<Point2D> = (0..31).map(|i| Point2D::new(10.0, i as f64 * 0.5)).collect();
        let obstacles = ObstacleSet::new(wall);
        let h = HolonomicHeuristic::new(Point2D::new(5.0, 2.0), &obstacles, &bounds(), 1.0, 0.5).unwrap();
        let detour = h.cost_at(Point2D::new(15.0, 2.0));
        assert!(detour.is_finite());
        assert!(detour > 20.0);
    }

    #[test]
    fn test_enclosed_goal_is_unreachable_from_outside() {
        let mut ring = Vec::new();
        for i in 0..=40 {
            let t = i as f64 * 0.5;
            for y in [6.0, 14.0].iter() {
                ring.push(Point2D::new(6.0 + t * 0.4, *y));
            }
            for x in [6.0, 14.0].iter() {
                ring.push(Point2D::new(*x, 6.0 + t * 0.4));
            }
        }
        let obstacles = ObstacleSet::new(ring);
        let h = HolonomicHeuristic::new(Point2D::new(10.0, 10.0), &obstacles, &bounds(), 1.0, 0.6).unwrap();
        assert!(h.is_reachable(Point2D::new(10.0, 10.0)));
        assert!(!h.is_reachable(Point2D::new(2.0, 2.0)));
    }
}
