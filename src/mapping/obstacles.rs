//! Point obstacle sets indexed by an R-tree for radius queries

use rstar::{PointDistance, RTree, RTreeObject, AABB};
use serde::{Deserialize, Serialize};

use crate::common::{DriveError, DriveResult, Point2D};

/// Axis-aligned rectangle enclosing the drivable area
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MapBounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl MapBounds {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> DriveResult<Self> {
        if !(max_x > min_x && max_y > min_y) {
            return Err(DriveError::InvalidParameter(format!(
                "empty map bounds [{}, {}] x [{}, {}]",
                min_x, max_x, min_y, max_y
            )));
        }
        Ok(Self { min_x, min_y, max_x, max_y })
    }

    /// Tight bounds of a point set
    pub fn from_points(points: &[Point2D]) -> DriveResult<Self> {
        let min_x = points.iter().map(|p| p.x).fold(f64::INFINITY, f64::min);
        let min_y = points.iter().map(|p| p.y).fold(f64::INFINITY, f64::min);
        let max_x = points.iter().map(|p| p.x).fold(f64::NEG_INFINITY, f64::max);
        let max_y = points.iter().map(|p| p.y).fold(f64::NEG_INFINITY, f64::max);
        Self::new(min_x, min_y, max_x, max_y)
    }

    pub fn contains(&self, p: &Point2D) -> bool {
        p.x >= self.min_x && p.x <= self.max_x && p.y >= self.min_y && p.y <= self.max_y
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }
}

/// An obstacle point stored in the R-tree
#[derive(Debug, Clone, Copy, PartialEq)]
struct IndexedPoint {
    position: [f64; 2],
    /// Index of this point in the snapshot
    index: usize,
}

impl RTreeObject for IndexedPoint {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point(self.position)
    }
}

impl PointDistance for IndexedPoint {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        (self.position[0] - point[0]).powi(2) + (self.position[1] - point[1]).powi(2)
    }

    fn contains_point(&self, point: &[f64; 2]) -> bool {
        self.position == *point
    }
}

fn index_points(points: &[Point2D]) -> RTree<IndexedPoint> {
    let indexed: Vec<IndexedPoint> = points
        .iter()
        .enumerate()
        .map(|(index, p)| IndexedPoint { position: [p.x, p.y], index })
        .collect();
    RTree::bulk_load(indexed)
}

/// Immutable snapshot of obstacle points
#[derive(Debug, Clone, Default)]
pub struct ObstacleSet {
    points: Vec<Point2D>,
    tree: RTree<IndexedPoint>,
}

impl ObstacleSet {
    pub fn new(points: Vec<Point2D>) -> Self {
        let tree = index_points(&points);
        Self { points, tree }
    }

    pub fn empty() -> Self {
        Self { points: Vec::new(), tree: RTree::new() }
    }

    pub fn points(&self) -> &[Point2D] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn x_coords(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.x).collect()
    }

    pub fn y_coords(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.y).collect()
    }

    /// Indices of the points within `radius` of `center`, in no particular order
    pub fn within_indices(&self, center: Point2D, radius: f64) -> impl Iterator<Item = usize> + '_ {
        self.tree
            .locate_within_distance([center.x, center.y], radius * radius)
            .map(|p| p.index)
    }

    /// Points within `radius` of `center`
    pub fn within(&self, center: Point2D, radius: f64) -> impl Iterator<Item = &Point2D> + '_ {
        self.within_indices(center, radius).map(move |i| &self.points[i])
    }

    /// Point nearest to `p`, `None` for an empty set
    pub fn nearest(&self, p: Point2D) -> Option<&Point2D> {
        self.tree.nearest_neighbor(&[p.x, p.y]).map(|indexed| &self.points[indexed.index])
    }

    /// New snapshot containing these points and `extra`
    pub fn extended(&self, extra: &[Point2D]) -> Self {
        let mut points = self.points.clone();
        points.extend_from_slice(extra);
        Self::new(points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_radius_query_matches_brute_force() {
        let mut points = Vec::new();
        for i in 0..30 {
            for j in 0..30 {
                points.push(Point2D::new(i as f64 * 0.7 - 5.0, j as f64 * 0.9 - 7.0));
            }
        }
        let set = ObstacleSet::new(points.clone());
        let center = Point2D::new(2.3, 1.1);
        let radius = 3.2;
        let mut found: Vec<usize> = set.within_indices(center, radius).collect();
        found.sort_unstable();
        let expected: Vec<usize> = points
            .iter()
            .enumerate()
            .filter(|(_, p)| p.distance(&center) <= radius)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(found, expected);
    }

    #[test]
    fn test_collinear_points_are_indexed() {
        let points: Vec<Point2D> = (0..100).map(|i| Point2D::new(10.0, i as f64 * 0.5)).collect();
        let set = ObstacleSet::new(points);
        assert_eq!(set.within(Point2D::new(10.0, 25.0), 1.0).count(), 5);
    }

    #[test]
    fn test_duplicate_points_and_nearest() {
        let set = ObstacleSet::new(vec![Point2D::new(1.0, 1.0), Point2D::new(1.0, 1.0), Point2D::new(4.0, 0.0)]);
        let mut found: Vec<usize> = set.within_indices(Point2D::new(1.0, 1.0), 0.5).collect();
        found.sort_unstable();
        assert_eq!(found, vec![0, 1]);
        assert_eq!(set.nearest(Point2D::new(3.5, 0.2)), Some(&Point2D::new(4.0, 0.0)));
        assert!(ObstacleSet::empty().nearest(Point2D::new(0.0, 0.0)).is_none());
        assert_eq!(ObstacleSet::empty().within(Point2D::new(0.0, 0.0), 10.0).count(), 0);
    }

    #[test]
    fn test_extended_keeps_existing_points() {
        let set = ObstacleSet::new(vec![Point2D::new(0.0, 0.0)]);
        let grown = set.extended(&[Point2D::new(5.0, 5.0)]);
        assert_eq!(set.len(), 1);
        assert_eq!(grown.len(), 2);
        assert_eq!(grown.within(Point2D::new(5.0, 5.0), 0.1).count(), 1);
    }

    #[test]
    fn test_bounds() {
        let bounds = MapBounds::from_points(&[Point2D::new(0.0, 0.0), Point2D::new(10.0, 5.0)]).unwrap();
        assert!(bounds.contains(&Point2D::new(5.0, 2.0)));
        assert!(!bounds.contains(&Point2D::new(11.0, 2.0)));
        assert!(MapBounds::new(0.0, 0.0, 0.0, 1.0).is_err());
    }
}
