//! Common traits defining the seams between pipeline components

use crate::common::types::Point2D;

/// Receiver of explored search segments, invoked by the global planner with
/// bounded batches while a search is running
pub trait ProgressSink {
    /// One batch of explored motion-primitive arcs
    fn explored(&mut self, batch: Vec<Vec<Point2D>>);
}

/// Sink that drops every batch
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn explored(&mut self, _batch: Vec<Vec<Point2D>>) {}
}

impl<F> ProgressSink for F
where
    F: FnMut(Vec<Vec<Point2D>>),
{
    fn explored(&mut self, batch: Vec<Vec<Point2D>>) {
        self(batch)
    }
}
