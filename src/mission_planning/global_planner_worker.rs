//! Background thread running global planning requests
//!
//! Requests arrive over a channel and are planned one at a time. Progress
//! batches and outcomes return over a second channel, tagged with the request
//! id so the receiver can drop messages of superseded requests.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use log::{debug, error, info};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::cancellation::CancellationToken;
use crate::common::{DriveError, DriveResult, Point2D, Pose2D};
use crate::mapping::{MapBounds, ObstacleSet};
use crate::path_planning::{HybridAStar, PlanningOutcome};

pub struct PlanRequest {
    pub id: u64,
    pub start: Pose2D,
    pub goal: Pose2D,
    pub obstacles: Arc<ObstacleSet>,
    pub bounds: MapBounds,
    pub cancel: CancellationToken,
}

pub enum WorkerSignal {
    Plan(PlanRequest),
    /// The worker should stop its operations
    Stop,
}

#[derive(Debug, Clone)]
pub enum PlannerMessage {
    /// Explored arcs of a running search
    Progress { id: u64, segments: Vec<Vec<Point2D>> },
    Finished { id: u64, outcome: PlanningOutcome },
}

impl PlannerMessage {
    pub fn id(&self) -> u64 {
        match self {
            PlannerMessage::Progress { id, .. } | PlannerMessage::Finished { id, .. } => *id,
        }
    }
}

pub struct GlobalPlannerWorker {
    handle: Option<JoinHandle<()>>,
    sender: Sender<WorkerSignal>,
    receiver: Receiver<PlannerMessage>,
    next_id: u64,
}

impl GlobalPlannerWorker {
    pub fn spawn(planner: HybridAStar) -> DriveResult<Self> {
        let (sender, worker_receiver) = unbounded();
        let (worker_sender, receiver) = unbounded();
        let handle = thread::Builder::new()
            .name("global-planner".into())
            .spawn(move || worker_thread(planner, worker_sender, worker_receiver))
            .map_err(|e| DriveError::Channel(format!("failed to spawn the planner thread: {}", e)))?;
        Ok(Self { handle: Some(handle), sender, receiver, next_id: 0 })
    }

    /// Queue a request, returning its id
    pub fn request(
        &mut self,
        start: Pose2D,
        goal: Pose2D,
        obstacles: Arc<ObstacleSet>,
        bounds: MapBounds,
        cancel: CancellationToken,
    ) -> DriveResult<u64> {
        self.next_id += 1;
        let id = self.next_id;
        self.sender
            .send(WorkerSignal::Plan(PlanRequest { id, start, goal, obstacles, bounds, cancel }))
            .map_err(|_| DriveError::Channel("global planner thread is gone".to_string()))?;
        debug!("queued plan request {}", id);
        Ok(id)
    }

    pub fn try_recv(&self) -> DriveResult<Option<PlannerMessage>> {
        match self.receiver.try_recv() {
            Ok(message) => Ok(Some(message)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => {
                error!("global planner thread disconnected");
                Err(DriveError::Channel("global planner thread is gone".to_string()))
            }
        }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> DriveResult<Option<PlannerMessage>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(message) => Ok(Some(message)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                error!("global planner thread disconnected");
                Err(DriveError::Channel("global planner thread is gone".to_string()))
            }
        }
    }
}

impl Drop for GlobalPlannerWorker {
    fn drop(&mut self) {
        // Fails only when the thread already exited
        let _ = self.sender.send(WorkerSignal::Stop);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("global planner thread panicked");
            }
        }
    }
}

fn worker_thread(planner: HybridAStar, main_sender: Sender<PlannerMessage>, main_receiver: Receiver<WorkerSignal>) {
    info!("global planner thread started");
    while let Ok(signal) = main_receiver.recv() {
        let request = match signal {
            WorkerSignal::Stop => break,
            WorkerSignal::Plan(request) => request,
        };
        let id = request.id;
        let outcome = if request.cancel.is_cancelled() {
            debug!("plan request {} cancelled before it started", id);
            PlanningOutcome::Cancelled
        } else {
            let cancel = &request.cancel;
            let mut progress = |segments: Vec<Vec<Point2D>>| {
                // A closed channel is noticed when the outcome is sent
                let _ = main_sender.send(PlannerMessage::Progress { id, segments });
            };
            planner.plan(
                request.start,
                request.goal,
                &request.obstacles,
                &request.bounds,
                |_| cancel.is_cancelled(),
                &mut progress,
            )
        };
        if main_sender.send(PlannerMessage::Finished { id, outcome }).is_err() {
            break;
        }
    }
    info!("global planner thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path_planning::HybridAStarConfig;
    use crate::vehicle::VehicleConfig;

    fn worker() -> GlobalPlannerWorker {
        let planner = HybridAStar::new(HybridAStarConfig::default(), VehicleConfig::default()).unwrap();
        GlobalPlannerWorker::spawn(planner).unwrap()
    }

    fn wait_finished(worker: &GlobalPlannerWorker, id: u64) -> PlanningOutcome {
        for _ in 0..600 {
            if let Some(PlannerMessage::Finished { id: done, outcome }) =
                worker.recv_timeout(Duration::from_millis(100)).unwrap()
            {
                if done == id {
                    return outcome;
                }
            }
        }
        panic!("plan request {} did not finish", id);
    }

    #[test]
    fn test_plans_in_background() {
        let mut worker = worker();
        let bounds = MapBounds::new(0.0, 0.0, 40.0, 40.0).unwrap();
        let id = worker
            .request(
                Pose2D::new(10.0, 10.0, 0.0),
                Pose2D::new(30.0, 25.0, std::f64::consts::FRAC_PI_2),
                Arc::new(ObstacleSet::empty()),
                bounds,
                CancellationToken::new(),
            )
            .unwrap();
        assert_eq!(id, 1);
        assert!(wait_finished(&worker, id).is_success());
    }

    #[test]
    fn test_cancelled_request_reports_cancelled() {
        let mut worker = worker();
        let bounds = MapBounds::new(0.0, 0.0, 40.0, 40.0).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let id = worker
            .request(
                Pose2D::new(10.0, 10.0, 0.0),
                Pose2D::new(30.0, 25.0, 0.0),
                Arc::new(ObstacleSet::empty()),
                bounds,
                cancel,
            )
            .unwrap();
        assert!(matches!(wait_finished(&worker, id), PlanningOutcome::Cancelled));
    }

    #[test]
    fn test_cancel_stops_a_running_search() {
        let mut worker = worker();
        let bounds = MapBounds::new(0.0, 0.0, 200.0, 200.0).unwrap();
        // The fence leaves the goal side unreachable, so the search runs until stopped
        let fence: Vec<Point2D> = (-12..=212).map(|i| Point2D::new(101.0, i as f64 + 0.5)).collect();
        let cancel = CancellationToken::new();
        let id = worker
            .request(
                Pose2D::new(20.0, 100.0, 0.0),
                Pose2D::new(180.0, 100.0, 0.0),
                Arc::new(ObstacleSet::new(fence)),
                bounds,
                cancel.clone(),
            )
            .unwrap();

        let mut started = false;
        for _ in 0..600 {
            match worker.recv_timeout(Duration::from_millis(100)).unwrap() {
                Some(PlannerMessage::Progress { id: running, .. }) if running == id => {
                    started = true;
                    break;
                }
                Some(PlannerMessage::Finished { outcome, .. }) => panic!("search ended early: {:?}", outcome),
                _ => {}
            }
        }
        assert!(started);

        cancel.cancel();
        let mut outcome = None;
        for _ in 0..50 {
            if let Some(PlannerMessage::Finished { id: done, outcome: result }) =
                worker.recv_timeout(Duration::from_millis(100)).unwrap()
            {
                assert_eq!(done, id);
                outcome = Some(result);
                break;
            }
        }
        assert!(matches!(outcome, Some(PlanningOutcome::Cancelled)));
        assert!(worker.recv_timeout(Duration::from_millis(200)).unwrap().is_none());
    }
}
