// Mission planning module: session lifecycle and coordination

pub mod cancellation;
pub mod state_machine;
pub mod global_planner_worker;
pub mod session;

pub use cancellation::CancellationToken;
pub use state_machine::{SessionEvent, SessionState, StateMachine, Transition};
pub use global_planner_worker::{GlobalPlannerWorker, PlannerMessage};
pub use session::*;
