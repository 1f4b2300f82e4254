/*!
 * Session state machine
 *
 * Finite state machine over the driving session lifecycle. Transitions are
 * kept in a table keyed by (state, event); events without an entry are
 * ignored and leave the state unchanged.
 */

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;

/// Transitions kept in the history, oldest dropped first
const HISTORY_LENGTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    Planning,
    Tracking,
    /// Stopping before a new plan is requested
    Braking,
    GoalReached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionEvent {
    GoalSet,
    PlanSucceeded,
    PlanFailed,
    BrakeRequested,
    CollisionDetected,
    EmergencyStop,
    Stopped,
    Arrived,
    Cancelled,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// One entry of the transition history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub src_state: SessionState,
    pub event: SessionEvent,
    pub dst_state: SessionState,
}

pub struct StateMachine {
    name: String,
    transitions: HashMap<(SessionState, SessionEvent), SessionState>,
    current_state: SessionState,
    transition_history: VecDeque<Transition>,
}

impl StateMachine {
    /// Machine with no transitions, starting in `initial`
    pub fn new(name: &str, initial: SessionState) -> Self {
        StateMachine {
            name: name.to_string(),
            transitions: HashMap::new(),
            current_state: initial,
            transition_history: VecDeque::with_capacity(HISTORY_LENGTH),
        }
    }

    /// The driving session lifecycle
    pub fn session() -> Self {
        use SessionEvent::*;
        use SessionState::*;

        let mut machine = StateMachine::new("DrivingSession", Idle);
        machine.add_transition(Idle, GoalSet, Planning);
        machine.add_transition(GoalReached, GoalSet, Planning);
        machine.add_transition(Planning, GoalSet, Planning);
        machine.add_transition(Tracking, GoalSet, Braking);
        machine.add_transition(Braking, GoalSet, Braking);

        machine.add_transition(Planning, PlanSucceeded, Tracking);
        machine.add_transition(Planning, PlanFailed, Idle);

        machine.add_transition(Tracking, BrakeRequested, Braking);
        machine.add_transition(Tracking, CollisionDetected, Braking);
        machine.add_transition(Tracking, EmergencyStop, Braking);
        machine.add_transition(Braking, Stopped, Planning);
        machine.add_transition(Tracking, Arrived, GoalReached);

        for state in [Idle, Planning, Tracking, Braking, GoalReached].iter() {
            machine.add_transition(*state, Cancelled, Idle);
        }
        machine
    }

    pub fn add_transition(&mut self, src: SessionState, event: SessionEvent, dst: SessionState) {
        self.transitions.insert((src, event), dst);
    }

    pub fn current_state(&self) -> SessionState {
        self.current_state
    }

    /// Apply `event`, returning the new state, or `None` when the event is
    /// not handled in the current state
    pub fn process(&mut self, event: SessionEvent) -> Option<SessionState> {
        let dst = match self.transitions.get(&(self.current_state, event)) {
            Some(dst) => *dst,
            None => {
                debug!("|{}| ignoring [{}] in <{}>", self.name, event, self.current_state);
                return None;
            }
        };
        if dst != self.current_state {
            info!("|{}| <{}> -> <{}> on [{}]", self.name, self.current_state, dst, event);
        } else {
            debug!("|{}| self-transition on <{}> with [{}]", self.name, dst, event);
        }
        if self.transition_history.len() == HISTORY_LENGTH {
            self.transition_history.pop_front();
        }
        self.transition_history.push_back(Transition { src_state: self.current_state, event, dst_state: dst });
        self.current_state = dst;
        Some(dst)
    }

    /// The most recent transitions, oldest first
    pub fn transition_history(&self) -> &VecDeque<Transition> {
        &self.transition_history
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionEvent::*;
    use SessionState::*;

    #[test]
    fn test_plan_track_arrive() {
        let mut machine = StateMachine::session();
        assert_eq!(machine.current_state(), Idle);
        assert_eq!(machine.process(GoalSet), Some(Planning));
        assert_eq!(machine.process(PlanSucceeded), Some(Tracking));
        assert_eq!(machine.process(Arrived), Some(GoalReached));
        assert_eq!(machine.transition_history().len(), 3);
        assert_eq!(
            machine.transition_history()[1],
            Transition { src_state: Planning, event: PlanSucceeded, dst_state: Tracking }
        );
    }

    #[test]
    fn test_collision_brakes_then_replans() {
        let mut machine = StateMachine::session();
        machine.process(GoalSet);
        machine.process(PlanSucceeded);
        assert_eq!(machine.process(CollisionDetected), Some(Braking));
        // A second signal while braking is not a transition
        assert_eq!(machine.process(CollisionDetected), None);
        assert_eq!(machine.process(Stopped), Some(Planning));
    }

    #[test]
    fn test_cancel_from_every_state() {
        for events in [vec![], vec![GoalSet], vec![GoalSet, PlanSucceeded], vec![GoalSet, PlanSucceeded, BrakeRequested]]
            .iter()
        {
            let mut machine = StateMachine::session();
            for event in events.iter() {
                machine.process(*event);
            }
            assert_eq!(machine.process(Cancelled), Some(Idle));
        }
    }

    #[test]
    fn test_unhandled_event_keeps_state() {
        let mut machine = StateMachine::session();
        assert_eq!(machine.process(PlanSucceeded), None);
        assert_eq!(machine.current_state(), Idle);
        assert!(machine.transition_history().is_empty());
    }

    #[test]
    fn test_history_keeps_latest_transitions() {
        let mut machine = StateMachine::session();
        for _ in 0..HISTORY_LENGTH {
            machine.process(GoalSet);
            machine.process(Cancelled);
        }
        machine.process(GoalSet);
        let history = machine.transition_history();
        assert_eq!(history.len(), HISTORY_LENGTH);
        assert_eq!(history.back(), Some(&Transition { src_state: Idle, event: GoalSet, dst_state: Planning }));
        assert_eq!(history.front(), Some(&Transition { src_state: Planning, event: Cancelled, dst_state: Idle }));
    }
}
