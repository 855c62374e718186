//! State machine traits.

use crate::{Action, Event};
use std::time::Duration;

/// A complete state machine driven by a runner.
pub trait StateMachine {
    /// Process one event and return the actions to perform.
    fn handle(&mut self, event: Event) -> Vec<Action>;

    /// Set the current local time. Called by the runner before every event.
    fn set_time(&mut self, now: Duration);

    /// Current local time as last set by the runner.
    fn now(&self) -> Duration;
}

/// A component of the composed state machine.
///
/// Sub-state machines see only the events they care about and return `None`
/// for everything else.
pub trait SubStateMachine {
    /// Handle the event if it belongs to this component.
    fn try_handle(&mut self, event: &Event) -> Option<Vec<Action>>;

    /// Set the current local time.
    fn set_time(&mut self, now: Duration);
}
