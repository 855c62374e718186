use pumplink_core::{Event, EventPriority};
use std::time::Duration;

/// Ordering key for the simulation event queue.
///
/// Events are ordered by time, then priority, then insertion sequence, so
/// callbacks scheduled for the same instant run before new client requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EventKey {
    pub time: Duration,
    pub priority: EventPriority,
    pub sequence: u64,
}

impl EventKey {
    pub fn new(time: Duration, event: &Event, sequence: u64) -> Self {
        Self {
            time,
            priority: event.priority(),
            sequence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_instant_orders_by_priority() {
        let at = Duration::from_secs(10);
        let reset_done = Event::LinkResetCompleted { result: Ok(()) };
        let client = EventKey::new(at, &Event::ForceRead, 1);
        let callback = EventKey::new(at, &reset_done, 2);
        let later = EventKey::new(at + Duration::from_millis(1), &reset_done, 0);

        assert!(callback < client);
        assert!(client < later);
    }
}
