//! Tokio-backed timers for the production runner.
//!
//! Each armed timer is a task that sleeps until its deadline and then sends
//! the matching node event into the runner's timer channel. There is at most
//! one pending instance per [`TimerId`].

use pumplink_core::{Event, TimerId};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

/// The event a timer delivers when it fires.
pub(crate) fn timer_event(id: TimerId) -> Event {
    match id {
        TimerId::FreshnessCheck => Event::FreshnessTimer,
        TimerId::LinkHealth => Event::LinkHealthTimer,
        TimerId::DeliveryRecheck => Event::DeliveryRecheckTimer,
    }
}

struct Armed {
    deadline: Instant,
    task: JoinHandle<()>,
}

pub struct TimerManager {
    armed: HashMap<TimerId, Armed>,
    event_tx: mpsc::Sender<Event>,
}

impl TimerManager {
    pub fn new(event_tx: mpsc::Sender<Event>) -> Self {
        Self {
            armed: HashMap::new(),
            event_tx,
        }
    }

    /// Arm `id` to fire after `after`. A pending instance is replaced.
    pub fn set_timer(&mut self, id: TimerId, after: Duration) {
        let deadline = Instant::now() + after;
        if let Some(previous) = self.armed.remove(&id) {
            previous.task.abort();
            trace!(?id, left = ?previous.deadline.saturating_duration_since(Instant::now()), "Timer re-armed");
        }

        let tx = self.event_tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            trace!(?id, "Timer fired");
            // A closed channel means the runner has stopped.
            let _ = tx.send(timer_event(id)).await;
        });

        debug!(?id, ?after, "Timer set");
        self.armed.insert(id, Armed { deadline, task });
    }

    pub fn cancel_timer(&mut self, id: TimerId) {
        if let Some(armed) = self.armed.remove(&id) {
            armed.task.abort();
            trace!(?id, "Timer cancelled");
        }
    }

    pub fn cancel_all(&mut self) {
        let count = self.armed.len();
        for (_, armed) in self.armed.drain() {
            armed.task.abort();
        }
        if count > 0 {
            debug!(count, "Cancelled pending timers");
        }
    }

    /// Time left before `id` fires, or `None` if it is not pending.
    pub fn remaining(&self, id: TimerId) -> Option<Duration> {
        self.armed
            .get(&id)
            .filter(|a| !a.task.is_finished())
            .map(|a| a.deadline.saturating_duration_since(Instant::now()))
    }

    /// Timers that have not fired or been cancelled yet.
    pub fn active_count(&self) -> usize {
        self.armed.values().filter(|a| !a.task.is_finished()).count()
    }
}

impl Drop for TimerManager {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next(rx: &mut mpsc::Receiver<Event>, within: Duration) -> Option<Event> {
        tokio::time::timeout(within, rx.recv()).await.ok().flatten()
    }

    #[tokio::test(start_paused = true)]
    async fn test_freshness_timer_delivers_event() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut timers = TimerManager::new(tx);

        timers.set_timer(TimerId::FreshnessCheck, Duration::from_secs(60));
        assert_eq!(timers.remaining(TimerId::FreshnessCheck), Some(Duration::from_secs(60)));

        let event = next(&mut rx, Duration::from_secs(61)).await;
        assert!(matches!(event, Some(Event::FreshnessTimer)));
        tokio::task::yield_now().await;
        assert_eq!(timers.active_count(), 0);
        assert_eq!(timers.remaining(TimerId::FreshnessCheck), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_link_health_timer_stays_silent() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut timers = TimerManager::new(tx);

        timers.set_timer(TimerId::LinkHealth, Duration::from_secs(60));
        timers.cancel_timer(TimerId::LinkHealth);
        assert_eq!(timers.active_count(), 0);
        assert!(next(&mut rx, Duration::from_secs(120)).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recheck_rearm_keeps_one_instance() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut timers = TimerManager::new(tx);

        timers.set_timer(TimerId::DeliveryRecheck, Duration::from_secs(300));
        timers.set_timer(TimerId::DeliveryRecheck, Duration::from_secs(30));
        assert_eq!(timers.active_count(), 1);

        let event = next(&mut rx, Duration::from_secs(31)).await;
        assert!(matches!(event, Some(Event::DeliveryRecheckTimer)));
        assert!(next(&mut rx, Duration::from_secs(600)).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timers_fire_in_deadline_order() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut timers = TimerManager::new(tx);

        timers.set_timer(TimerId::LinkHealth, Duration::from_secs(20));
        timers.set_timer(TimerId::FreshnessCheck, Duration::from_secs(10));

        let mut fired = Vec::new();
        while let Some(event) = next(&mut rx, Duration::from_secs(30)).await {
            fired.push(event.type_name());
        }
        assert_eq!(fired, vec!["FreshnessTimer", "LinkHealthTimer"]);
    }
}
