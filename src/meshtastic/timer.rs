//! Repeating timers that feed the manager's event queue.
//!
//! Each arm spawns a task that sends a tick event tagged with the timer's generation.
//! Re-arming or cancelling aborts the task and bumps the generation, so a tick that was
//! already queued before the cancel is recognised as stale and ignored.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

#[derive(Debug, Default)]
pub struct RepeatingTimer {
    generation: u64,
    task: Option<JoinHandle<()>>,
}

impl RepeatingTimer {
    /// Cancel any running timer, then fire `make_event(generation)` every `period`,
    /// first after one full period.
    pub fn arm<T, F>(&mut self, period: Duration, tx: mpsc::UnboundedSender<T>, make_event: F)
    where
        T: Send + 'static,
        F: Fn(u64) -> T + Send + 'static,
    {
        self.cancel();
        let generation = self.generation;
        self.task = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if tx.send(make_event(generation)).is_err() {
                    break;
                }
            }
        }));
    }

    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.generation = self.generation.wrapping_add(1);
    }

    pub fn is_armed(&self) -> bool {
        self.task.is_some()
    }

    /// True when a tick carrying `generation` belongs to the currently armed timer.
    pub fn is_current(&self, generation: u64) -> bool {
        self.task.is_some() && generation == self.generation
    }
}

impl Drop for RepeatingTimer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn ticks_repeat_and_stale_generations_are_detected() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = RepeatingTimer::default();
        timer.arm(Duration::from_millis(1500), tx.clone(), |g| g);
        assert!(timer.is_armed());

        let first = rx.recv().await.unwrap();
        assert!(timer.is_current(first));
        let second = rx.recv().await.unwrap();
        assert_eq!(first, second);

        timer.arm(Duration::from_secs(900), tx, |g| g);
        assert!(!timer.is_current(first));
        let next = rx.recv().await.unwrap();
        assert!(timer.is_current(next));

        timer.cancel();
        assert!(!timer.is_armed());
        assert!(!timer.is_current(next));
    }
}
