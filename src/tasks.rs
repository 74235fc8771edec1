//! Stoppable background timers.
//!
//! Every periodic job (cache sweep, metrics flush, health sampling, alert
//! polling, limiter cleanup) runs as a [`PeriodicTask`]. Tasks abort when
//! stopped or dropped so a reloaded process never keeps stale timers alive.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::debug;

pub struct PeriodicTask {
    name: &'static str,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    /// Spawns `tick` every `period`. The first run happens one period from now.
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                tick().await;
            }
        });

        debug!(task = name, period_ms = period.as_millis() as u64, "Periodic task started");

        Self {
            name,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            debug!(task = self.name, "Periodic task stopped");
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The set of tasks owned by one service.
#[derive(Default)]
pub struct TaskGroup {
    tasks: Mutex<Vec<PeriodicTask>>,
}

impl TaskGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, task: PeriodicTask) {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(task);
    }

    pub fn running(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|t| t.is_running())
            .count()
    }

    pub fn stop_all(&self) {
        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for task in tasks.iter_mut() {
            task.stop();
        }
        tasks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_task_ticks_until_stopped() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let mut task = PeriodicTask::spawn("test", Duration::from_millis(10), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(55)).await;
        assert!(task.is_running());
        task.stop();
        assert!(!task.is_running());

        let seen = counter.load(Ordering::SeqCst);
        assert!(seen >= 2);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(counter.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn test_group_stop_all() {
        let group = TaskGroup::new();
        group.push(PeriodicTask::spawn("a", Duration::from_secs(60), || async {}));
        group.push(PeriodicTask::spawn("b", Duration::from_secs(60), || async {}));
        assert_eq!(group.running(), 2);
        group.stop_all();
        assert_eq!(group.running(), 0);
    }
}
