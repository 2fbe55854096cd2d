//! Background task scheduling with deterministic cancellation.
//!
//! Every timer the crate starts (reconnect backoff, health sweep, cache
//! cleanup, quota check, prefetch drain, socket monitors) goes through a
//! [`Scheduler`]. The scheduler keeps the abort handle of each task so a
//! single [`Scheduler::shutdown`] cancels all pending work.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::AbortHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

/// Cancellation handle for a scheduled task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    name: String,
    abort: AbortHandle,
}

impl TaskHandle {
    /// Task name given at scheduling time.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cancel the task. Cancelling a finished task is a no-op.
    pub fn cancel(&self) {
        self.abort.abort();
    }

    /// Whether the task has completed or been cancelled.
    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}

/// Tracks spawned tasks so they can be cancelled together.
#[derive(Debug, Default)]
pub struct Scheduler {
    tasks: Mutex<Vec<TaskHandle>>,
}

impl Scheduler {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `tick` every `period`, first firing one period from now.
    pub fn every<F, Fut>(&self, name: &str, period: Duration, mut tick: F) -> TaskHandle
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.spawn(name, async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                tick().await;
            }
        })
    }

    /// Run `fut` once after `delay`.
    pub fn after<Fut>(&self, name: &str, delay: Duration, fut: Fut) -> TaskHandle
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.spawn(name, async move {
            tokio::time::sleep(delay).await;
            fut.await;
        })
    }

    /// Spawn a tracked task immediately.
    pub fn spawn<Fut>(&self, name: &str, fut: Fut) -> TaskHandle
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let join = tokio::spawn(fut);
        let handle = TaskHandle {
            name: name.to_string(),
            abort: join.abort_handle(),
        };

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle.clone());
        handle
    }

    /// Number of tracked tasks that are still pending.
    pub fn active_count(&self) -> usize {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|t| !t.is_finished());
        tasks.len()
    }

    /// Cancel every tracked task. Returns how many were still pending.
    pub fn shutdown(&self) -> usize {
        let drained: Vec<TaskHandle> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };

        let mut cancelled = 0;
        for task in drained {
            if !task.is_finished() {
                debug!("Cancelling task {}", task.name);
                task.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }
}
