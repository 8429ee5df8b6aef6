//! Periodic task scheduler
//!
//! Owns named, cancellable periodic tasks (cache cleanup, queue retention,
//! connection health checks). Tasks tick on `tokio::time`, so tests running
//! with a paused clock drive them by advancing virtual time.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

/// Registry of named periodic tasks
#[derive(Default)]
pub struct Scheduler {
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Scheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` every `period`, first after one full period.
    ///
    /// A run that overruns the period delays the next tick instead of
    /// bursting. Registering a name that is already scheduled aborts the
    /// previous task. Must be called from within a Tokio runtime.
    pub fn every<F, Fut>(&self, name: impl Into<String>, period: Duration, task: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let task_name = name.clone();
        let first = Instant::now() + period;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(first, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                debug!(task = %task_name, "Running scheduled task");
                task().await;
            }
        });

        if let Some(previous) = self.tasks.lock().insert(name.clone(), handle) {
            previous.abort();
            debug!(task = %name, "Replaced scheduled task");
        }
    }

    /// Stop a task; returns whether it was scheduled
    pub fn cancel(&self, name: &str) -> bool {
        match self.tasks.lock().remove(name) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn is_scheduled(&self, name: &str) -> bool {
        self.tasks
            .lock()
            .get(name)
            .is_some_and(|handle| !handle.is_finished())
    }

    #[must_use]
    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Abort every task
    pub fn shutdown(&self) {
        for (name, handle) in self.tasks.lock().drain() {
            handle.abort();
            debug!(task = %name, "Cancelled scheduled task");
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for (_, handle) in self.tasks.get_mut().drain() {
            handle.abort();
        }
    }
}
