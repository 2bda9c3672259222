//! Background maintenance tasks.
//!
//! # Responsibilities
//! - Run periodic jobs (trace flush, cache sweeps) on their own tokio tasks
//! - Stop every job on one shutdown broadcast and wait for them to finish
//!
//! # Design Decisions
//! - A job in progress is allowed to finish; the loop exits at the next select
//! - The first tick is skipped so jobs do not run at startup

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::lifecycle::shutdown::Shutdown;

pub struct BackgroundTasks {
    shutdown: Shutdown,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self {
            shutdown: Shutdown::new(),
            handles: Vec::new(),
        }
    }

    /// Run `job` every `period` until shutdown.
    pub fn spawn_interval<F, Fut>(&mut self, name: &'static str, period: Duration, job: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut stop = self.shutdown.subscribe();
        let period = period.max(Duration::from_millis(10));
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => job().await,
                    _ = stop.recv() => break,
                }
            }
            tracing::debug!(task = name, "Background task stopped");
        });
        tracing::debug!(task = name, period_ms = period.as_millis() as u64, "Background task started");
        self.handles.push((name, handle));
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Signal every task and wait for all of them to exit.
    pub async fn shutdown(self) {
        self.shutdown.trigger();
        for (name, handle) in self.handles {
            if let Err(e) = handle.await {
                tracing::warn!(task = name, error = %e, "Background task ended abnormally");
            }
        }
    }
}

impl Default for BackgroundTasks {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_interval_runs_until_shutdown() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut tasks = BackgroundTasks::new();
        let counter = runs.clone();
        tasks.spawn_interval("count", Duration::from_secs(10), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert_eq!(tasks.len(), 1);

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        tasks.shutdown().await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }
}
