//! Fixed-interval job runner that never overlaps itself.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
pub struct SchedulerStats {
    pub runs: AtomicU64,
    pub skipped: AtomicU64,
}

/// Runs a job every `interval`; a tick that finds the previous run still in
/// flight is skipped.
pub struct Scheduler {
    name: &'static str,
    interval: Duration,
    cancel: CancellationToken,
    stats: Arc<SchedulerStats>,
}

impl Scheduler {
    pub fn new(name: &'static str, interval: Duration, cancel: CancellationToken) -> Self {
        Self {
            name,
            interval,
            cancel,
            stats: Arc::new(SchedulerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<SchedulerStats> {
        self.stats.clone()
    }

    /// Tick until cancelled, then wait for the in-flight run to finish.
    pub async fn run<F, Fut>(self, mut job: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut running: Option<JoinHandle<()>> = None;

        info!(job = self.name, interval_secs = self.interval.as_secs(), "Scheduler started");

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if running.as_ref().is_some_and(|handle| !handle.is_finished()) {
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                debug!(job = self.name, "Previous run still in flight, skipping tick");
                continue;
            }

            if let Some(handle) = running.take() {
                if let Err(e) = handle.await {
                    warn!(job = self.name, error = %e, "Job panicked");
                }
            }

            self.stats.runs.fetch_add(1, Ordering::Relaxed);
            running = Some(tokio::spawn(job()));
        }

        if let Some(handle) = running {
            debug!(job = self.name, "Waiting for in-flight run");
            if let Err(e) = handle.await {
                warn!(job = self.name, error = %e, "Job panicked");
            }
        }
        info!(
            job = self.name,
            runs = self.stats.runs.load(Ordering::Relaxed),
            skipped = self.stats.skipped.load(Ordering::Relaxed),
            "Scheduler stopped"
        );
    }
}
