//! Periodic background task bound to an authorized client.
//!
//! Placeholder polling loop: every tick it checks the client's connection
//! and counts the tick. Failures are recorded and the loop keeps going.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;

use crate::bridge::LoopHandle;
use crate::eventlog::EventLog;

/// A running scheduler task. Aborted when dropped.
pub struct Scheduler {
    abort: AbortHandle,
    ticks: Arc<AtomicU64>,
    failures: Arc<AtomicU64>,
}

impl Scheduler {
    /// Start ticking on `owning_loop`. `None` if the loop is not running.
    pub fn start(
        owning_loop: &LoopHandle,
        connected: Arc<AtomicBool>,
        interval: Duration,
        event_log: Arc<EventLog>,
    ) -> Option<Self> {
        let ticks = Arc::new(AtomicU64::new(0));
        let failures = Arc::new(AtomicU64::new(0));
        let task_ticks = Arc::clone(&ticks);
        let task_failures = Arc::clone(&failures);

        let abort = owning_loop.spawn(async move {
            let mut timer = tokio::time::interval(interval.max(Duration::from_millis(1)));
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            timer.tick().await;
            loop {
                timer.tick().await;
                task_ticks.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = tick(&connected) {
                    task_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = %e, "scheduler tick failed");
                    event_log.record(&format!("Scheduler error: {e}"));
                }
            }
        })?;
        tracing::debug!(event_loop = %owning_loop.name(), ?interval, "scheduler started");
        Some(Self {
            abort,
            ticks,
            failures,
        })
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.abort.abort();
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.abort.abort();
    }
}

fn tick(connected: &AtomicBool) -> Result<(), String> {
    if connected.load(Ordering::Acquire) {
        Ok(())
    } else {
        Err("client is not connected".into())
    }
}
