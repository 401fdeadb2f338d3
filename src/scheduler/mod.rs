//! Job scheduler: fires one tick per `(server, trigger)` at its due times.
//!
//! Each scheduled job runs as its own task that sleeps out the spread offset
//! and then ticks on its trigger's cadence. A tick only submits work to the
//! bounded pools, so firing is non-blocking with respect to query I/O. The
//! scheduler is the sole producer of server-job invocations; it never touches
//! writers itself.

mod trigger;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::AgentError;

pub use trigger::{compute_spread_delay, create_trigger, next_job_key, Trigger, TriggerKind};

/// Settle delay observed after stopping all jobs, before pool teardown
/// begins. A tick that was mid-submission when its task was cancelled gets
/// this long to land in the pools.
// TODO: drop the settle once ticks are confirmed-complete on cancellation
// instead of being given a fixed window.
pub const SCHEDULER_SETTLE: Duration = Duration::from_millis(1500);

pub struct Scheduler {
    started: AtomicBool,
    jobs: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            started: AtomicBool::new(false),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Schedule `tick` under `key` on the cadence described by `trigger`.
    /// The key doubles as the trigger name and must be unique.
    pub fn schedule_job<F>(&self, key: String, trigger: Trigger, tick: F) -> Result<(), AgentError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        if !self.is_started() {
            return Err(AgentError::Scheduler(
                "cannot schedule a job on a stopped scheduler".to_string(),
            ));
        }

        let Trigger {
            name, kind, start_delay,
        } = trigger;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(start_delay).await;
            match kind {
                TriggerKind::Interval(period) => {
                    let mut ticker = tokio::time::interval(period);
                    loop {
                        // First tick completes immediately, i.e. right after
                        // the spread delay.
                        ticker.tick().await;
                        tick();
                    }
                }
                TriggerKind::Cron(schedule) => loop {
                    let now = Utc::now();
                    let Some(next) = schedule.after(&now).next() else {
                        debug!(trigger = %name, "cron schedule exhausted");
                        break;
                    };
                    let wait = (next - now).to_std().unwrap_or_default();
                    tokio::time::sleep(wait).await;
                    tick();
                },
            }
        });

        let mut jobs = self.jobs.lock().expect("scheduler job table lock");
        if jobs.contains_key(&key) {
            handle.abort();
            return Err(AgentError::Scheduler(format!("duplicate job key {key}")));
        }
        debug!(job = %key, "scheduled job");
        jobs.insert(key, handle);
        Ok(())
    }

    pub fn job_count(&self) -> usize {
        self.jobs.lock().expect("scheduler job table lock").len()
    }

    pub fn job_keys(&self) -> Vec<String> {
        self.jobs
            .lock()
            .expect("scheduler job table lock")
            .keys()
            .cloned()
            .collect()
    }

    /// Deschedule every job. The scheduler itself keeps running, so new jobs
    /// can be added immediately afterwards (the reload path relies on this).
    pub fn delete_all_jobs(&self) {
        let jobs: Vec<(String, JoinHandle<()>)> = self
            .jobs
            .lock()
            .expect("scheduler job table lock")
            .drain()
            .collect();
        for (key, handle) in jobs {
            handle.abort();
            debug!(job = %key, "deleted scheduled job");
        }
    }

    /// Stop firing: deschedule everything, wait up to `grace` for job tasks
    /// to wind down, then observe the settle delay so in-flight ticks land
    /// in the pools before those are torn down. A tick is synchronous, so
    /// cancellation never interrupts one midway.
    pub async fn stop(&self, grace: Duration) {
        self.started.store(false, Ordering::SeqCst);
        let jobs: Vec<(String, JoinHandle<()>)> = self
            .jobs
            .lock()
            .expect("scheduler job table lock")
            .drain()
            .collect();
        let deadline = tokio::time::Instant::now() + grace;
        for (_, handle) in jobs {
            handle.abort();
            let _ = tokio::time::timeout_at(deadline, handle).await;
        }
        tokio::time::sleep(SCHEDULER_SETTLE).await;
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    use super::*;

    fn interval_trigger(period: Duration) -> Trigger {
        Trigger {
            name: "test-trigger".to_string(),
            kind: TriggerKind::Interval(period),
            start_delay: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn rejects_jobs_before_start() {
        let scheduler = Scheduler::new();
        let result = scheduler.schedule_job(
            "k".to_string(),
            interval_trigger(Duration::from_secs(1)),
            || {},
        );
        assert!(matches!(result, Err(AgentError::Scheduler(_))));
    }

    #[tokio::test]
    async fn interval_job_fires_repeatedly() {
        let scheduler = Scheduler::new();
        scheduler.start();
        let ticks = Arc::new(AtomicUsize::new(0));
        {
            let ticks = ticks.clone();
            scheduler
                .schedule_job(
                    "job-1".to_string(),
                    interval_trigger(Duration::from_millis(50)),
                    move || {
                        ticks.fetch_add(1, Ordering::SeqCst);
                    },
                )
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(ticks.load(Ordering::SeqCst) >= 3);
        scheduler.delete_all_jobs();
    }

    #[tokio::test]
    async fn deleted_jobs_stop_firing() {
        let scheduler = Scheduler::new();
        scheduler.start();
        let ticks = Arc::new(AtomicUsize::new(0));
        {
            let ticks = ticks.clone();
            scheduler
                .schedule_job(
                    "job-1".to_string(),
                    interval_trigger(Duration::from_millis(30)),
                    move || {
                        ticks.fetch_add(1, Ordering::SeqCst);
                    },
                )
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.delete_all_jobs();
        assert_eq!(scheduler.job_count(), 0);
        let after_delete = ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), after_delete);
    }

    #[tokio::test]
    async fn duplicate_keys_are_refused() {
        let scheduler = Scheduler::new();
        scheduler.start();
        scheduler
            .schedule_job(
                "same".to_string(),
                interval_trigger(Duration::from_secs(60)),
                || {},
            )
            .unwrap();
        let result = scheduler.schedule_job(
            "same".to_string(),
            interval_trigger(Duration::from_secs(60)),
            || {},
        );
        assert!(matches!(result, Err(AgentError::Scheduler(_))));
        assert_eq!(scheduler.job_count(), 1);
        scheduler.delete_all_jobs();
    }

    #[tokio::test]
    async fn cron_job_fires_on_schedule() {
        use std::str::FromStr;

        let scheduler = Scheduler::new();
        scheduler.start();
        let ticks = Arc::new(AtomicUsize::new(0));
        {
            let ticks = ticks.clone();
            let trigger = Trigger {
                name: "cron-trigger".to_string(),
                kind: TriggerKind::Cron(cron::Schedule::from_str("* * * * * *").unwrap()),
                start_delay: Duration::ZERO,
            };
            scheduler
                .schedule_job("cron-job".to_string(), trigger, move || {
                    ticks.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert!(ticks.load(Ordering::SeqCst) >= 2);
        scheduler.delete_all_jobs();
    }
}
