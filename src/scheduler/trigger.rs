//! Trigger construction and start-time spreading.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use cron::Schedule;
use rand::Rng;
use tracing::warn;

use crate::model::Server;

/// Process-wide monotonic component of job identities. Two jobs can never
/// share a key within one process run, whatever the random suffix does.
static JOB_SEQ: AtomicU64 = AtomicU64::new(0);

/// Produce a fresh job key for `server`:
/// `host:port-<monotonic-seq>-<6 random digits>`. The same key names the
/// job's trigger.
pub fn next_job_key(server: &Server) -> String {
    let seq = JOB_SEQ.fetch_add(1, Ordering::Relaxed);
    let mut rng = rand::rng();
    let suffix: u32 = rng.random_range(0..1_000_000);
    format!("{}-{}-{:06}", server.key(), seq, suffix)
}

/// Uniform random start offset in `[0, period_seconds * 1000)` milliseconds.
///
/// Jobs scheduled together (startup, reload) would otherwise all tick at the
/// same instants; the spread decorrelates them across the fleet.
pub fn compute_spread_delay(period_seconds: u64) -> Duration {
    let bound_ms = period_seconds.saturating_mul(1000);
    if bound_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..bound_ms))
}

/// When a scheduled job ticks.
#[derive(Debug, Clone)]
pub enum TriggerKind {
    /// Seconds-resolution cron schedule.
    Cron(Schedule),
    /// Fixed interval between ticks.
    Interval(Duration),
}

/// A schedule specification for one job: cron or fixed interval, plus the
/// spread offset applied before the first tick.
#[derive(Debug, Clone)]
pub struct Trigger {
    pub name: String,
    pub kind: TriggerKind,
    pub start_delay: Duration,
}

/// Build the trigger for `server`. A present-and-parsable cron expression
/// wins; otherwise the per-server period (falling back to the global run
/// period) drives a fixed-interval trigger. An unparsable cron expression is
/// logged and treated as absent.
pub fn create_trigger(server: &Server, default_period_seconds: u64, name: String) -> Trigger {
    let default_period = default_period_seconds.max(1);

    if let Some(expr) = &server.cron {
        match Schedule::from_str(expr) {
            Ok(schedule) => {
                return Trigger {
                    name,
                    kind: TriggerKind::Cron(schedule),
                    start_delay: compute_spread_delay(default_period),
                };
            }
            Err(e) => {
                warn!(
                    server = %server.key(),
                    cron = %expr,
                    error = %e,
                    "invalid cron expression, falling back to interval trigger"
                );
            }
        }
    }

    let period = server.run_period_seconds.unwrap_or(default_period).max(1);
    Trigger {
        name,
        kind: TriggerKind::Interval(Duration::from_secs(period)),
        start_delay: compute_spread_delay(period),
    }
}
