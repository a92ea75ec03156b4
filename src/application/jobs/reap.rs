//! Cron job that recovers tasks abandoned by dead workers.

use std::str::FromStr;

use apalis::prelude::*;
use apalis_cron::Schedule;
use thiserror::Error;
use time::OffsetDateTime;

use super::context::JobWorkerContext;

/// Marker struct for the cron-triggered reaper.
/// Must implement `From<chrono::DateTime<chrono::Utc>>` for apalis-cron compatibility.
#[derive(Default, Debug, Clone)]
pub struct ReapLeasesJob;

impl From<chrono::DateTime<chrono::Utc>> for ReapLeasesJob {
    fn from(_: chrono::DateTime<chrono::Utc>) -> Self {
        Self
    }
}

#[derive(Debug, Error)]
#[error("invalid cron expression `{expression}`: {reason}")]
pub struct InvalidSchedule {
    pub expression: String,
    pub reason: String,
}

/// Sweep expired leases. Failures are logged and retried on the next tick.
pub async fn process_reap_leases_job(
    _job: ReapLeasesJob,
    ctx: Data<JobWorkerContext>,
) -> Result<(), apalis::prelude::Error> {
    match ctx.reaper.sweep(OffsetDateTime::now_utc()).await {
        Ok(count) if count > 0 => {
            tracing::info!(
                target = "texcompiler::jobs::reap",
                reaped = count,
                "Reaped expired leases"
            );
        }
        Err(err) => {
            tracing::warn!(
                target = "texcompiler::jobs::reap",
                error = %err,
                "Failed to reap expired leases"
            );
        }
        _ => {}
    }
    Ok(())
}

/// Parse the reaper schedule (six-field cron, seconds first).
pub fn reap_schedule(expression: &str) -> Result<Schedule, InvalidSchedule> {
    Schedule::from_str(expression).map_err(|err| InvalidSchedule {
        expression: expression.to_string(),
        reason: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schedule_parses() {
        let schedule = reap_schedule("*/30 * * * * *").expect("schedule");
        let upcoming: Vec<_> = schedule.upcoming(chrono::Utc).take(3).collect();
        assert_eq!(upcoming.len(), 3);
    }

    #[test]
    fn garbage_schedule_is_rejected() {
        let err = reap_schedule("every now and then").expect_err("invalid");
        assert_eq!(err.expression, "every now and then");
    }
}
