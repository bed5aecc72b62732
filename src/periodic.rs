use chrono::{prelude::*, Duration as ChronoDuration};
use once_cell::sync::Lazy;
use procrastinate_cron::CronSchedule;
use procrastinate_shutdown_signal::ShutdownSignal;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::errors::ProcrastinateError;
use crate::store::JobStore;

static DURATION_ZERO: Lazy<ChronoDuration> = Lazy::new(ChronoDuration::zero);

/// A recurring task registered on the worker: at every slot of `schedule`,
/// one job is deferred cluster-wide.
#[derive(Debug, Clone)]
pub(crate) struct PeriodicTask {
    pub(crate) task_name: String,
    pub(crate) queue_name: String,
    pub(crate) schedule: CronSchedule,
    pub(crate) args: serde_json::Value,
}

/// In-process scheduler for periodic tasks.
///
/// Runs inside every worker; `defer_periodic` is idempotent on
/// (task, slot), so concurrent deferrers across the cluster are safe and
/// exactly one wins each slot. Sleeps until the next slot of the soonest
/// schedule, then defers every slot that has come due. A late wake (clock
/// drift, suspended host) still defers the most recent `lookback` missed
/// slots per task; deeper backfill is out of scope.
pub(crate) async fn periodic_main(
    store: &JobStore,
    tasks: &[PeriodicTask],
    timezone: FixedOffset,
    lookback: u32,
    shutdown_signal: ShutdownSignal,
) -> Result<(), ProcrastinateError> {
    if tasks.is_empty() {
        return Ok(());
    }

    let start = Utc::now().with_timezone(&timezone);
    debug!(start = ?start, nb_tasks = tasks.len(), "cron:starting");

    let mut last_deferred: Vec<Option<DateTime<FixedOffset>>> = vec![None; tasks.len()];

    loop {
        let now = Utc::now().with_timezone(&timezone);

        for (task, last) in tasks.iter().zip(last_deferred.iter_mut()) {
            for slot in task.schedule.prev_slots(&now, lookback) {
                if matches!(last, Some(prev) if *prev >= slot) {
                    continue;
                }

                let mut args = task.args.clone();
                if let Some(fields) = args.as_object_mut() {
                    fields.insert("timestamp".into(), json!(slot.timestamp()));
                }

                let deferred = store
                    .defer_periodic(&task.queue_name, &task.task_name, slot.timestamp(), &args)
                    .await?;

                match deferred {
                    Some(job_id) => {
                        info!(task_name = task.task_name, job_id, slot = ?slot, "cron:deferred")
                    }
                    None => {
                        debug!(task_name = task.task_name, slot = ?slot, "cron:slot already taken")
                    }
                }

                *last = Some(slot);
            }
        }

        let next = tasks
            .iter()
            .filter_map(|task| task.schedule.next_after(&now))
            .min();
        let Some(next) = next else {
            warn!("No periodic schedule has a next slot, stopping the deferrer");
            return Ok(());
        };

        let mut shutdown = shutdown_signal.clone();
        tokio::select! {
            _ = &mut shutdown => return Ok(()),
            _ = sleep_until_time(&next) => {}
        }
    }
}

async fn sleep_until_time<Tz: TimeZone>(datetime: &DateTime<Tz>) {
    let dur = datetime.with_timezone(&Utc) - Utc::now();
    if dur <= *DURATION_ZERO {
        return;
    }

    tokio::time::sleep(dur.to_std().unwrap_or_default()).await;
}
