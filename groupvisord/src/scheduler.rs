//! Task scheduler: polls the job store for due jobs and hands them off.
//!
//! Each poll fetches active jobs whose `next_run` has passed, re-reads every
//! one by id (a pause or cancel may have raced the query) and passes the
//! fresh copy to the dispatch callback. The callback owns execution; the
//! scheduler itself never runs a worker.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use futures::future::BoxFuture;
use groupvisor_core::persistence::{format_timestamp, now_timestamp};
use groupvisor_core::{JobStatus, Schedule, ScheduleError, ScheduleKind, ScheduledJob, Store};
use tracing::{debug, error, info};

use crate::lifecycle::LoopRun;

/// Receives each due job. Expected to enqueue, not to run inline.
pub type DispatchFn = Arc<dyn Fn(ScheduledJob) -> BoxFuture<'static, ()> + Send + Sync>;

/// Longest `last_result` kept on a job row.
pub const SUMMARY_MAX_CHARS: usize = 200;

pub struct TaskScheduler {
    store: Arc<dyn Store>,
    poll_interval: Duration,
    dispatch: DispatchFn,
}

impl TaskScheduler {
    pub fn new(store: Arc<dyn Store>, poll_interval: Duration, dispatch: DispatchFn) -> Self {
        Self {
            store,
            poll_interval,
            dispatch,
        }
    }

    /// Poll until the loop is stopped.
    pub async fn run(&self, mut run: LoopRun) {
        run.mark_running();
        info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "scheduler loop started"
        );
        loop {
            if run.is_cancelled() {
                break;
            }
            self.poll_once().await;
            if !run.sleep(self.poll_interval).await {
                break;
            }
        }
        info!("scheduler loop shutting down");
    }

    /// One pass over due jobs. Returns how many were dispatched.
    pub async fn poll_once(&self) -> usize {
        let due = match self.store.get_due_jobs(&now_timestamp()) {
            Ok(due) => due,
            Err(e) => {
                error!(err = %e, "failed to query due jobs");
                return 0;
            }
        };
        if !due.is_empty() {
            info!(count = due.len(), "found due jobs");
        }

        let mut dispatched = 0;
        for job in due {
            match self.store.get_job(&job.id) {
                Ok(Some(current)) if current.status == JobStatus::Active => {
                    debug!(task_id = %current.id, group = %current.group_folder, "dispatching job");
                    (self.dispatch)(current).await;
                    dispatched += 1;
                }
                Ok(Some(current)) => {
                    debug!(task_id = %current.id, status = %current.status, "job no longer active, skipping");
                }
                Ok(None) => {
                    debug!(task_id = %job.id, "job deleted, skipping");
                }
                Err(e) => {
                    error!(task_id = %job.id, err = %e, "failed to re-check job");
                }
            }
        }
        dispatched
    }
}

/// Next run for a job that just finished, or `None` when it is done.
///
/// One-shots are done whatever their stored value. A recurring schedule
/// that no longer parses is an error, never a completion.
pub fn compute_next_run(
    job: &ScheduledJob,
    tz: Tz,
    now: DateTime<Utc>,
) -> Result<Option<String>, ScheduleError> {
    if job.schedule_type == ScheduleKind::Once {
        return Ok(None);
    }
    let schedule = Schedule::parse(job.schedule_type, &job.schedule_value, tz)?;
    Ok(schedule.next_run_after(now).map(format_timestamp))
}

/// Text stored in `last_result` after a run.
pub fn result_summary(result: Option<&str>, error: Option<&str>) -> String {
    if let Some(e) = error {
        format!("Error: {e}")
    } else if let Some(r) = result {
        r.chars().take(SUMMARY_MAX_CHARS).collect()
    } else {
        "Completed".to_string()
    }
}
