//! Connects the scheduler's dispatch callback to GroupQueue and the supervisor.
//!
//! A due job becomes a queued task for its target chat, so it serializes
//! with that chat's message checks and counts against the global cap.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use groupvisor_core::persistence::now_timestamp;
use groupvisor_core::{
    ContextMode, JobRunLog, JobStatus, JobUpdate, ScheduledJob, WorkerInput, WorkerOutput,
    WorkerStatus,
};
use tracing::{error, info, warn};

use crate::container::OutputCallback;
use crate::message_loop::strip_internal_blocks;
use crate::orchestrator::OrchestratorContext;
use crate::process_group::IdleTimer;
use crate::queue::{ProcessHandle, TaskFn};
use crate::scheduler::{DispatchFn, compute_next_run, result_summary};

/// A finished scheduled run is closed this long after its last result.
const TASK_CLOSE_DELAY: Duration = Duration::from_secs(10);

pub fn build_dispatch_fn(ctx: Arc<OrchestratorContext>) -> DispatchFn {
    Arc::new(move |job: ScheduledJob| {
        let ctx = ctx.clone();
        async move {
            let chat_id = job.chat_id.clone();
            let task_id = job.id.clone();
            let run_ctx = ctx.clone();
            let task_fn: TaskFn = Box::new(move || {
                async move { run_scheduled_job(&run_ctx, job).await }.boxed()
            });
            ctx.queue.enqueue_task(&chat_id, &task_id, task_fn).await;
        }
        .boxed()
    })
}

/// Run one job to completion and record the outcome.
pub async fn run_scheduled_job(ctx: &Arc<OrchestratorContext>, job: ScheduledJob) {
    let start = Instant::now();

    let Some(group) = ctx.group_by_folder(&job.group_folder).await else {
        error!(task_id = %job.id, group = %job.group_folder, "group not found for scheduled job");
        let err = format!("Group not found: {}", job.group_folder);
        record_run(ctx, &job, start, None, Some(&err));
        return;
    };
    let is_main = ctx.is_main(&group);

    ctx.write_snapshots(&group.folder, is_main).await;

    let shared = job.context_mode == ContextMode::Shared;
    let session_id = if shared {
        ctx.sessions.read().await.get(&group.folder).cloned()
    } else {
        None
    };
    let input = WorkerInput {
        prompt: job.prompt.clone(),
        session_id,
        group_folder: group.folder.clone(),
        chat_id: job.chat_id.clone(),
        is_main,
        is_scheduled_task: true,
    };

    let prepared = ctx.supervisor.prepare(&group, is_main);
    ctx.queue
        .register_process(
            &job.chat_id,
            ProcessHandle {
                container_name: prepared.container_name.clone(),
                group_folder: group.folder.clone(),
            },
        )
        .await;

    info!(task_id = %job.id, group = %group.name, "running scheduled job");

    let idle = IdleTimer::new(ctx.queue.clone(), &job.chat_id, TASK_CLOSE_DELAY);
    let last_result: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let on_output = forward_results(ctx, &job, shared, idle.clone(), last_result.clone());

    let output = ctx.supervisor.execute(&prepared, &input, Some(on_output)).await;
    idle.cancel();

    if shared {
        if let Some(sid) = &output.new_session_id {
            ctx.record_session(&group.folder, sid).await;
        }
    }

    let streamed = last_result.lock().unwrap_or_else(|p| p.into_inner()).take();
    if output.is_error() {
        let err = output.error.unwrap_or_else(|| "Unknown error".to_string());
        record_run(ctx, &job, start, streamed.as_deref(), Some(&err));
    } else {
        let result = streamed.or(output.result);
        record_run(ctx, &job, start, result.as_deref(), None);
    }
}

fn forward_results(
    ctx: &Arc<OrchestratorContext>,
    job: &ScheduledJob,
    shared: bool,
    idle: Arc<IdleTimer>,
    last_result: Arc<Mutex<Option<String>>>,
) -> OutputCallback {
    let ctx = ctx.clone();
    let chat_id = job.chat_id.clone();
    let group_folder = job.group_folder.clone();
    Arc::new(move |output: WorkerOutput| {
        let ctx = ctx.clone();
        let chat_id = chat_id.clone();
        let group_folder = group_folder.clone();
        let idle = idle.clone();
        let last_result = last_result.clone();
        async move {
            if shared {
                if let Some(sid) = &output.new_session_id {
                    ctx.record_session(&group_folder, sid).await;
                }
            }

            if let Some(raw) = &output.result {
                let text = strip_internal_blocks(raw);
                if !text.is_empty() {
                    if let Err(e) = ctx.channel.send_message(&chat_id, &text).await {
                        error!(chat_id = %chat_id, err = %e, "failed to deliver job output");
                    }
                    *last_result.lock().unwrap_or_else(|p| p.into_inner()) = Some(text);
                }
                idle.reset();
            }

            if output.status == WorkerStatus::Success {
                ctx.queue.notify_idle(&chat_id).await;
            }
        }
        .boxed()
    })
}

/// Append the run log and move the job to its next run (or complete it).
fn record_run(
    ctx: &OrchestratorContext,
    job: &ScheduledJob,
    start: Instant,
    result: Option<&str>,
    error: Option<&str>,
) {
    let duration_ms = start.elapsed().as_millis() as i64;
    let status = if error.is_some() { "error" } else { "success" };

    let log = JobRunLog {
        task_id: job.id.clone(),
        run_at: now_timestamp(),
        duration_ms,
        status: status.to_string(),
        result: result.map(str::to_string),
        error: error.map(str::to_string),
    };
    if let Err(e) = ctx.store.log_job_run(&log) {
        error!(task_id = %job.id, err = %e, "failed to log job run");
    }

    let next_run = match compute_next_run(job, ctx.config.scheduler.tz(), Utc::now()) {
        Ok(next_run) => next_run,
        Err(e) => {
            // Held paused with its old next_run: neither completed nor due.
            error!(task_id = %job.id, err = %e, "stored schedule no longer parses, pausing job");
            if let Err(e) = ctx
                .store
                .update_job(&job.id, &JobUpdate::status(JobStatus::Paused))
            {
                warn!(task_id = %job.id, err = %e, "failed to pause job");
            }
            Some(job.next_run.clone().unwrap_or_else(now_timestamp))
        }
    };
    let summary = result_summary(result, error);
    if let Err(e) = ctx
        .store
        .update_job_after_run(&job.id, next_run.as_deref(), &summary)
    {
        warn!(task_id = %job.id, err = %e, "failed to update job after run");
    }

    info!(
        task_id = %job.id,
        status,
        duration_ms,
        next_run = next_run.as_deref().unwrap_or("none"),
        "scheduled job completed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::test_support::*;
    use groupvisor_core::{JobStore, ScheduleKind, SessionStore};

    fn job(id: &str, folder: &str, chat_id: &str, kind: ScheduleKind, value: &str) -> ScheduledJob {
        ScheduledJob {
            id: id.to_string(),
            group_folder: folder.to_string(),
            chat_id: chat_id.to_string(),
            prompt: "daily summary".to_string(),
            schedule_type: kind,
            schedule_value: value.to_string(),
            context_mode: ContextMode::Isolated,
            next_run: Some("2020-01-01T00:00:00.000Z".to_string()),
            last_run: None,
            last_result: None,
            status: JobStatus::Active,
            created_at: "2020-01-01T00:00:00.000Z".to_string(),
        }
    }

    #[tokio::test]
    async fn once_job_runs_and_completes() {
        let f = fixture(&reply_body(FAKE_REPLY)).await;
        let j = job("t1", "team", "team@chat", ScheduleKind::Once, "2020-01-01T00:00:00Z");
        f.store.create_job(&j).unwrap();

        run_scheduled_job(&f.ctx, j).await;

        assert_eq!(
            f.channel.sent(),
            vec![("team@chat".to_string(), "hello there".to_string())]
        );
        let stored = f.store.get_job("t1").unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.next_run, None);
        assert_eq!(stored.last_result.as_deref(), Some("hello there"));

        let runs = f.store.get_job_runs("t1").unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, "success");

        let input = f.last_input();
        assert_eq!(input["isScheduledTask"], true);
        assert_eq!(input["prompt"], "daily summary");
        assert!(input.get("sessionId").is_none());
        // Isolated runs leave the group session alone.
        assert_eq!(f.store.get_session("team").unwrap(), None);
    }

    #[tokio::test]
    async fn shared_job_resumes_group_session() {
        let f = fixture(&reply_body(FAKE_REPLY)).await;
        f.ctx.record_session("team", "sess-0").await;
        let mut j = job("t2", "team", "team@chat", ScheduleKind::Interval, "60000");
        j.context_mode = ContextMode::Shared;
        f.store.create_job(&j).unwrap();

        run_scheduled_job(&f.ctx, j).await;

        assert_eq!(f.last_input()["sessionId"], "sess-0");
        assert_eq!(f.store.get_session("team").unwrap().as_deref(), Some("sess-1"));
        let stored = f.store.get_job("t2").unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Active);
        assert!(stored.next_run.unwrap().as_str() > "2020-01-01T00:00:00.000Z");
    }

    #[tokio::test]
    async fn failed_run_is_recorded_on_the_job() {
        let f = fixture("exit 1").await;
        let j = job("t3", "team", "team@chat", ScheduleKind::Interval, "60000");
        f.store.create_job(&j).unwrap();

        run_scheduled_job(&f.ctx, j).await;

        let stored = f.store.get_job("t3").unwrap().unwrap();
        assert!(stored.last_result.unwrap().starts_with("Error: "));
        assert_eq!(f.store.get_job_runs("t3").unwrap()[0].status, "error");
        assert!(f.channel.sent().is_empty());
    }

    #[tokio::test]
    async fn missing_group_logs_error_run() {
        let f = fixture(&reply_body(FAKE_REPLY)).await;
        let j = job("t4", "ghost", "ghost@chat", ScheduleKind::Once, "2020-01-01T00:00:00Z");
        f.store.create_job(&j).unwrap();

        run_scheduled_job(&f.ctx, j).await;

        let runs = f.store.get_job_runs("t4").unwrap();
        assert_eq!(runs[0].error.as_deref(), Some("Group not found: ghost"));
        assert_eq!(
            f.store.get_job("t4").unwrap().unwrap().status,
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn unparseable_recurring_job_is_paused_not_completed() {
        let f = fixture(&reply_body(FAKE_REPLY)).await;
        let j = job("t6", "team", "team@chat", ScheduleKind::Interval, "soon");
        f.store.create_job(&j).unwrap();

        run_scheduled_job(&f.ctx, j).await;

        let stored = f.store.get_job("t6").unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Paused);
        assert_eq!(stored.next_run.as_deref(), Some("2020-01-01T00:00:00.000Z"));
        assert_eq!(stored.last_result.as_deref(), Some("hello there"));
        assert_eq!(f.store.get_job_runs("t6").unwrap()[0].status, "success");
    }

    #[tokio::test]
    async fn dispatch_goes_through_the_queue() {
        let f = fixture(&reply_body(FAKE_REPLY)).await;
        let j = job("t5", "main", "main@chat", ScheduleKind::Once, "2020-01-01T00:00:00Z");
        f.store.create_job(&j).unwrap();

        let dispatch = build_dispatch_fn(f.ctx.clone());
        dispatch(j).await;

        for _ in 0..100 {
            if f.store.get_job("t5").unwrap().unwrap().status == JobStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(
            f.store.get_job("t5").unwrap().unwrap().status,
            JobStatus::Completed
        );
        assert_eq!(f.ctx.queue.active_count().await, 0);
    }
}
