//! Per-group serialization queue with a global concurrency cap.
//!
//! At most one unit of work runs per group, and at most `max_concurrent`
//! across all groups. Overflow waits in a FIFO list of groups.
//!
//! Key semantics:
//! - Queued tasks drain before a pending message check (priority ordering)
//! - Message checks collapse into a single pending flag per group
//! - Failed message checks retry with exponential backoff, then are dropped
//! - Follow-up messages reach an active worker through its mailbox `input/`
//! - Shutdown detaches running workers instead of killing them

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use groupvisor_core::ipc::{group_ipc_dir, write_close_sentinel, write_followup};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Processes pending messages for a group. Returns true on success.
pub type ProcessMessagesFn = Arc<dyn Fn(String) -> BoxFuture<'static, bool> + Send + Sync>;

/// One scheduled job's work.
pub type TaskFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Called with the group id when a message check is dropped after exhausted retries.
pub type DroppedFn = Arc<dyn Fn(String) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(5),
        }
    }
}

/// The worker currently serving a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessHandle {
    pub container_name: String,
    pub group_folder: String,
}

struct QueuedTask {
    id: String,
    task_fn: TaskFn,
}

#[derive(Default)]
struct GroupState {
    active: bool,
    idle_waiting: bool,
    is_task_run: bool,
    running_task_id: Option<String>,
    pending_messages: bool,
    pending_tasks: VecDeque<QueuedTask>,
    process: Option<ProcessHandle>,
    retry_count: u32,
}

struct Inner {
    groups: HashMap<String, GroupState>,
    active_count: usize,
    max_concurrent: usize,
    waiting_groups: VecDeque<String>,
    process_messages_fn: Option<ProcessMessagesFn>,
    on_dropped: Option<DroppedFn>,
    shutting_down: bool,
    ipc_dir: PathBuf,
    retry: RetryPolicy,
}

/// Work picked under the lock, started after it is released.
enum Launch {
    Messages(String),
    Task(String, QueuedTask),
}

impl Inner {
    fn get_or_insert(&mut self, group: &str) -> &mut GroupState {
        self.groups.entry(group.to_string()).or_default()
    }

    fn at_capacity(&self) -> bool {
        self.active_count >= self.max_concurrent
    }

    fn mark_waiting(&mut self, group: &str) {
        if !self.waiting_groups.iter().any(|g| g == group) {
            self.waiting_groups.push_back(group.to_string());
        }
    }

    /// Claim a slot for `group` and return the launch. The caller has
    /// already checked capacity and that the group is idle.
    fn start_messages(&mut self, group: &str) -> Launch {
        let state = self.get_or_insert(group);
        state.active = true;
        state.idle_waiting = false;
        state.is_task_run = false;
        state.pending_messages = false;
        self.active_count += 1;
        Launch::Messages(group.to_string())
    }

    fn start_task(&mut self, group: &str, task: QueuedTask) -> Launch {
        let state = self.get_or_insert(group);
        state.active = true;
        state.idle_waiting = false;
        state.is_task_run = true;
        state.running_task_id = Some(task.id.clone());
        self.active_count += 1;
        Launch::Task(group.to_string(), task)
    }

    fn finish(&mut self, group: &str) {
        if let Some(state) = self.groups.get_mut(group) {
            state.active = false;
            state.idle_waiting = false;
            state.is_task_run = false;
            state.running_task_id = None;
            state.process = None;
        }
        self.active_count = self.active_count.saturating_sub(1);
    }

    /// Next work for one idle group: its oldest task, else its pending check.
    fn next_for_group(&mut self, group: &str) -> Option<Launch> {
        let state = self.groups.get_mut(group)?;
        if state.active {
            return None;
        }
        if let Some(task) = state.pending_tasks.pop_front() {
            return Some(self.start_task(group, task));
        }
        if state.pending_messages {
            return Some(self.start_messages(group));
        }
        None
    }

    /// The only place queued work is started after a run ends.
    fn drain(&mut self, group: &str) -> Vec<Launch> {
        let mut launches = Vec::new();
        if self.shutting_down {
            return launches;
        }

        if let Some(launch) = self.next_for_group(group) {
            launches.push(launch);
        }

        while !self.at_capacity() {
            let Some(next) = self.waiting_groups.pop_front() else {
                break;
            };
            if let Some(launch) = self.next_for_group(&next) {
                launches.push(launch);
            }
        }
        launches
    }
}

/// Queue state for one group, as reported over HTTP.
#[derive(Debug, Clone, Serialize)]
pub struct GroupStatus {
    pub group: String,
    pub active: bool,
    pub idle_waiting: bool,
    pub running_task_id: Option<String>,
    pub pending_messages: bool,
    pub pending_tasks: Vec<String>,
    pub retry_count: u32,
    pub process: Option<ProcessHandle>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub active_count: usize,
    pub max_concurrent: usize,
    pub shutting_down: bool,
    pub waiting_groups: Vec<String>,
    pub groups: Vec<GroupStatus>,
}

/// Group queue managing per-group serialization and global concurrency.
#[derive(Clone)]
pub struct GroupQueue {
    inner: Arc<Mutex<Inner>>,
}

impl GroupQueue {
    pub fn new(max_concurrent: usize, ipc_dir: PathBuf, retry: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                groups: HashMap::new(),
                active_count: 0,
                max_concurrent: max_concurrent.max(1),
                waiting_groups: VecDeque::new(),
                process_messages_fn: None,
                on_dropped: None,
                shutting_down: false,
                ipc_dir,
                retry,
            })),
        }
    }

    /// Set the callback invoked to process messages for a group.
    pub async fn set_process_messages_fn(&self, f: ProcessMessagesFn) {
        self.inner.lock().await.process_messages_fn = Some(f);
    }

    /// Set the callback invoked when a message check is given up on.
    pub async fn set_on_dropped(&self, f: DroppedFn) {
        self.inner.lock().await.on_dropped = Some(f);
    }

    /// Enqueue a message check for a group.
    pub async fn enqueue_message_check(&self, group: &str) {
        let launch = {
            let mut inner = self.inner.lock().await;
            if inner.shutting_down {
                return;
            }

            let state = inner.get_or_insert(group);
            if state.active {
                state.pending_messages = true;
                debug!(group, "worker active, message check queued");
                return;
            }

            if inner.at_capacity() {
                inner.get_or_insert(group).pending_messages = true;
                inner.mark_waiting(group);
                debug!(
                    group,
                    active_count = inner.active_count,
                    "at concurrency limit, message check queued"
                );
                return;
            }

            inner.start_messages(group)
        };

        self.spawn_launch(launch);
    }

    /// Enqueue a job's work for a group. Tasks have priority over messages
    /// and are de-duplicated by id.
    pub async fn enqueue_task(&self, group: &str, task_id: &str, task_fn: TaskFn) {
        let launch = {
            let mut inner = self.inner.lock().await;
            if inner.shutting_down {
                return;
            }

            let ipc_dir = inner.ipc_dir.clone();
            let state = inner.get_or_insert(group);

            if state.running_task_id.as_deref() == Some(task_id)
                || state.pending_tasks.iter().any(|t| t.id == task_id)
            {
                debug!(group, task_id, "task already queued or running, skipping");
                return;
            }

            let task = QueuedTask {
                id: task_id.to_string(),
                task_fn,
            };

            if state.active {
                state.pending_tasks.push_back(task);
                // An idle worker would otherwise hold the slot until its idle timeout.
                if state.idle_waiting {
                    if let Some(process) = &state.process {
                        close_worker(&ipc_dir, group, &process.group_folder);
                    }
                }
                debug!(group, task_id, "worker active, task queued");
                return;
            }

            if inner.at_capacity() {
                inner.get_or_insert(group).pending_tasks.push_back(task);
                inner.mark_waiting(group);
                debug!(
                    group,
                    task_id,
                    active_count = inner.active_count,
                    "at concurrency limit, task queued"
                );
                return;
            }

            inner.start_task(group, task)
        };

        self.spawn_launch(launch);
    }

    /// Associate the running worker with its group.
    pub async fn register_process(&self, group: &str, handle: ProcessHandle) {
        let mut inner = self.inner.lock().await;
        inner.get_or_insert(group).process = Some(handle);
    }

    /// Mark the worker as waiting for input. Pending tasks preempt it.
    pub async fn notify_idle(&self, group: &str) {
        let mut inner = self.inner.lock().await;
        let ipc_dir = inner.ipc_dir.clone();
        let state = inner.get_or_insert(group);
        state.idle_waiting = true;
        if !state.pending_tasks.is_empty() {
            if let Some(process) = &state.process {
                close_worker(&ipc_dir, group, &process.group_folder);
            }
        }
    }

    /// Pipe a follow-up message into the active worker. False means the
    /// caller must queue a fresh run instead.
    pub async fn send_followup(&self, group: &str, text: &str) -> bool {
        let dir = {
            let inner = self.inner.lock().await;
            let Some(state) = inner.groups.get(group) else {
                return false;
            };
            if !state.active || state.is_task_run {
                return false;
            }
            match &state.process {
                Some(process) => group_ipc_dir(&inner.ipc_dir, &process.group_folder),
                None => return false,
            }
        };

        match write_followup(&dir, text) {
            Ok(_) => {
                let mut inner = self.inner.lock().await;
                if let Some(state) = inner.groups.get_mut(group) {
                    state.idle_waiting = false;
                }
                true
            }
            Err(e) => {
                error!(group, err = %e, "failed to write follow-up message");
                false
            }
        }
    }

    /// Ask the active worker to wind down gracefully.
    pub async fn request_idle_close(&self, group: &str) {
        let inner = self.inner.lock().await;
        if let Some(state) = inner.groups.get(group) {
            if state.active {
                if let Some(process) = &state.process {
                    close_worker(&inner.ipc_dir, group, &process.group_folder);
                }
            }
        }
    }

    pub async fn is_active(&self, group: &str) -> bool {
        let inner = self.inner.lock().await;
        inner.groups.get(group).is_some_and(|s| s.active)
    }

    pub async fn active_count(&self) -> usize {
        self.inner.lock().await.active_count
    }

    pub async fn snapshot(&self) -> QueueSnapshot {
        let inner = self.inner.lock().await;
        let mut groups: Vec<GroupStatus> = inner
            .groups
            .iter()
            .map(|(group, s)| GroupStatus {
                group: group.clone(),
                active: s.active,
                idle_waiting: s.idle_waiting,
                running_task_id: s.running_task_id.clone(),
                pending_messages: s.pending_messages,
                pending_tasks: s.pending_tasks.iter().map(|t| t.id.clone()).collect(),
                retry_count: s.retry_count,
                process: s.process.clone(),
            })
            .collect();
        groups.sort_by(|a, b| a.group.cmp(&b.group));
        QueueSnapshot {
            active_count: inner.active_count,
            max_concurrent: inner.max_concurrent,
            shutting_down: inner.shutting_down,
            waiting_groups: inner.waiting_groups.iter().cloned().collect(),
            groups,
        }
    }

    /// Stop accepting work and give running workers `grace` to finish.
    /// Whatever is still running afterwards is detached, not killed.
    pub async fn shutdown(&self, grace: Duration) {
        {
            let mut inner = self.inner.lock().await;
            inner.shutting_down = true;
            info!(
                active_count = inner.active_count,
                grace_ms = grace.as_millis() as u64,
                "group queue shutting down"
            );
        }

        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            if self.active_count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let inner = self.inner.lock().await;
        let detached: Vec<String> = inner
            .groups
            .values()
            .filter(|s| s.active)
            .filter_map(|s| s.process.as_ref().map(|p| p.container_name.clone()))
            .collect();
        info!(
            active_count = inner.active_count,
            detached_containers = ?detached,
            "group queue stopped (remaining workers detached, not killed)"
        );
    }

    /// Accept work again after [`shutdown`](Self::shutdown). Workers that
    /// were detached keep their slots until they finish.
    pub async fn reopen(&self) {
        let mut inner = self.inner.lock().await;
        if inner.shutting_down {
            inner.shutting_down = false;
            info!(active_count = inner.active_count, "group queue reopened");
        }
    }

    fn spawn_launch(&self, launch: Launch) {
        let queue = self.clone();
        match launch {
            Launch::Messages(group) => {
                tokio::spawn(async move { queue.run_for_group(group).await });
            }
            Launch::Task(group, task) => {
                tokio::spawn(async move { queue.run_task(group, task).await });
            }
        }
    }

    async fn run_for_group(self, group: String) {
        debug!(group = group.as_str(), "starting message check");

        let process_fn = self.inner.lock().await.process_messages_fn.clone();
        let success = match process_fn {
            // Run on its own task so a panic is reported as a failure.
            Some(f) => match tokio::spawn(f(group.clone())).await {
                Ok(ok) => ok,
                Err(e) => {
                    error!(group = group.as_str(), err = %e, "message check panicked");
                    false
                }
            },
            None => {
                warn!(group = group.as_str(), "no process_messages_fn set, skipping");
                false
            }
        };

        let (launches, dropped) = {
            let mut inner = self.inner.lock().await;
            let dropped = if success {
                inner.get_or_insert(&group).retry_count = 0;
                None
            } else {
                self.schedule_retry(&mut inner, &group)
            };
            inner.finish(&group);
            (inner.drain(&group), dropped)
        };

        if let Some(on_dropped) = dropped {
            on_dropped(group);
        }
        for launch in launches {
            self.spawn_launch(launch);
        }
    }

    /// Returns the drop callback when retries are exhausted.
    fn schedule_retry(&self, inner: &mut Inner, group: &str) -> Option<DroppedFn> {
        let retry = inner.retry.clone();
        let state = inner.get_or_insert(group);
        state.retry_count += 1;
        let attempt = state.retry_count;

        if attempt > retry.max_retries {
            state.retry_count = 0;
            error!(
                group,
                retries = retry.max_retries,
                "max retries exceeded, dropping message check (next incoming message retries)"
            );
            return inner.on_dropped.clone();
        }

        let delay = retry.delay_for(attempt);
        info!(
            group,
            retry_count = attempt,
            delay_ms = delay.as_millis() as u64,
            "scheduling retry with backoff"
        );
        let queue = self.clone();
        let group = group.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.enqueue_message_check(&group).await;
        });
        None
    }

    async fn run_task(self, group: String, task: QueuedTask) {
        debug!(
            group = group.as_str(),
            task_id = task.id.as_str(),
            "running queued task"
        );

        if let Err(e) = tokio::spawn((task.task_fn)()).await {
            error!(
                group = group.as_str(),
                task_id = task.id.as_str(),
                err = %e,
                "task panicked"
            );
        }

        let launches = {
            let mut inner = self.inner.lock().await;
            inner.finish(&group);
            inner.drain(&group)
        };
        for launch in launches {
            self.spawn_launch(launch);
        }
    }
}

fn close_worker(ipc_dir: &std::path::Path, group: &str, folder: &str) {
    if let Err(e) = write_close_sentinel(&group_ipc_dir(ipc_dir, folder)) {
        warn!(group, err = %e, "failed to write close sentinel");
    }
}
