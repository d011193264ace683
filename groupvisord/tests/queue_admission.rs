//! GroupQueue admission and ordering, driven through its public API.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use groupvisord::queue::{GroupQueue, ProcessMessagesFn, RetryPolicy, TaskFn};
use tokio::sync::Semaphore;

fn queue(max: usize, dir: &Path) -> GroupQueue {
    GroupQueue::new(
        max,
        dir.to_path_buf(),
        RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(10),
        },
    )
}

/// Records what ran, and holds every unit of work until released.
#[derive(Clone)]
struct Probe {
    gate: Arc<Semaphore>,
    log: Arc<Mutex<Vec<String>>>,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    done: Arc<AtomicUsize>,
}

impl Probe {
    fn new() -> Self {
        Self {
            gate: Arc::new(Semaphore::new(0)),
            log: Arc::new(Mutex::new(Vec::new())),
            running: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            done: Arc::new(AtomicUsize::new(0)),
        }
    }

    async fn work(&self, label: String) {
        self.log.lock().unwrap().push(label);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.gate.acquire().await.unwrap().forget();
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.done.fetch_add(1, Ordering::SeqCst);
    }

    fn process_fn(&self) -> ProcessMessagesFn {
        let probe = self.clone();
        Arc::new(move |group: String| {
            let probe = probe.clone();
            async move {
                probe.work(format!("msg:{group}")).await;
                true
            }
            .boxed()
        })
    }

    fn task(&self, id: &str) -> TaskFn {
        let probe = self.clone();
        let label = format!("task:{id}");
        Box::new(move || async move { probe.work(label).await }.boxed())
    }

    fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    async fn wait_done(&self, n: usize) {
        for _ in 0..200 {
            if self.done.load(Ordering::SeqCst) >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("only {} of {n} units finished", self.done.load(Ordering::SeqCst));
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn concurrency_cap_holds() {
    let tmp = tempfile::tempdir().unwrap();
    let q = queue(2, tmp.path());
    let probe = Probe::new();
    q.set_process_messages_fn(probe.process_fn()).await;

    for g in ["a", "b", "c", "d", "e"] {
        q.enqueue_message_check(g).await;
    }
    settle().await;
    assert_eq!(q.active_count().await, 2);
    assert_eq!(q.snapshot().await.waiting_groups, vec!["c", "d", "e"]);

    probe.release(5);
    probe.wait_done(5).await;
    assert!(probe.peak.load(Ordering::SeqCst) <= 2);
    let mut ran = probe.log();
    ran.sort();
    assert_eq!(ran, vec!["msg:a", "msg:b", "msg:c", "msg:d", "msg:e"]);
}

#[tokio::test]
async fn repeated_checks_collapse_into_one_followup() {
    let tmp = tempfile::tempdir().unwrap();
    let q = queue(3, tmp.path());
    let probe = Probe::new();
    q.set_process_messages_fn(probe.process_fn()).await;

    q.enqueue_message_check("a").await;
    settle().await;
    for _ in 0..3 {
        q.enqueue_message_check("a").await;
    }
    assert_eq!(q.active_count().await, 1);

    probe.release(10);
    probe.wait_done(2).await;
    settle().await;
    assert_eq!(probe.log(), vec!["msg:a", "msg:a"]);
    assert_eq!(probe.peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn queued_task_runs_before_pending_messages() {
    let tmp = tempfile::tempdir().unwrap();
    let q = queue(1, tmp.path());
    let probe = Probe::new();
    q.set_process_messages_fn(probe.process_fn()).await;

    q.enqueue_message_check("a").await;
    settle().await;
    q.enqueue_message_check("a").await;
    q.enqueue_task("a", "t1", probe.task("t1")).await;
    q.enqueue_task("a", "t1", probe.task("t1")).await;

    probe.release(10);
    probe.wait_done(3).await;
    settle().await;
    assert_eq!(probe.log(), vec!["msg:a", "task:t1", "msg:a"]);
}

#[tokio::test]
async fn waiting_groups_are_served_in_arrival_order() {
    let tmp = tempfile::tempdir().unwrap();
    let q = queue(1, tmp.path());
    let probe = Probe::new();
    q.set_process_messages_fn(probe.process_fn()).await;

    q.enqueue_message_check("a").await;
    settle().await;
    q.enqueue_task("c", "job-c", probe.task("job-c")).await;
    q.enqueue_message_check("b").await;

    probe.release(3);
    probe.wait_done(3).await;
    assert_eq!(probe.log(), vec!["msg:a", "task:job-c", "msg:b"]);
}

#[tokio::test]
async fn nothing_starts_after_shutdown() {
    let tmp = tempfile::tempdir().unwrap();
    let q = queue(2, tmp.path());
    let probe = Probe::new();
    q.set_process_messages_fn(probe.process_fn()).await;

    q.shutdown(Duration::from_millis(10)).await;
    q.enqueue_message_check("a").await;
    q.enqueue_task("a", "t1", probe.task("t1")).await;
    settle().await;

    assert!(probe.log().is_empty());
    assert_eq!(q.active_count().await, 0);
    assert!(q.snapshot().await.shutting_down);
}
