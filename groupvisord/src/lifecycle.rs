//! Poll loop lifecycle: `stopped -> starting -> running -> stopping -> stopped`.
//!
//! A [`LoopGuard`] is owned by whoever controls the loop. `try_start` hands
//! out a [`LoopRun`] token only from `stopped`, so a second start is a no-op.
//! The loop body holds the token, sleeps through it between iterations, and
//! the state returns to `stopped` when the token is dropped.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug)]
pub struct LoopGuard {
    name: &'static str,
    state: Mutex<LoopState>,
    cancel: watch::Sender<bool>,
}

impl LoopGuard {
    pub fn new(name: &'static str) -> Arc<Self> {
        let (cancel, _) = watch::channel(false);
        Arc::new(Self {
            name,
            state: Mutex::new(LoopState::Stopped),
            cancel,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn lock(&self) -> MutexGuard<'_, LoopState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> LoopState {
        *self.lock()
    }

    /// Claim the loop. `None` unless it is currently stopped.
    pub fn try_start(self: &Arc<Self>) -> Option<LoopRun> {
        let mut state = self.lock();
        if *state != LoopState::Stopped {
            debug!(loop_name = self.name, state = ?*state, "loop already started");
            return None;
        }
        *state = LoopState::Starting;
        self.cancel.send_replace(false);
        Some(LoopRun {
            guard: Arc::clone(self),
            cancel: self.cancel.subscribe(),
        })
    }

    /// Ask the loop to exit at its next check. Idempotent.
    pub fn stop(&self) {
        let mut state = self.lock();
        if matches!(*state, LoopState::Starting | LoopState::Running) {
            *state = LoopState::Stopping;
            self.cancel.send_replace(true);
            info!(loop_name = self.name, "stopping loop");
        }
    }
}

/// Held by a running loop body.
#[derive(Debug)]
pub struct LoopRun {
    guard: Arc<LoopGuard>,
    cancel: watch::Receiver<bool>,
}

impl LoopRun {
    /// Move from `starting` to `running`, unless a stop already arrived.
    pub fn mark_running(&self) {
        let mut state = self.guard.lock();
        if *state == LoopState::Starting {
            *state = LoopState::Running;
            info!(loop_name = self.guard.name, "loop running");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Sleep between iterations. False means the loop should exit.
    pub async fn sleep(&mut self, period: Duration) -> bool {
        if self.is_cancelled() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(period) => !self.is_cancelled(),
            changed = self.cancel.changed() => changed.is_ok() && !self.is_cancelled(),
        }
    }
}

impl Drop for LoopRun {
    fn drop(&mut self) {
        *self.guard.lock() = LoopState::Stopped;
        debug!(loop_name = self.guard.name, "loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_start_is_refused() {
        let guard = LoopGuard::new("test");
        let run = guard.try_start().unwrap();
        assert_eq!(guard.state(), LoopState::Starting);
        run.mark_running();
        assert_eq!(guard.state(), LoopState::Running);
        assert!(guard.try_start().is_none());

        drop(run);
        assert_eq!(guard.state(), LoopState::Stopped);
        assert!(guard.try_start().is_some());
    }

    #[test]
    fn stop_before_running_sticks() {
        let guard = LoopGuard::new("test");
        let run = guard.try_start().unwrap();
        guard.stop();
        run.mark_running();
        assert_eq!(guard.state(), LoopState::Stopping);
        assert!(run.is_cancelled());
    }

    #[test]
    fn stop_when_stopped_is_noop() {
        let guard = LoopGuard::new("test");
        guard.stop();
        assert_eq!(guard.state(), LoopState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_interrupts_sleep() {
        let guard = LoopGuard::new("test");
        let mut run = guard.try_start().unwrap();
        run.mark_running();

        let loop_task = tokio::spawn(async move {
            let mut iterations = 0;
            while run.sleep(Duration::from_secs(60)).await {
                iterations += 1;
            }
            iterations
        });

        tokio::time::sleep(Duration::from_secs(150)).await;
        guard.stop();
        assert_eq!(loop_task.await.unwrap(), 2);
        assert_eq!(guard.state(), LoopState::Stopped);
    }
}
