//! Reusable worker tasks.
//!
//! A finished worker parks on the pool for up to the idle timeout waiting for
//! another job before it exits. Jobs are only handed off when a parked worker
//! can take them; otherwise the caller spawns a fresh worker.

use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub type Job = BoxFuture<'static, ()>;

#[derive(Default)]
struct PoolState {
    idle: usize,
    queue: VecDeque<Job>,
}

#[derive(Default)]
pub struct WorkPool {
    state: Mutex<PoolState>,
    notify: Notify,
}

impl WorkPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `job` for a parked worker. Hands the job back if none is free.
    pub fn try_hand_off(&self, job: Job) -> std::result::Result<(), Job> {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if state.idle > state.queue.len() {
            state.queue.push_back(job);
            drop(state);
            self.notify.notify_one();
            Ok(())
        } else {
            Err(job)
        }
    }

    /// Park until a job arrives, the idle timeout passes, or `token` is cancelled
    pub async fn next_job(&self, idle_timeout: Duration, token: &CancellationToken) -> Option<Job> {
        {
            let mut state = self.lock();
            if let Some(job) = state.queue.pop_front() {
                return Some(job);
            }
            state.idle += 1;
        }

        let deadline = tokio::time::Instant::now() + idle_timeout;
        let job = loop {
            let notified = self.notify.notified();
            if let Some(job) = self.lock().queue.pop_front() {
                break Some(job);
            }
            tokio::select! {
                _ = notified => {
                    if let Some(job) = self.lock().queue.pop_front() {
                        break Some(job);
                    }
                }
                _ = tokio::time::sleep_until(deadline) => break None,
                _ = token.cancelled() => break None,
            }
        };

        let mut state = self.lock();
        state.idle = state.idle.saturating_sub(1);
        // A job may have been queued for us after the timeout fired
        match job {
            Some(job) => Some(job),
            None if state.queue.len() > state.idle => state.queue.pop_front(),
            None => None,
        }
    }

    /// Workers currently parked
    pub fn idle(&self) -> usize {
        self.lock().idle
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
