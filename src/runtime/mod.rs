//! # Runtime
//!
//! Process-level context shared by every connection:
//!
//! - **Tasks**: [`Runtime::go`] runs work on pooled worker tasks,
//!   [`Runtime::spawn_tracked`] on a dedicated one. Both are counted so
//!   [`Runtime::stop`] can drain them, and both catch panics.
//! - **Stop broadcast**: one [`CancellationToken`]; every connection holds a child.
//! - **Timers**: a [`TimingWheel`] driven once per millisecond.
//! - **Registry**: live connections by id, used for broadcast and statistics.
//!
//! ## Shutdown
//! ```rust,no_run
//! # async fn run() -> netque::error::Result<()> {
//! use netque::{Runtime, RuntimeConfig};
//!
//! let rt = Runtime::new(RuntimeConfig::default())?;
//! rt.at_exit(|| println!("bye"));
//! // Returns after Ctrl-C or `rt.request_stop()`, once all tasks drained
//! rt.wait_for_system_exit().await;
//! # Ok(())
//! # }
//! ```

pub mod pool;

use crate::config::RuntimeConfig;
use crate::core::message::Message;
use crate::error::{ProtocolError, Result};
use crate::msgque::MsgQue;
use crate::timer::TimingWheel;
use crate::utils::metrics::{Metrics, MetricsSnapshot, Timer};
use futures::FutureExt;
use pool::{Job, WorkPool};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lock a std mutex, recovering the data if a panicking holder poisoned it
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

type ExitHook = Box<dyn FnOnce() + Send>;

pub struct Runtime {
    config: RuntimeConfig,
    running: AtomicBool,
    token: CancellationToken,
    exit: CancellationToken,
    pool: WorkPool,
    metrics: Metrics,
    wheel: Mutex<TimingWheel>,
    stop_checks: Mutex<HashMap<u64, String>>,
    stop_check_index: AtomicU64,
    msgques: Mutex<HashMap<u32, Arc<MsgQue>>>,
    at_exit: Mutex<Vec<ExitHook>>,
    start: Instant,
    clock_ms: AtomicU64,
}

/// Keeps `go_count` in step with the task holding it
struct GoGuard {
    rt: Arc<Runtime>,
}

impl GoGuard {
    fn new(rt: Arc<Runtime>) -> Self {
        rt.metrics.go_count.fetch_add(1, Ordering::SeqCst);
        Self { rt }
    }
}

impl Drop for GoGuard {
    fn drop(&mut self) {
        self.rt.metrics.go_count.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Runtime {
    /// Validate `config` and start the timer driver.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: RuntimeConfig) -> Result<Arc<Self>> {
        config.validate_strict()?;
        tokio::runtime::Handle::try_current()
            .map_err(|e| ProtocolError::ConfigError(format!("no tokio runtime: {e}")))?;

        let rt = Arc::new(Self {
            config,
            running: AtomicBool::new(true),
            token: CancellationToken::new(),
            exit: CancellationToken::new(),
            pool: WorkPool::new(),
            metrics: Metrics::new(),
            wheel: Mutex::new(TimingWheel::new()),
            stop_checks: Mutex::new(HashMap::new()),
            stop_check_index: AtomicU64::new(0),
            msgques: Mutex::new(HashMap::new()),
            at_exit: Mutex::new(Vec::new()),
            start: Instant::now(),
            clock_ms: AtomicU64::new(0),
        });
        rt.spawn_timer_driver();
        info!(pool_size = rt.config.pool_size, "Runtime started");
        Ok(rt)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Token cancelled when the runtime stops
    pub fn stop_token(&self) -> &CancellationToken {
        &self.token
    }

    /// Milliseconds since the runtime started, updated by the timer driver
    pub fn now_ms(&self) -> u64 {
        self.clock_ms.load(Ordering::Relaxed)
    }

    /// Unix time in seconds
    pub fn timestamp(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    /// Spawn `fut` on its own task, counted and panic-guarded
    pub fn spawn_tracked<F>(self: &Arc<Self>, fut: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = GoGuard::new(Arc::clone(self));
        tokio::spawn(async move {
            if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
                guard.rt.record_panic(panic);
            }
            drop(guard);
        })
    }

    /// Run `fut` on a pooled worker task.
    ///
    /// A parked worker takes the job if one is free; otherwise a new worker is
    /// spawned, and it joins the pool afterwards while the pool is below
    /// `pool_size`.
    pub fn go<F>(self: &Arc<Self>, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let job = match self.pool.try_hand_off(fut.boxed()) {
            Ok(()) => return,
            Err(job) => job,
        };

        let pooled = self.metrics.pool_go_count.load(Ordering::SeqCst)
            < self.config.pool_size as i64;
        if pooled {
            self.metrics.pool_go_count.fetch_add(1, Ordering::SeqCst);
        }

        let rt = Arc::clone(self);
        self.spawn_tracked(async move {
            rt.run_job(job).await;
            if pooled {
                let idle = rt.config.pool_idle_timeout;
                while let Some(job) = rt.pool.next_job(idle, &rt.token).await {
                    rt.run_job(job).await;
                }
                rt.metrics.pool_go_count.fetch_sub(1, Ordering::SeqCst);
            }
        });
    }

    async fn run_job(&self, job: Job) {
        if let Err(panic) = AssertUnwindSafe(job).catch_unwind().await {
            self.record_panic(panic);
        }
    }

    fn record_panic(&self, panic: Box<dyn Any + Send>) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        error!(panic = %message, "Task panicked");
        self.metrics.panic_caught(self.timestamp());
    }

    fn spawn_timer_driver(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let token = self.token.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(1));
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                }
                match weak.upgrade() {
                    Some(rt) => rt.drive_timers(),
                    None => break,
                }
            }
            debug!("Timer driver stopped");
        });
    }

    fn drive_timers(self: &Arc<Self>) {
        let elapsed = self.start.elapsed().as_millis() as u64;
        self.clock_ms.store(elapsed, Ordering::Relaxed);

        let fired = {
            let mut wheel = lock(&self.wheel);
            let mut fired = Vec::new();
            while wheel.now() < elapsed {
                fired.extend(wheel.tick());
            }
            fired
        };

        for timer in fired {
            let rt = Arc::clone(self);
            self.go(async move {
                let delay = timer.run();
                lock(&rt.wheel).finish(timer.id, delay, timer.callback());
            });
        }
    }

    /// Run `callback` after `delay_ms`. A positive return re-arms it.
    pub fn set_timeout<F>(&self, delay_ms: u32, callback: F) -> Option<u32>
    where
        F: Fn() -> u32 + Send + Sync + 'static,
    {
        lock(&self.wheel).set_timeout(delay_ms, callback)
    }

    pub fn cancel_timeout(&self, id: u32) -> bool {
        lock(&self.wheel).cancel(id)
    }

    /// Name a piece of work that must finish before shutdown completes.
    ///
    /// Pending names are logged if [`stop`](Self::stop) times out.
    pub fn add_stop_check(&self, name: impl Into<String>) -> u64 {
        let id = self.stop_check_index.fetch_add(1, Ordering::SeqCst) + 1;
        lock(&self.stop_checks).insert(id, name.into());
        id
    }

    pub fn remove_stop_check(&self, id: u64) {
        lock(&self.stop_checks).remove(&id);
    }

    /// Run `hook` once the runtime has stopped, from [`wait_for_system_exit`](Self::wait_for_system_exit)
    pub fn at_exit<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        lock(&self.at_exit).push(Box::new(hook));
    }

    /// Ask [`wait_for_system_exit`](Self::wait_for_system_exit) to shut down.
    ///
    /// Safe to call from a tracked task, unlike awaiting [`stop`](Self::stop) there.
    pub fn request_stop(&self) {
        self.exit.cancel();
    }

    /// Cancel every task and connection, then wait up to `stop_timeout` for
    /// tracked tasks to finish
    pub async fn stop(&self) {
        if self
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let _timer = Timer::start("runtime_stop");
        info!("Server Stopping");
        self.token.cancel();

        let deadline = Instant::now() + self.config.stop_timeout;
        loop {
            let remaining = self.metrics.go_count.load(Ordering::SeqCst);
            if remaining <= 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!(go_count = remaining, "Server Stop Timeout");
                for (id, name) in lock(&self.stop_checks).iter() {
                    warn!(id, check = %name, "Stop check still pending");
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        self.metrics.log_metrics();
        info!("Server Stopped");
        self.exit.cancel();
    }

    /// Wait for Ctrl-C or [`request_stop`](Self::request_stop), stop, then run exit hooks
    pub async fn wait_for_system_exit(&self) {
        tokio::select! {
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => info!("Interrupt received"),
                Err(e) => error!(error = %e, "Failed to listen for interrupt"),
            },
            _ = self.exit.cancelled() => {}
        }
        self.stop().await;

        let hooks = std::mem::take(&mut *lock(&self.at_exit));
        for hook in hooks {
            hook();
        }
    }

    pub(crate) fn add_msgque(&self, mq: &Arc<MsgQue>) {
        let fresh = lock(&self.msgques)
            .insert(mq.id(), Arc::clone(mq))
            .is_none();
        if fresh {
            self.metrics.connection_established();
        }
    }

    pub(crate) fn remove_msgque(&self, id: u32) {
        if lock(&self.msgques).remove(&id).is_some() {
            self.metrics.connection_closed();
        }
    }

    pub fn msgque(&self, id: u32) -> Option<Arc<MsgQue>> {
        lock(&self.msgques).get(&id).cloned()
    }

    pub fn msgque_count(&self) -> usize {
        lock(&self.msgques).len()
    }

    /// Send `msg` to every live connection accepted by `filter`.
    ///
    /// Returns how many connections queued it.
    pub fn broadcast<F>(&self, msg: &Message, filter: F) -> usize
    where
        F: Fn(&MsgQue) -> bool,
    {
        let targets: Vec<Arc<MsgQue>> = lock(&self.msgques).values().cloned().collect();
        targets
            .iter()
            .filter(|mq| filter(mq))
            .filter(|mq| mq.send(msg.clone()))
            .count()
    }

    /// Send `msg` to every connection in `group`
    pub fn send_group(&self, group: &str, msg: &Message) -> usize {
        self.broadcast(msg, |mq| mq.is_in_group(group))
    }

    pub fn statis(&self) -> MetricsSnapshot {
        let mut snapshot = self.metrics.snapshot();
        snapshot.msgque_count = self.msgque_count();
        snapshot
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("running", &self.is_running())
            .field("msgques", &self.msgque_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn fast_config() -> RuntimeConfig {
        RuntimeConfig::default_with_overrides(|c| {
            c.stop_timeout = Duration::from_millis(200);
        })
    }

    #[tokio::test(flavor = "multi_thread")]
    #[allow(clippy::unwrap_used)]
    async fn test_go_runs_and_stop_drains() {
        let rt = Runtime::new(fast_config()).unwrap();
        let hits = Arc::new(AtomicU32::new(0));
        for _ in 0..32 {
            let h = hits.clone();
            rt.go(async move {
                h.fetch_add(1, Ordering::SeqCst);
            });
        }
        while hits.load(Ordering::SeqCst) < 32 {
            tokio::task::yield_now().await;
        }

        rt.stop().await;
        assert!(!rt.is_running());
        assert_eq!(rt.metrics().go_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    #[allow(clippy::unwrap_used)]
    async fn test_panics_are_counted() {
        let rt = Runtime::new(fast_config()).unwrap();
        let handle = rt.spawn_tracked(async { panic!("boom") });
        handle.await.unwrap();
        assert_eq!(rt.statis().panic_count, 1);
        assert_eq!(rt.metrics().go_count.load(Ordering::SeqCst), 0);
        rt.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    #[allow(clippy::unwrap_used)]
    async fn test_stop_times_out_on_stuck_task() {
        let rt = Runtime::new(fast_config()).unwrap();
        rt.add_stop_check("stuck worker");
        rt.spawn_tracked(async {
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let started = Instant::now();
        rt.stop().await;
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test(flavor = "multi_thread")]
    #[allow(clippy::unwrap_used)]
    async fn test_timer_fires_and_cancel() {
        let rt = Runtime::new(fast_config()).unwrap();
        let fired = Arc::new(AtomicU32::new(0));
        let f = fired.clone();
        rt.set_timeout(20, move || {
            f.fetch_add(1, Ordering::SeqCst);
            0
        });
        let cancelled = rt.set_timeout(20, || 0).unwrap();
        assert!(rt.cancel_timeout(cancelled));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(rt.now_ms() >= 20);
        rt.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    #[allow(clippy::unwrap_used)]
    async fn test_exit_hooks_run_after_request_stop() {
        let rt = Runtime::new(fast_config()).unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let r = ran.clone();
        rt.at_exit(move || r.store(true, Ordering::SeqCst));

        rt.request_stop();
        rt.wait_for_system_exit().await;
        assert!(ran.load(Ordering::SeqCst));
        assert!(!rt.is_running());
    }
}
