//! Fixed-size worker pool with an unbounded FIFO queue.
//!
//! All shared state (queue, working count, live-worker count, stop flag) sits
//! behind one runtime [`Mutex`]; workers sleep on `work_or_stop`, callers of
//! [`PoolHandle::wait`] and the destroyer sleep on `idle_or_drained`. Work
//! items always run with the mutex released.
//!
//! `working` counts items from submission until completion (queued plus
//! executing), so `wait` issued right after `add_work` already sees the item.
//!
//! Shutdown discards whatever is still queued, lets in-flight items finish,
//! waits for every worker to observe the stop flag and exit, then cancels and
//! joins each worker thread as a safety net.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::context::{self, Counters, RuntimeContext};
use crate::error::{PoolError, SyncError, ThreadError};
use crate::log::LogLevel;
use crate::sync::{Condvar, Mutex};
use crate::thread::{self, Cancelled, Thread};

/// Worker count used when zero is requested.
pub const DEFAULT_WORKERS: usize = 2;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Pool lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolPhase {
    /// Workers are being started.
    Created,
    Running,
    /// Stop requested; in-flight items finishing, workers exiting.
    Draining,
    Stopped,
}

/// Outcome of [`ThreadPool::destroy`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Items still queued at shutdown, freed without running.
    pub discarded: usize,
    pub workers_joined: usize,
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub phase: PoolPhase,
    pub workers: usize,
    pub live_workers: usize,
    pub queued: usize,
    pub working: usize,
    pub executed: u64,
    pub panicked: u64,
    pub discarded: u64,
}

struct PoolState {
    queue: VecDeque<Job>,
    working: usize,
    live_workers: usize,
    stop: bool,
    phase: PoolPhase,
    executed: u64,
    panicked: u64,
    discarded: u64,
}

struct PoolShared {
    id: u64,
    workers: usize,
    state: Mutex<PoolState>,
    work_or_stop: Condvar,
    idle_or_drained: Condvar,
    ctx: Arc<RuntimeContext>,
}

/// Creation data attached to every worker thread.
#[derive(Debug)]
struct WorkerTag {
    pool: u64,
}

impl PoolShared {
    fn is_own_worker(&self) -> bool {
        thread::data::<WorkerTag>().is_some_and(|tag| tag.pool == self.id)
    }

    fn log_failure(&self, event: &str, err: &SyncError) {
        self.ctx.log(LogLevel::Error, event, |e| {
            e.with_pool(self.id).with_errno(err.errno())
        });
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

fn worker_loop(shared: &PoolShared) -> Result<i32, Cancelled> {
    // Declared before the state guard so it drops after it on every path,
    // including the unwind of a killed worker.
    let _exit = WorkerExit { shared };
    let mut state = shared.state.lock();
    loop {
        while state.queue.is_empty() && !state.stop {
            if let Err(err) = shared.work_or_stop.sleep(&mut state, -1) {
                shared.log_failure("pool.worker_sleep_failed", &err);
                return Ok(err.errno());
            }
        }
        if state.stop {
            return Ok(0);
        }
        let Some(job) = state.queue.pop_front() else {
            continue;
        };
        drop(state);

        let panicked = match panic::catch_unwind(AssertUnwindSafe(job)) {
            Ok(()) => false,
            Err(payload) if thread::interrupt::is_forced_exit(payload.as_ref()) => {
                finish_item(shared, &mut shared.state.lock());
                shared.ctx.log(LogLevel::Warn, "pool.worker_killed", |e| {
                    e.with_pool(shared.id)
                });
                panic::resume_unwind(payload);
            }
            Err(_) => true,
        };
        let counters = shared.ctx.counters();
        if panicked {
            Counters::bump(&counters.work_panicked, 1);
            shared.ctx.log(LogLevel::Warn, "pool.item_panicked", |e| {
                e.with_pool(shared.id)
            });
        }
        Counters::bump(&counters.work_executed, 1);

        state = shared.state.lock();
        state.executed += 1;
        if panicked {
            state.panicked += 1;
        }
        finish_item(shared, &mut state);
    }
}

/// Retire one submitted item and wake `wait` callers once nothing is left.
fn finish_item(shared: &PoolShared, state: &mut PoolState) {
    state.working -= 1;
    if state.working == 0 && state.queue.is_empty() {
        if let Err(err) = shared.idle_or_drained.wake_all() {
            shared.log_failure("pool.idle_wake_failed", &err);
        }
    }
}

/// Deregisters a worker however its loop ends, normal return or unwind.
struct WorkerExit<'a> {
    shared: &'a PoolShared,
}

impl Drop for WorkerExit<'_> {
    fn drop(&mut self) {
        let shared = self.shared;
        let remaining = {
            let mut state = shared.state.lock();
            state.live_workers -= 1;
            if state.stop && state.live_workers == 0 {
                state.phase = PoolPhase::Stopped;
            }
            if let Err(err) = shared.idle_or_drained.wake_all() {
                shared.log_failure("pool.drain_wake_failed", &err);
            }
            state.live_workers
        };
        shared.ctx.log(LogLevel::Debug, "pool.worker_exit", |e| {
            e.with_pool(shared.id)
                .with_details(serde_json::json!({ "remaining": remaining }))
        });
    }
}

/// Points where unit tests can force a native failure.
#[cfg_attr(not(test), allow(dead_code))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    Spawn(usize),
    SubmitWake,
    StopWake,
}

#[cfg(test)]
type FaultHook = Box<dyn FnMut(Fault, &PoolHandle) -> bool>;

#[cfg(test)]
thread_local! {
    static FAULT_HOOK: std::cell::RefCell<Option<FaultHook>> =
        const { std::cell::RefCell::new(None) };
}

#[cfg(test)]
fn fault(point: Fault, shared: &Arc<PoolShared>) -> bool {
    let handle = PoolHandle {
        shared: Arc::clone(shared),
    };
    FAULT_HOOK.with_borrow_mut(|hook| hook.as_mut().is_some_and(|hook| hook(point, &handle)))
}

#[cfg(not(test))]
#[inline(always)]
fn fault(_point: Fault, _shared: &Arc<PoolShared>) -> bool {
    false
}

fn injected(op: &'static str) -> SyncError {
    SyncError::Native {
        op,
        errno: crate::errno::EAGAIN,
    }
}

fn spawn_worker(
    shared: &Arc<PoolShared>,
    index: usize,
    name: String,
) -> Result<Thread, ThreadError> {
    if fault(Fault::Spawn(index), shared) {
        return Err(ThreadError::Spawn(std::io::Error::from_raw_os_error(
            crate::errno::EAGAIN,
        )));
    }
    let worker_shared = Arc::clone(shared);
    thread::Builder::new()
        .name(name)
        .data(WorkerTag { pool: shared.id })
        .spawn(move || worker_loop(&worker_shared))
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Cloneable submission handle; usable from work items themselves.
#[derive(Clone)]
pub struct PoolHandle {
    shared: Arc<PoolShared>,
}

impl PoolHandle {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Queue `job` at the tail and wake one worker.
    pub fn add_work<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        if state.stop {
            return Err(PoolError::Stopped);
        }
        state.queue.push_back(Box::new(job));
        state.working += 1;
        let woken = if fault(Fault::SubmitWake, &self.shared) {
            Err(injected("futex_wake"))
        } else {
            self.shared.work_or_stop.wake()
        };
        if let Err(err) = woken {
            // No worker was told about the item; take it back so a failed
            // submission never runs.
            let job = state.queue.pop_back();
            state.working -= 1;
            drop(state);
            drop(job);
            return Err(err.into());
        }
        Ok(())
    }

    /// Block until every submitted item has completed or, once the pool is
    /// stopping, until every worker has exited.
    pub fn wait(&self) -> Result<(), PoolError> {
        if self.shared.is_own_worker() {
            return Err(PoolError::CalledFromWorker);
        }
        let mut state = self.shared.state.lock();
        loop {
            let idle = !state.stop && state.working == 0 && state.queue.is_empty();
            let drained = state.stop && state.live_workers == 0;
            if idle || drained {
                return Ok(());
            }
            self.shared.idle_or_drained.sleep(&mut state, -1)?;
        }
    }

    #[must_use]
    pub fn phase(&self) -> PoolPhase {
        self.shared.state.lock().phase
    }

    /// Items submitted and not yet completed.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.state.lock().working
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            phase: state.phase,
            workers: self.shared.workers,
            live_workers: state.live_workers,
            queued: state.queue.len(),
            working: state.working,
            executed: state.executed,
            panicked: state.panicked,
            discarded: state.discarded,
        }
    }
}

impl fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolHandle").field("id", &self.shared.id).finish()
    }
}

/// Configures and starts a [`ThreadPool`].
#[derive(Debug, Default)]
pub struct PoolBuilder {
    workers: usize,
    name_prefix: Option<String>,
}

impl PoolBuilder {
    /// Worker count; zero means [`DEFAULT_WORKERS`].
    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Worker thread name prefix; defaults to the configured thread prefix.
    #[must_use]
    pub fn name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = Some(prefix.into());
        self
    }

    /// Spawn every worker. Returns once all OS threads exist, not once they
    /// reach their service loop. On failure the workers already started are
    /// stopped and joined before the error is returned.
    pub fn build(self) -> Result<ThreadPool, PoolError> {
        let workers = if self.workers == 0 {
            DEFAULT_WORKERS
        } else {
            self.workers
        };
        let ctx = context::global();
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let prefix = self
            .name_prefix
            .unwrap_or_else(|| ctx.config().thread_prefix.clone());
        let shared = Arc::new(PoolShared {
            id,
            workers,
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                working: 0,
                live_workers: 0,
                stop: false,
                phase: PoolPhase::Created,
                executed: 0,
                panicked: 0,
                discarded: 0,
            }),
            work_or_stop: Condvar::new(),
            idle_or_drained: Condvar::new(),
            ctx: Arc::clone(&ctx),
        });
        let mut pool = ThreadPool {
            handle: PoolHandle {
                shared: Arc::clone(&shared),
            },
            workers: Vec::with_capacity(workers),
            destroyed: false,
        };

        for index in 0..workers {
            shared.state.lock().live_workers += 1;
            let spawned = spawn_worker(&shared, index, format!("{prefix}-p{id}w{index}"));
            match spawned {
                Ok(worker) => pool.workers.push(worker),
                Err(source) => {
                    shared.state.lock().live_workers -= 1;
                    ctx.log(LogLevel::Error, "pool.init_failed", |e| {
                        e.with_pool(id)
                            .with_errno(source.errno())
                            .with_details(serde_json::json!({ "index": index }))
                    });
                    if let Err(err) = pool.shutdown() {
                        ctx.log(LogLevel::Error, "pool.init_teardown_failed", |e| {
                            e.with_pool(id).with_errno(err.errno())
                        });
                    }
                    return Err(PoolError::Spawn { index, source });
                }
            }
        }

        shared.state.lock().phase = PoolPhase::Running;
        ctx.log(LogLevel::Info, "pool.init", |e| {
            e.with_pool(id)
                .with_details(serde_json::json!({ "workers": workers }))
        });
        Ok(pool)
    }
}

/// Owning pool handle. Dropping it without [`ThreadPool::destroy`] shuts
/// the pool down the same way.
pub struct ThreadPool {
    handle: PoolHandle,
    workers: Vec<Thread>,
    destroyed: bool,
}

impl ThreadPool {
    /// Start a pool of `workers` threads (zero means [`DEFAULT_WORKERS`]).
    pub fn new(workers: usize) -> Result<Self, PoolError> {
        Self::builder().workers(workers).build()
    }

    #[must_use]
    pub fn builder() -> PoolBuilder {
        PoolBuilder::default()
    }

    #[must_use]
    pub fn handle(&self) -> PoolHandle {
        self.handle.clone()
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.handle.id()
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.handle.shared.workers
    }

    #[must_use]
    pub fn live_workers(&self) -> usize {
        self.handle.shared.state.lock().live_workers
    }

    pub fn add_work<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle.add_work(job)
    }

    pub fn wait(&self) -> Result<(), PoolError> {
        self.handle.wait()
    }

    #[must_use]
    pub fn phase(&self) -> PoolPhase {
        self.handle.phase()
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.handle.pending()
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.handle.stats()
    }

    /// Discard queued items, let in-flight items finish, stop and join
    /// every worker.
    pub fn destroy(mut self) -> Result<ShutdownReport, PoolError> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<ShutdownReport, PoolError> {
        let shared = Arc::clone(&self.handle.shared);
        if shared.is_own_worker() {
            return Err(PoolError::CalledFromWorker);
        }

        let discarded_jobs = {
            let mut state = shared.state.lock();
            let discarded = std::mem::take(&mut state.queue);
            state.working -= discarded.len();
            state.discarded += discarded.len() as u64;
            let phase = state.phase;
            state.stop = true;
            state.phase = PoolPhase::Draining;
            let woken = if fault(Fault::StopWake, &shared) {
                Err(injected("futex_wake"))
            } else {
                shared.work_or_stop.wake_all()
            };
            if let Err(err) = woken {
                // Workers never heard the stop; put the pool back as it was.
                state.queue = discarded;
                state.working += state.queue.len();
                state.discarded -= state.queue.len() as u64;
                state.stop = false;
                state.phase = phase;
                return Err(err.into());
            }
            while state.live_workers > 0 {
                if let Err(err) = shared.idle_or_drained.sleep(&mut state, -1) {
                    // Joining below still waits for every worker.
                    shared.log_failure("pool.drain_sleep_failed", &err);
                    break;
                }
            }
            discarded
        };
        self.destroyed = true;
        // Dropped outside the lock: a job's captures may run arbitrary code.
        let discarded = discarded_jobs.len();
        drop(discarded_jobs);
        Counters::bump(&shared.ctx.counters().work_discarded, discarded as u64);

        let mut workers_joined = 0;
        for worker in self.workers.drain(..) {
            worker.cancel();
            worker.join().map_err(PoolError::Join)?;
            workers_joined += 1;
        }
        shared.state.lock().phase = PoolPhase::Stopped;

        let report = ShutdownReport {
            discarded,
            workers_joined,
        };
        shared.ctx.log(LogLevel::Info, "pool.destroy", |e| {
            e.with_pool(shared.id)
                .with_details(serde_json::to_value(report).unwrap_or_default())
        });
        Ok(report)
    }

    /// Stop the pool without waiting: used when the last owner goes away on
    /// one of the pool's own workers, which cannot join itself. Workers exit
    /// on their own once their current item returns.
    fn stop_detached(&mut self) -> Result<usize, SyncError> {
        let shared = Arc::clone(&self.handle.shared);
        let discarded_jobs = {
            let mut state = shared.state.lock();
            let discarded = std::mem::take(&mut state.queue);
            state.working -= discarded.len();
            state.discarded += discarded.len() as u64;
            state.stop = true;
            state.phase = PoolPhase::Draining;
            shared.work_or_stop.wake_all()?;
            discarded
        };
        self.destroyed = true;
        let discarded = discarded_jobs.len();
        drop(discarded_jobs);
        Counters::bump(&shared.ctx.counters().work_discarded, discarded as u64);
        for worker in self.workers.drain(..) {
            worker.detach();
        }
        Ok(discarded)
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        if self.destroyed {
            return;
        }
        let shared = Arc::clone(&self.handle.shared);
        let result = match self.shutdown() {
            Err(PoolError::CalledFromWorker) => self.stop_detached().map(|discarded| {
                shared.ctx.log(LogLevel::Info, "pool.drop_detached", |e| {
                    e.with_pool(shared.id)
                        .with_details(serde_json::json!({ "discarded": discarded }))
                });
            }),
            Err(err) => {
                shared.ctx.log(LogLevel::Error, "pool.drop_failed", |e| {
                    e.with_pool(shared.id).with_errno(err.errno())
                });
                Ok(())
            }
            Ok(_) => Ok(()),
        };
        if let Err(err) = result {
            shared.log_failure("pool.drop_failed", &err);
        }
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("id", &self.id())
            .field("workers", &self.worker_count())
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    /// Installs a fault hook for the calling thread; removed on drop.
    struct FaultGuard;

    impl FaultGuard {
        fn install(hook: impl FnMut(Fault, &PoolHandle) -> bool + 'static) -> Self {
            FAULT_HOOK.with_borrow_mut(|slot| *slot = Some(Box::new(hook)));
            Self
        }
    }

    impl Drop for FaultGuard {
        fn drop(&mut self) {
            FAULT_HOOK.with_borrow_mut(|slot| *slot = None);
        }
    }

    fn wait_until(limit: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < limit {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        done()
    }

    fn destroy_with_timeout(pool: ThreadPool) -> ShutdownReport {
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(pool.destroy());
        });
        rx.recv_timeout(Duration::from_secs(5))
            .expect("destroy finished")
            .expect("destroy succeeded")
    }

    #[test]
    fn zero_workers_means_default() {
        let pool = ThreadPool::new(0).unwrap();
        assert_eq!(pool.worker_count(), DEFAULT_WORKERS);
        assert_eq!(pool.live_workers(), DEFAULT_WORKERS);
        assert_eq!(pool.phase(), PoolPhase::Running);
        let report = pool.destroy().unwrap();
        assert_eq!(report.workers_joined, DEFAULT_WORKERS);
        assert_eq!(report.discarded, 0);
    }

    #[test]
    fn single_worker_runs_items_in_fifo_order() {
        let pool = ThreadPool::new(1).unwrap();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for i in 0..50 {
            let order = Arc::clone(&order);
            pool.add_work(move || order.lock().push(i)).unwrap();
        }
        pool.wait().unwrap();
        assert_eq!(*order.lock(), (0..50).collect::<Vec<_>>());
        pool.destroy().unwrap();
    }

    #[test]
    fn wait_observes_every_side_effect() {
        let pool = ThreadPool::new(4).unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..200 {
            let done = Arc::clone(&done);
            pool.add_work(move || {
                done.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
        }
        pool.wait().unwrap();
        assert_eq!(done.load(Ordering::Relaxed), 200);
        assert_eq!(pool.pending(), 0);
        assert_eq!(pool.stats().executed, 200);
    }

    #[test]
    fn destroy_discards_undequeued_items() {
        let pool = ThreadPool::new(1).unwrap();
        let release = Arc::new(AtomicBool::new(false));
        let started = Arc::new(AtomicBool::new(false));
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let release = Arc::clone(&release);
            let started = Arc::clone(&started);
            pool.add_work(move || {
                started.store(true, Ordering::Release);
                while !release.load(Ordering::Acquire) {
                    std::thread::sleep(Duration::from_millis(1));
                }
            })
            .unwrap();
        }
        while !started.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_millis(1));
        }
        for _ in 0..5 {
            let ran = Arc::clone(&ran);
            pool.add_work(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        let releaser = {
            let release = Arc::clone(&release);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(30));
                release.store(true, Ordering::Release);
            })
        };
        let report = pool.destroy().unwrap();
        releaser.join().unwrap();
        assert_eq!(report.discarded, 5);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn panicking_item_leaves_worker_alive() {
        let pool = ThreadPool::new(1).unwrap();
        pool.add_work(|| panic!("item failed")).unwrap();
        let after = Arc::new(AtomicBool::new(false));
        {
            let after = Arc::clone(&after);
            pool.add_work(move || after.store(true, Ordering::SeqCst))
                .unwrap();
        }
        pool.wait().unwrap();
        assert!(after.load(Ordering::SeqCst));
        let stats = pool.stats();
        assert_eq!(stats.panicked, 1);
        assert_eq!(stats.live_workers, 1);
    }

    #[test]
    fn wait_from_a_worker_is_rejected() {
        let pool = ThreadPool::new(2).unwrap();
        let handle = pool.handle();
        let (tx, rx) = std::sync::mpsc::channel();
        pool.add_work(move || {
            let _ = tx.send(handle.wait());
        })
        .unwrap();
        let result = rx.recv().unwrap();
        assert!(matches!(result, Err(PoolError::CalledFromWorker)));
        pool.wait().unwrap();
    }

    #[test]
    fn add_work_after_stop_is_rejected() {
        let pool = ThreadPool::new(1).unwrap();
        let handle = pool.handle();
        pool.destroy().unwrap();
        assert_eq!(handle.phase(), PoolPhase::Stopped);
        assert!(matches!(handle.add_work(|| {}), Err(PoolError::Stopped)));
    }

    #[test]
    fn dropping_the_pool_shuts_it_down() {
        let handle = {
            let pool = ThreadPool::new(3).unwrap();
            pool.handle()
        };
        let stats = handle.stats();
        assert_eq!(stats.phase, PoolPhase::Stopped);
        assert_eq!(stats.live_workers, 0);
    }

    #[test]
    fn spawn_failure_tears_down_started_workers() {
        let seen = Rc::new(RefCell::new(None));
        let _guard = {
            let seen = Rc::clone(&seen);
            FaultGuard::install(move |point, handle| {
                if point == Fault::Spawn(2) {
                    *seen.borrow_mut() = Some(handle.clone());
                    return true;
                }
                false
            })
        };
        let err = ThreadPool::new(4).unwrap_err();
        assert!(matches!(err, PoolError::Spawn { index: 2, .. }));
        assert_eq!(err.errno(), crate::errno::EAGAIN);

        let handle = seen.borrow_mut().take().expect("failing spawn was reached");
        let stats = handle.stats();
        assert_eq!(stats.live_workers, 0);
        assert_eq!(stats.phase, PoolPhase::Stopped);
        assert!(matches!(handle.add_work(|| {}), Err(PoolError::Stopped)));
    }

    #[test]
    fn failed_submit_wake_takes_the_item_back() {
        let pool = ThreadPool::new(1).unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        {
            let _guard = FaultGuard::install(|point, _| point == Fault::SubmitWake);
            let ran = Arc::clone(&ran);
            let err = pool
                .add_work(move || ran.store(true, Ordering::SeqCst))
                .unwrap_err();
            assert!(matches!(err, PoolError::Sync(SyncError::Native { .. })));
        }
        assert_eq!(pool.pending(), 0);
        pool.add_work(|| {}).unwrap();
        pool.wait().unwrap();
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(pool.stats().executed, 1);
    }

    #[test]
    fn failed_stop_wake_leaves_pool_running() {
        let mut pool = ThreadPool::new(1).unwrap();
        let release = Arc::new(AtomicBool::new(false));
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let release = Arc::clone(&release);
            pool.add_work(move || {
                while !release.load(Ordering::Acquire) {
                    std::thread::sleep(Duration::from_millis(1));
                }
            })
            .unwrap();
        }
        for _ in 0..3 {
            let ran = Arc::clone(&ran);
            pool.add_work(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        {
            let _guard = FaultGuard::install(|point, _| point == Fault::StopWake);
            assert!(matches!(pool.shutdown(), Err(PoolError::Sync(_))));
        }
        let stats = pool.stats();
        assert_eq!(stats.phase, PoolPhase::Running);
        assert_eq!(stats.working, 4);
        assert_eq!(stats.discarded, 0);

        release.store(true, Ordering::Release);
        pool.wait().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 3);
        assert_eq!(pool.destroy().unwrap().workers_joined, 1);
    }

    #[test]
    fn killed_idle_worker_does_not_stall_destroy() {
        let pool = ThreadPool::new(1).unwrap();
        let (tx, rx) = mpsc::channel();
        pool.add_work(move || {
            let _ = tx.send(thread::current());
        })
        .unwrap();
        let worker = rx.recv().unwrap().expect("worker is a runtime thread");
        pool.wait().unwrap();

        worker.kill().unwrap();
        assert!(wait_until(Duration::from_secs(5), || worker.is_finished()));
        assert_eq!(worker.exit_status(), Some(thread::ExitStatus::Killed));
        assert_eq!(pool.live_workers(), 0);

        let report = destroy_with_timeout(pool);
        assert_eq!(report.workers_joined, 1);
    }

    #[test]
    fn kill_during_an_item_is_not_counted_as_a_panic() {
        let pool = ThreadPool::new(1).unwrap();
        let handle = pool.handle();
        let (tx, rx) = mpsc::channel();
        pool.add_work(move || {
            let _ = tx.send(thread::current());
            loop {
                thread::sleep(5);
            }
        })
        .unwrap();
        let worker = rx.recv().unwrap().expect("worker is a runtime thread");

        worker.kill().unwrap();
        pool.wait().unwrap();
        assert!(wait_until(Duration::from_secs(5), || worker.is_finished()));
        assert_eq!(worker.exit_status(), Some(thread::ExitStatus::Killed));
        let stats = handle.stats();
        assert_eq!(stats.panicked, 0);
        assert_eq!(stats.executed, 0);
        assert_eq!(stats.working, 0);
        assert_eq!(stats.live_workers, 0);

        destroy_with_timeout(pool);
    }

    #[test]
    fn last_owner_dropped_inside_an_item_stops_the_workers() {
        let pool = ThreadPool::new(2).unwrap();
        let handle = pool.handle();
        let slot = Arc::new(parking_lot::Mutex::new(Some(pool)));
        {
            let slot = Arc::clone(&slot);
            handle
                .add_work(move || drop(slot.lock().take()))
                .unwrap();
        }
        assert!(wait_until(Duration::from_secs(5), || {
            handle.stats().live_workers == 0
        }));
        assert!(slot.lock().is_none());
        assert_eq!(handle.phase(), PoolPhase::Stopped);
        assert!(matches!(handle.add_work(|| {}), Err(PoolError::Stopped)));
    }
}
