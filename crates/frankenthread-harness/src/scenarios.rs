//! Runnable checks for the runtime's observable properties.
//!
//! Every scenario owns the threads, pools and primitives it creates, so
//! scenarios can run in any order and side by side.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde_json::{Value, json};

use frankenthread_core::pool::ThreadPool;
use frankenthread_core::sync::{Condvar, Mutex, Once, WaitResult};
use frankenthread_core::thread::{self, Builder, ExitStatus};

use crate::error::{HarnessError, ensure};
use crate::report::{Outcome, RunSummary, ScenarioReport};

pub type ScenarioFn = fn() -> Result<Value, HarnessError>;

/// A named, runnable property check.
#[derive(Debug, Clone, Copy)]
pub struct Scenario {
    pub name: &'static str,
    pub description: &'static str,
    pub run: ScenarioFn,
}

pub const SCENARIOS: &[Scenario] = &[
    Scenario {
        name: "pool_worker_count",
        description: "init(N) starts exactly N workers, or 2 when N is 0",
        run: pool_worker_count,
    },
    Scenario {
        name: "pool_fifo_single_worker",
        description: "a one-worker pool runs items in submission order",
        run: pool_fifo_single_worker,
    },
    Scenario {
        name: "pool_wait_visibility",
        description: "wait returns only after every submitted item's effects are visible",
        run: pool_wait_visibility,
    },
    Scenario {
        name: "pool_destroy_discards",
        description: "destroy frees undequeued items without running them",
        run: pool_destroy_discards,
    },
    Scenario {
        name: "thread_cancel_checkpoint",
        description: "cancel is ignored without a checkpoint and exits with the fallback code at one",
        run: thread_cancel_checkpoint,
    },
    Scenario {
        name: "thread_kill_blocked",
        description: "kill terminates a thread parked in a condition sleep",
        run: thread_kill_blocked,
    },
    Scenario {
        name: "cond_timed_wait",
        description: "a 50ms timed sleep on an unsignaled condition times out within slack",
        run: cond_timed_wait,
    },
    Scenario {
        name: "once_racers",
        description: "100 threads racing one once-gate apply its side effect exactly once",
        run: once_racers,
    },
    Scenario {
        name: "thread_reclaim",
        description: "detach-then-exit and exit-then-detach each reclaim a thread exactly once",
        run: thread_reclaim,
    },
];

/// Look a scenario up by name.
pub fn find(name: &str) -> Result<&'static Scenario, HarnessError> {
    SCENARIOS
        .iter()
        .find(|s| s.name == name)
        .ok_or_else(|| HarnessError::UnknownScenario(name.to_string()))
}

/// Run one scenario, converting any failure into a `Fail` report.
#[must_use]
pub fn run_scenario(scenario: &Scenario) -> ScenarioReport {
    let start = Instant::now();
    let result = (scenario.run)();
    let duration_ms = start.elapsed().as_millis() as u64;
    let (outcome, details) = match result {
        Ok(details) => (Outcome::Pass, details),
        Err(err) => (Outcome::Fail, json!({ "error": err.to_string() })),
    };
    ScenarioReport {
        name: scenario.name.to_string(),
        outcome,
        duration_ms,
        details,
    }
}

/// Run every scenario in declaration order.
#[must_use]
pub fn run_all() -> RunSummary {
    RunSummary::from_reports(SCENARIOS.iter().map(run_scenario).collect())
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

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

fn pool_worker_count() -> Result<Value, HarnessError> {
    let mut observed = Vec::new();
    for requested in [0usize, 1, 2, 5] {
        let pool = ThreadPool::new(requested)?;
        let expected = if requested == 0 { 2 } else { requested };
        ensure(pool.worker_count() == expected, || {
            format!("requested {requested}, got {} workers", pool.worker_count())
        })?;
        ensure(pool.live_workers() == expected, || {
            format!("requested {requested}, {} live workers", pool.live_workers())
        })?;
        let report = pool.destroy()?;
        ensure(report.workers_joined == expected, || {
            format!("joined {} of {expected} workers", report.workers_joined)
        })?;
        observed.push(json!({ "requested": requested, "workers": expected }));
    }
    Ok(json!({ "pools": observed }))
}

fn pool_fifo_single_worker() -> Result<Value, HarnessError> {
    const ITEMS: usize = 200;
    let pool = ThreadPool::new(1)?;
    let order = Arc::new(parking_lot::Mutex::new(Vec::with_capacity(ITEMS)));
    for i in 0..ITEMS {
        let order = Arc::clone(&order);
        pool.add_work(move || order.lock().push(i))?;
    }
    pool.wait()?;
    pool.destroy()?;
    let order = order.lock();
    let first_out_of_order = order.iter().enumerate().find(|(pos, v)| pos != *v);
    ensure(order.len() == ITEMS && first_out_of_order.is_none(), || {
        format!(
            "ran {} items, first out of order at {:?}",
            order.len(),
            first_out_of_order
        )
    })?;
    Ok(json!({ "items": ITEMS }))
}

fn pool_wait_visibility() -> Result<Value, HarnessError> {
    const ITEMS: usize = 1_000;
    let pool = ThreadPool::new(4)?;
    let slots: Arc<Vec<AtomicUsize>> = Arc::new((0..ITEMS).map(|_| AtomicUsize::new(0)).collect());
    for i in 0..ITEMS {
        let slots = Arc::clone(&slots);
        pool.add_work(move || slots[i].store(i + 1, Ordering::Relaxed))?;
    }
    pool.wait()?;
    let missing = slots
        .iter()
        .enumerate()
        .filter(|(i, slot)| slot.load(Ordering::Relaxed) != i + 1)
        .count();
    let pending = pool.pending();
    pool.destroy()?;
    ensure(missing == 0 && pending == 0, || {
        format!("{missing} effects missing, {pending} items pending after wait")
    })?;
    Ok(json!({ "items": ITEMS, "workers": 4 }))
}

fn pool_destroy_discards() -> Result<Value, HarnessError> {
    const QUEUED: usize = 16;
    let pool = ThreadPool::new(1)?;
    let started = Arc::new(AtomicBool::new(false));
    let release = Arc::new(AtomicBool::new(false));
    let ran = Arc::new(AtomicUsize::new(0));
    {
        let started = Arc::clone(&started);
        let release = Arc::clone(&release);
        pool.add_work(move || {
            started.store(true, Ordering::Release);
            while !release.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_millis(1));
            }
        })?;
    }
    ensure(
        wait_until(Duration::from_secs(5), || started.load(Ordering::Acquire)),
        || "blocking item never started".to_string(),
    )?;
    for _ in 0..QUEUED {
        let ran = Arc::clone(&ran);
        pool.add_work(move || {
            ran.fetch_add(1, Ordering::SeqCst);
        })?;
    }
    let releaser = {
        let release = Arc::clone(&release);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            release.store(true, Ordering::Release);
        })
    };
    let report = pool.destroy()?;
    let _ = releaser.join();
    let executed = ran.load(Ordering::SeqCst);
    ensure(report.discarded == QUEUED && executed == 0, || {
        format!(
            "discarded {} of {QUEUED}, {executed} queued items ran",
            report.discarded
        )
    })?;
    Ok(serde_json::to_value(report)?)
}

// ---------------------------------------------------------------------------
// Threads
// ---------------------------------------------------------------------------

fn thread_cancel_checkpoint() -> Result<Value, HarnessError> {
    // No checkpoint: the request has no effect.
    let go = Arc::new(AtomicBool::new(false));
    let ignorer = {
        let go = Arc::clone(&go);
        thread::spawn(move || {
            while !go.load(Ordering::Acquire) {
                thread::yield_now();
            }
            Ok(11)
        })?
    };
    ignorer.cancel();
    go.store(true, Ordering::Release);
    let ignored = ignorer.join()?;
    ensure(ignored == ExitStatus::Completed(11), || {
        format!("thread without checkpoint exited {ignored:?}")
    })?;

    // Checkpoint: exits with the fallback code, one cleanup call.
    let cleanups = Arc::new(AtomicUsize::new(0));
    let checker = {
        let cleanups = Arc::clone(&cleanups);
        Builder::new()
            .cleanup(move |_| {
                cleanups.fetch_add(1, Ordering::SeqCst);
            })
            .spawn(|| loop {
                thread::testcancel(-7)?;
                thread::sleep(1);
            })?
    };
    checker.cancel();
    let cancelled = checker.join()?;
    let cleanup_calls = cleanups.load(Ordering::SeqCst);
    ensure(
        cancelled == ExitStatus::Cancelled(-7) && cleanup_calls == 1,
        || format!("checkpoint thread exited {cancelled:?} with {cleanup_calls} cleanups"),
    )?;
    Ok(json!({
        "without_checkpoint": ignored.as_str(),
        "with_checkpoint": cancelled.as_str(),
        "fallback_code": cancelled.code(),
        "cleanup_calls": cleanup_calls,
    }))
}

fn thread_kill_blocked() -> Result<Value, HarnessError> {
    let shared = Arc::new((Mutex::new(false), Condvar::new()));
    let target = {
        let shared = Arc::clone(&shared);
        thread::spawn(move || {
            let (lock, cv) = &*shared;
            let mut flag = lock.lock();
            while !*flag {
                let _ = cv.sleep(&mut flag, -1);
            }
            Ok(0)
        })?
    };
    ensure(
        wait_until(Duration::from_secs(5), || shared.1.waiters() > 0),
        || "target never blocked".to_string(),
    )?;
    let start = Instant::now();
    target.kill()?;
    let status = target.join()?;
    let unlocked = shared.0.try_lock().is_some();
    ensure(status == ExitStatus::Killed && unlocked, || {
        format!("kill produced {status:?}, mutex released: {unlocked}")
    })?;
    Ok(json!({ "status": status.as_str(), "kill_to_join_ms": start.elapsed().as_millis() as u64 }))
}

fn thread_reclaim() -> Result<Value, HarnessError> {
    const ROUNDS: usize = 20;

    /// Dropped exactly when the owning thread record is reclaimed.
    struct ReclaimCounter(Arc<AtomicUsize>);

    impl Drop for ReclaimCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    let reclaimed = Arc::new(AtomicUsize::new(0));
    for _ in 0..ROUNDS {
        let early = Builder::new()
            .data(ReclaimCounter(Arc::clone(&reclaimed)))
            .spawn(|| Ok(0))?;
        ensure(
            wait_until(Duration::from_secs(5), || early.is_finished()),
            || "thread never finished".to_string(),
        )?;
        early.detach();

        let gate = Arc::new(AtomicBool::new(false));
        let late = {
            let gate = Arc::clone(&gate);
            Builder::new()
                .data(ReclaimCounter(Arc::clone(&reclaimed)))
                .spawn(move || {
                    while !gate.load(Ordering::Acquire) {
                        thread::yield_now();
                    }
                    Ok(0)
                })?
        };
        late.detach();
        gate.store(true, Ordering::Release);
    }
    let expected = 2 * ROUNDS;
    let settled = wait_until(Duration::from_secs(10), || {
        reclaimed.load(Ordering::SeqCst) >= expected
    });
    // Give a double reclaim a chance to show up.
    std::thread::sleep(Duration::from_millis(20));
    let count = reclaimed.load(Ordering::SeqCst);
    ensure(settled && count == expected, || {
        format!("{count} reclaims for {expected} threads")
    })?;
    Ok(json!({ "threads": expected, "reclaims": count }))
}

// ---------------------------------------------------------------------------
// Primitives
// ---------------------------------------------------------------------------

fn cond_timed_wait() -> Result<Value, HarnessError> {
    const TIMEOUT_MS: i64 = 50;
    const SLACK_MS: u128 = 250;
    let lock = Mutex::new(());
    let cv = Condvar::new();
    let mut guard = lock.lock();
    let start = Instant::now();
    let result = cv.sleep(&mut guard, TIMEOUT_MS)?;
    let elapsed = start.elapsed().as_millis();
    drop(guard);
    ensure(result == WaitResult::TimedOut, || {
        format!("expected a timeout, got {result:?}")
    })?;
    ensure(
        elapsed >= TIMEOUT_MS as u128 && elapsed < TIMEOUT_MS as u128 + SLACK_MS,
        || format!("timed sleep took {elapsed}ms"),
    )?;
    Ok(json!({ "timeout_ms": TIMEOUT_MS, "elapsed_ms": elapsed as u64 }))
}

fn once_racers() -> Result<Value, HarnessError> {
    const RACERS: usize = 100;
    let gate = Arc::new(Once::new());
    let effects = Arc::new(AtomicUsize::new(0));
    let mut threads = Vec::with_capacity(RACERS);
    for _ in 0..RACERS {
        let gate = Arc::clone(&gate);
        let effects = Arc::clone(&effects);
        threads.push(thread::spawn(move || {
            gate.run(|| {
                thread::sleep(2);
                effects.fetch_add(1, Ordering::SeqCst);
            });
            Ok(effects.load(Ordering::SeqCst) as i32)
        })?);
    }
    let mut saw_incomplete = 0;
    for t in threads {
        if t.join()?.code() != Some(1) {
            saw_incomplete += 1;
        }
    }
    let applied = effects.load(Ordering::SeqCst);
    ensure(applied == 1 && saw_incomplete == 0, || {
        format!("side effect applied {applied} times, {saw_incomplete} callers returned early")
    })?;
    Ok(json!({ "racers": RACERS, "applied": applied }))
}
