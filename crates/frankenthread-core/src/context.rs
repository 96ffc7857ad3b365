//! Process-wide runtime context.
//!
//! First use creates it from the environment; [`teardown`] frees it and the
//! next use creates a fresh one. Threads and pools capture the context that
//! was live when they were created, so their counters and log lines stay
//! with it even across a teardown.
//!
//! The slot is guarded by the runtime's own non-reentrant [`Mutex`], so
//! nothing here logs or touches the slot again while holding it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::config::RuntimeConfig;
use crate::log::{LogEntry, LogLevel, LogSink};
use crate::sync::Mutex;

static CONTEXT: Mutex<Option<Arc<RuntimeContext>>> = Mutex::new(None);

/// Monotonic runtime counters.
#[derive(Debug, Default)]
pub struct Counters {
    pub(crate) threads_created: AtomicU64,
    pub(crate) threads_reclaimed: AtomicU64,
    pub(crate) work_executed: AtomicU64,
    pub(crate) work_discarded: AtomicU64,
    pub(crate) work_panicked: AtomicU64,
}

/// Point-in-time copy of [`Counters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub threads_created: u64,
    pub threads_reclaimed: u64,
    pub work_executed: u64,
    pub work_discarded: u64,
    pub work_panicked: u64,
}

impl CounterSnapshot {
    /// Threads created but not yet reclaimed.
    #[must_use]
    pub fn threads_live(&self) -> u64 {
        self.threads_created.saturating_sub(self.threads_reclaimed)
    }
}

impl Counters {
    pub(crate) fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            threads_created: self.threads_created.load(Ordering::Relaxed),
            threads_reclaimed: self.threads_reclaimed.load(Ordering::Relaxed),
            work_executed: self.work_executed.load(Ordering::Relaxed),
            work_discarded: self.work_discarded.load(Ordering::Relaxed),
            work_panicked: self.work_panicked.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
pub struct RuntimeContext {
    config: RuntimeConfig,
    sink: LogSink,
    counters: Counters,
}

impl RuntimeContext {
    #[must_use]
    pub fn new(config: RuntimeConfig, sink: LogSink) -> Self {
        Self {
            config,
            sink,
            counters: Counters::default(),
        }
    }

    /// Context configured from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        let config = RuntimeConfig::from_env();
        let sink = LogSink::from_config(&config);
        Self::new(config, sink)
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    #[must_use]
    pub fn sink(&self) -> &LogSink {
        &self.sink
    }

    #[must_use]
    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Flush the log sink. A failure is logged as `context.flush_failed`
    /// (best effort: it lands wherever the sink still accepts writes) and
    /// returned.
    pub fn flush(&self) -> std::io::Result<()> {
        self.sink.flush().inspect_err(|err| {
            self.log(LogLevel::Error, "context.flush_failed", |e| {
                e.with_errno(err.raw_os_error().unwrap_or(crate::errno::EIO))
            });
        })
    }

    /// Emit an event; `build` only runs when `level` is enabled.
    pub fn log<F>(&self, level: LogLevel, event: &str, build: F)
    where
        F: FnOnce(LogEntry) -> LogEntry,
    {
        if self.sink.enabled(level) {
            self.sink.emit(build(LogEntry::new(level, event)));
        }
    }
}

/// The live context, creating it from the environment on first use.
pub fn global() -> Arc<RuntimeContext> {
    let (ctx, created) = {
        let mut slot = CONTEXT.lock();
        match &*slot {
            Some(ctx) => (Arc::clone(ctx), false),
            None => {
                let ctx = Arc::new(RuntimeContext::from_env());
                *slot = Some(Arc::clone(&ctx));
                (ctx, true)
            }
        }
    };
    if created {
        log_created(&ctx);
    }
    ctx
}

/// Make `ctx` the live context. Fails, handing `ctx` back, when one is
/// already live.
pub fn install(ctx: RuntimeContext) -> Result<Arc<RuntimeContext>, RuntimeContext> {
    let ctx = {
        let mut slot = CONTEXT.lock();
        if slot.is_some() {
            return Err(ctx);
        }
        let ctx = Arc::new(ctx);
        *slot = Some(Arc::clone(&ctx));
        ctx
    };
    log_created(&ctx);
    Ok(ctx)
}

/// The live context without creating one.
#[must_use]
pub fn try_global() -> Option<Arc<RuntimeContext>> {
    CONTEXT.lock().clone()
}

/// Free the live context. Returns `false` when none existed.
pub fn teardown() -> bool {
    let taken = CONTEXT.lock().take();
    let Some(ctx) = taken else {
        return false;
    };
    let counters = ctx.counters.snapshot();
    ctx.log(LogLevel::Info, "context.teardown", |e| {
        e.with_details(serde_json::to_value(counters).unwrap_or_default())
    });
    // A failed flush is already reported through the sink.
    ctx.flush().ok();
    true
}

fn log_created(ctx: &RuntimeContext) {
    ctx.log(LogLevel::Info, "context.create", |e| {
        e.with_details(serde_json::json!({
            "stack_size": ctx.config.stack_size,
            "thread_prefix": ctx.config.thread_prefix,
        }))
    });
}
