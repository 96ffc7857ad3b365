//! Thread creation and lifecycle.
//!
//! Implements create, join, detach, cooperative cancellation, forced
//! termination and exit-time cleanup on top of `std::thread::Builder`.
//!
//! ## Architecture
//!
//! Each thread gets a shared `ThreadInner` record that tracks its ids,
//! lifecycle state, cancel/kill requests and exit status. The record is
//! reference counted: the owning [`Thread`] handle, any [`ThreadRef`] clones
//! and the running thread itself all hold it, so it is reclaimed exactly
//! once, when the last of {entry returned, handle joined or detached} lets
//! go of it.
//!
//! The child runs a wrapper that:
//! 1. publishes its identity and wakes the creator (startup handshake),
//! 2. runs the entry function, catching unwinds,
//! 3. runs the cleanup callback exactly once with the exit status,
//! 4. runs the thread's TLS destructors,
//! 5. records the status and marks the thread FINISHED.
//!
//! ## Cancellation
//!
//! - [`ThreadRef::cancel`] only sets a flag. The target observes it at
//!   [`testcancel`], which returns `Err(Cancelled)` for `?` to carry back to
//!   the wrapper.
//! - [`ThreadRef::kill`] needs no cooperation from the target's code. It
//!   takes effect at the target's next runtime blocking point (condition
//!   sleep, [`sleep`], [`testcancel`]): the target is woken if parked and
//!   unwound to the wrapper, which reports [`ExitStatus::Killed`]. Cleanup
//!   still runs, best-effort. A thread that never blocks is never killed.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::context::{self, Counters, RuntimeContext};
use crate::error::ThreadError;
use crate::log::LogLevel;
use crate::sys::{self, Deadline, WaitStatus};
use crate::tls;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Thread state: created, wrapper has not published its identity yet.
const THREAD_STARTING: u32 = 0;

/// Thread state: entry function (or cleanup) is running.
const THREAD_RUNNING: u32 = 1;

/// Thread state: wrapper finished; exit status recorded.
const THREAD_FINISHED: u32 = 2;

/// Disposal: handle still owned by the creator.
const DISPOSAL_JOINABLE: u32 = 0;

/// Disposal: exit status consumed by `join`.
const DISPOSAL_JOINED: u32 = 1;

/// Disposal: thread reclaims itself on exit.
const DISPOSAL_DETACHED: u32 = 2;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Runtime-assigned thread id, unique for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(u64);

impl ThreadId {
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a thread's entry function ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Entry returned `Ok(code)`.
    Completed(i32),
    /// Entry returned through a cancellation checkpoint with this fallback code.
    Cancelled(i32),
    /// Forcibly terminated by [`ThreadRef::kill`].
    Killed,
    /// Entry panicked; the panic was contained by the wrapper.
    Panicked,
}

impl ExitStatus {
    /// The return code, for normal and cancelled exits.
    #[must_use]
    pub const fn code(self) -> Option<i32> {
        match self {
            Self::Completed(code) | Self::Cancelled(code) => Some(code),
            Self::Killed | Self::Panicked => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Completed(_) => "completed",
            Self::Cancelled(_) => "cancelled",
            Self::Killed => "killed",
            Self::Panicked => "panicked",
        }
    }
}

/// Returned by [`testcancel`] when cancellation was requested; carries the
/// fallback exit code to the wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled {
    pub code: i32,
}

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread cancelled with code {}", self.code)
    }
}

impl std::error::Error for Cancelled {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Starting,
    Running,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposal {
    Joinable,
    Joined,
    Detached,
}

/// Cleanup callback; runs once after the entry function, whatever the exit path.
pub type Cleanup = Box<dyn FnOnce(ExitStatus) + Send + 'static>;

type ThreadData = Arc<dyn Any + Send + Sync>;

// ---------------------------------------------------------------------------
// Shared record
// ---------------------------------------------------------------------------

/// Address of a wait word a thread is currently parked on.
#[derive(Clone, Copy)]
struct WordPtr(*const AtomicU32);

// SAFETY: the pointer is only dereferenced under `blocked_on`'s lock, and the
// blocked thread deregisters it under that same lock before the word can go
// out of scope.
unsafe impl Send for WordPtr {}

struct ThreadInner {
    id: ThreadId,
    name: Option<String>,
    native_id: AtomicU64,
    state: AtomicU32,
    disposal: AtomicU32,
    /// Startup handshake word: 0 until the child has published its identity.
    started: AtomicU32,
    cancel_requested: AtomicBool,
    kill_requested: AtomicBool,
    blocked_on: parking_lot::Mutex<Option<WordPtr>>,
    status: parking_lot::Mutex<Option<ExitStatus>>,
    data: Option<ThreadData>,
    ctx: Arc<RuntimeContext>,
}

impl ThreadInner {
    fn state(&self) -> ThreadState {
        match self.state.load(Ordering::Acquire) {
            THREAD_STARTING => ThreadState::Starting,
            THREAD_RUNNING => ThreadState::Running,
            _ => ThreadState::Finished,
        }
    }

    fn disposal(&self) -> Disposal {
        match self.disposal.load(Ordering::Acquire) {
            DISPOSAL_JOINABLE => Disposal::Joinable,
            DISPOSAL_JOINED => Disposal::Joined,
            _ => Disposal::Detached,
        }
    }

    fn log(&self, level: LogLevel, event: &str) {
        self.ctx.log(level, event, |e| {
            e.with_thread(self.id.0, self.name.as_deref())
        });
    }
}

impl Drop for ThreadInner {
    fn drop(&mut self) {
        // A record whose thread never started was never counted as created.
        if self.started.load(Ordering::Acquire) != 0 {
            Counters::bump(&self.ctx.counters().threads_reclaimed, 1);
            self.log(LogLevel::Trace, "thread.reclaim");
        }
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<ThreadInner>>> = const { RefCell::new(None) };
}

fn current_inner() -> Option<Arc<ThreadInner>> {
    CURRENT
        .try_with(|current| current.borrow().clone())
        .ok()
        .flatten()
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Shared, cloneable reference to a runtime thread.
#[derive(Clone)]
pub struct ThreadRef {
    inner: Arc<ThreadInner>,
}

impl ThreadRef {
    #[must_use]
    pub fn id(&self) -> ThreadId {
        self.inner.id
    }

    /// OS-level thread id (the kernel tid on Linux).
    #[must_use]
    pub fn native_id(&self) -> u64 {
        self.inner.native_id.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    #[must_use]
    pub fn state(&self) -> ThreadState {
        self.inner.state()
    }

    #[must_use]
    pub fn disposal(&self) -> Disposal {
        self.inner.disposal()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state() == ThreadState::Finished
    }

    /// Exit status once the thread has finished.
    #[must_use]
    pub fn exit_status(&self) -> Option<ExitStatus> {
        *self.inner.status.lock()
    }

    /// The data attached at creation, if it has type `T`.
    #[must_use]
    pub fn data<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.inner.data.clone()?.downcast::<T>().ok()
    }

    #[must_use]
    pub fn is_cancel_requested(&self) -> bool {
        self.inner.cancel_requested.load(Ordering::Acquire)
    }

    /// Request cooperative cancellation. No effect until the target calls
    /// [`testcancel`].
    pub fn cancel(&self) {
        if !self.inner.cancel_requested.swap(true, Ordering::AcqRel) {
            self.inner.log(LogLevel::Debug, "thread.cancel");
        }
    }

    /// Forcibly terminate the thread at its next runtime blocking point,
    /// waking it if it is parked in one now. A no-op once it has finished.
    pub fn kill(&self) -> Result<(), ThreadError> {
        if self.is_finished() {
            return Ok(());
        }
        if !self.inner.kill_requested.swap(true, Ordering::AcqRel) {
            self.inner.log(LogLevel::Warn, "thread.kill");
        }
        let blocked = self.inner.blocked_on.lock();
        if let Some(WordPtr(word)) = *blocked {
            // SAFETY: the target deregisters under this lock before the word
            // goes away, so it is alive while the lock is held.
            let word = unsafe { &*word };
            word.fetch_add(1, Ordering::SeqCst);
            sys::wake_all(word)?;
        }
        Ok(())
    }
}

impl PartialEq for ThreadRef {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for ThreadRef {}

impl fmt::Debug for ThreadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadRef")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("state", &self.inner.state())
            .finish()
    }
}

/// Owning handle to a runtime thread.
///
/// Consumed by [`Thread::join`] or [`Thread::detach`]; dropping it detaches.
pub struct Thread {
    thread: ThreadRef,
    handle: Option<std::thread::JoinHandle<ExitStatus>>,
}

impl Thread {
    #[must_use]
    pub fn thread_ref(&self) -> &ThreadRef {
        &self.thread
    }

    #[must_use]
    pub fn id(&self) -> ThreadId {
        self.thread.id()
    }

    pub fn cancel(&self) {
        self.thread.cancel();
    }

    pub fn kill(&self) -> Result<(), ThreadError> {
        self.thread.kill()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Block until the thread terminates and return how it exited.
    pub fn join(mut self) -> Result<ExitStatus, ThreadError> {
        if current_inner().is_some_and(|me| me.id == self.thread.inner.id) {
            return Err(ThreadError::Deadlock);
        }
        let handle = self.handle.take().ok_or(ThreadError::Lost)?;
        let status = handle.join().map_err(|_| ThreadError::Lost)?;
        self.thread
            .inner
            .disposal
            .store(DISPOSAL_JOINED, Ordering::Release);
        self.thread.inner.log(LogLevel::Trace, "thread.join");
        Ok(status)
    }

    /// Let the thread reclaim itself when it exits.
    pub fn detach(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.handle.take().is_some() {
            self.thread
                .inner
                .disposal
                .store(DISPOSAL_DETACHED, Ordering::Release);
        }
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Thread").field(&self.thread).finish()
    }
}

// ---------------------------------------------------------------------------
// Creation
// ---------------------------------------------------------------------------

/// Thread factory with optional name, stack size, cleanup callback and data.
#[derive(Default)]
pub struct Builder {
    name: Option<String>,
    stack_size: Option<usize>,
    cleanup: Option<Cleanup>,
    data: Option<ThreadData>,
}

impl Builder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// OS thread name; defaults to `<prefix>-<id>`.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Stack size in bytes; defaults to the configured size.
    #[must_use]
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    #[must_use]
    pub fn cleanup<C>(mut self, cleanup: C) -> Self
    where
        C: FnOnce(ExitStatus) + Send + 'static,
    {
        self.cleanup = Some(Box::new(cleanup));
        self
    }

    /// Data retrievable from inside the thread through [`data`].
    #[must_use]
    pub fn data<D: Any + Send + Sync>(mut self, data: D) -> Self {
        self.data = Some(Arc::new(data));
        self
    }

    /// Start the thread. Returns once the child has published its identity,
    /// so [`current`] already works inside it.
    pub fn spawn<F>(self, entry: F) -> Result<Thread, ThreadError>
    where
        F: FnOnce() -> Result<i32, Cancelled> + Send + 'static,
    {
        let ctx = context::global();
        let id = ThreadId(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed));
        let name = self
            .name
            .unwrap_or_else(|| format!("{}-{}", ctx.config().thread_prefix, id.0))
            .replace('\0', "");
        let stack_size = self.stack_size.unwrap_or(ctx.config().stack_size);

        let inner = Arc::new(ThreadInner {
            id,
            name: Some(name.clone()),
            native_id: AtomicU64::new(0),
            state: AtomicU32::new(THREAD_STARTING),
            disposal: AtomicU32::new(DISPOSAL_JOINABLE),
            started: AtomicU32::new(0),
            cancel_requested: AtomicBool::new(false),
            kill_requested: AtomicBool::new(false),
            blocked_on: parking_lot::Mutex::new(None),
            status: parking_lot::Mutex::new(None),
            data: self.data,
            ctx: Arc::clone(&ctx),
        });

        let child = Arc::clone(&inner);
        let cleanup = self.cleanup;
        let handle = std::thread::Builder::new()
            .name(name)
            .stack_size(stack_size)
            .spawn(move || run(child, entry, cleanup))
            .map_err(|err| {
                ctx.log(LogLevel::Error, "thread.spawn_failed", |e| {
                    e.with_thread(id.0, None)
                        .with_errno(err.raw_os_error().unwrap_or(0))
                });
                ThreadError::Spawn(err)
            })?;
        Counters::bump(&ctx.counters().threads_created, 1);

        while inner.started.load(Ordering::Acquire) == 0 {
            let _ = sys::wait(&inner.started, 0, None);
        }
        inner.log(LogLevel::Debug, "thread.spawn");

        Ok(Thread {
            thread: ThreadRef { inner },
            handle: Some(handle),
        })
    }
}

/// Start a thread running `entry`, with an optional cleanup callback and
/// data retrievable from inside through [`data`].
pub fn create<F, D>(entry: F, cleanup: Option<Cleanup>, arg: D) -> Result<Thread, ThreadError>
where
    F: FnOnce() -> Result<i32, Cancelled> + Send + 'static,
    D: Any + Send + Sync,
{
    let builder = Builder {
        cleanup,
        ..Builder::new()
    };
    builder.data(arg).spawn(entry)
}

/// Start a thread with default settings.
pub fn spawn<F>(entry: F) -> Result<Thread, ThreadError>
where
    F: FnOnce() -> Result<i32, Cancelled> + Send + 'static,
{
    Builder::new().spawn(entry)
}

/// Unwind payload used by forced termination.
struct ForcedExit;

fn run<F>(inner: Arc<ThreadInner>, entry: F, cleanup: Option<Cleanup>) -> ExitStatus
where
    F: FnOnce() -> Result<i32, Cancelled>,
{
    inner
        .native_id
        .store(sys::native_thread_id(), Ordering::Release);
    let _ = CURRENT.try_with(|current| *current.borrow_mut() = Some(Arc::clone(&inner)));
    inner.state.store(THREAD_RUNNING, Ordering::Release);
    inner.started.store(1, Ordering::Release);
    if let Err(err) = sys::wake_all(&inner.started) {
        // The creator re-checks the word after every return from its wait.
        inner.ctx.log(LogLevel::Error, "thread.handshake_wake_failed", |e| {
            e.with_thread(inner.id.0, inner.name.as_deref())
                .with_errno(err.errno())
        });
    }

    let status = match panic::catch_unwind(AssertUnwindSafe(entry)) {
        Ok(Ok(code)) => ExitStatus::Completed(code),
        Ok(Err(Cancelled { code })) => ExitStatus::Cancelled(code),
        Err(payload) if payload.is::<ForcedExit>() => ExitStatus::Killed,
        Err(_) => ExitStatus::Panicked,
    };

    if let Some(cleanup) = cleanup {
        if panic::catch_unwind(AssertUnwindSafe(|| cleanup(status))).is_err() {
            inner.log(LogLevel::Warn, "thread.cleanup_aborted");
        }
    }
    if panic::catch_unwind(tls::run_thread_destructors).is_err() {
        inner.log(LogLevel::Warn, "thread.tls_destructor_aborted");
    }

    *inner.status.lock() = Some(status);
    inner.state.store(THREAD_FINISHED, Ordering::Release);
    inner.ctx.log(
        if status == ExitStatus::Panicked {
            LogLevel::Warn
        } else {
            LogLevel::Debug
        },
        "thread.exit",
        |e| {
            e.with_thread(inner.id.0, inner.name.as_deref())
                .with_status(status.as_str(), status.code())
        },
    );
    let _ = CURRENT.try_with(|current| current.borrow_mut().take());
    status
}

// ---------------------------------------------------------------------------
// Calls made from inside a thread
// ---------------------------------------------------------------------------

/// The calling thread, if it was started by this runtime.
#[must_use]
pub fn current() -> Option<ThreadRef> {
    current_inner().map(|inner| ThreadRef { inner })
}

/// The calling thread's creation data, if it has type `T`.
#[must_use]
pub fn data<T: Any + Send + Sync>() -> Option<Arc<T>> {
    current()?.data::<T>()
}

/// Cancellation checkpoint.
///
/// Returns `Err(Cancelled { code })` when cancellation of the calling thread
/// was requested; propagate it with `?` to exit through the wrapper with
/// `code`. Also the point where a pending [`ThreadRef::kill`] takes effect.
pub fn testcancel(code: i32) -> Result<(), Cancelled> {
    let Some(me) = current_inner() else {
        return Ok(());
    };
    if me.kill_requested.load(Ordering::Acquire) {
        drop(me);
        interrupt::forced_exit();
    }
    if me.cancel_requested.load(Ordering::Acquire) {
        return Err(Cancelled { code });
    }
    Ok(())
}

/// Block the calling thread for `ms` milliseconds. Spurious and interrupted
/// returns resume against the same deadline.
pub fn sleep(ms: u64) {
    let deadline = Deadline::after_ms(ms);
    let word = AtomicU32::new(0);
    let interrupt = interrupt::enter(&word);
    loop {
        if interrupt.kill_requested() {
            drop(interrupt);
            interrupt::forced_exit();
        }
        let seen = word.load(Ordering::Acquire);
        if sys::wait(&word, seen, Some(&deadline)) == WaitStatus::TimedOut {
            return;
        }
    }
}

/// Scheduling hint; never blocks.
pub fn yield_now() {
    sys::yield_now();
}

// ---------------------------------------------------------------------------
// Interruption points
// ---------------------------------------------------------------------------

/// Hooks that let runtime blocking calls observe [`ThreadRef::kill`].
pub(crate) mod interrupt {
    use super::*;
    use core::marker::PhantomData;

    /// Registration of the word the calling thread is about to park on.
    /// Dropping it deregisters the word.
    pub(crate) struct Interrupt<'a> {
        inner: Option<Arc<ThreadInner>>,
        _word: PhantomData<&'a AtomicU32>,
    }

    /// Register `word` so a concurrent kill can wake the caller. A no-op on
    /// threads not started by this runtime.
    pub(crate) fn enter(word: &AtomicU32) -> Interrupt<'_> {
        let inner = current_inner();
        if let Some(inner) = &inner {
            *inner.blocked_on.lock() = Some(WordPtr(word));
        }
        Interrupt {
            inner,
            _word: PhantomData,
        }
    }

    impl Interrupt<'_> {
        pub(crate) fn kill_requested(&self) -> bool {
            self.inner
                .as_ref()
                .is_some_and(|inner| inner.kill_requested.load(Ordering::Acquire))
        }
    }

    impl Drop for Interrupt<'_> {
        fn drop(&mut self) {
            if let Some(inner) = &self.inner {
                *inner.blocked_on.lock() = None;
            }
        }
    }

    /// Unwind the calling thread to its wrapper as killed.
    pub(crate) fn forced_exit() -> ! {
        panic::resume_unwind(Box::new(ForcedExit))
    }

    /// Whether a caught unwind payload came from [`forced_exit`]. Code that
    /// contains panics must re-raise these so the kill reaches the wrapper.
    pub(crate) fn is_forced_exit(payload: &(dyn Any + Send)) -> bool {
        payload.is::<ForcedExit>()
    }
}
