//! Linux backend: raw futex words.

use core::sync::atomic::AtomicU32;

use super::WaitStatus;
use crate::error::SyncError;

const FUTEX_WAIT_BITSET: i32 = 9;
const FUTEX_WAKE: i32 = 1;
const FUTEX_PRIVATE_FLAG: i32 = 0x80;
const FUTEX_BITSET_MATCH_ANY: u32 = 0xFFFF_FFFF;

/// Absolute `CLOCK_MONOTONIC` deadline, taken from a single clock snapshot.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    ts: libc::timespec,
}

impl Deadline {
    pub(crate) fn after_ms(ms: u64) -> Self {
        let mut now = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: `now` is a valid out-pointer; CLOCK_MONOTONIC always exists on Linux.
        unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut now) };
        let add_sec = (ms / 1000) as libc::time_t;
        let add_nsec = ((ms % 1000) * 1_000_000) as libc::c_long;
        let mut tv_sec = now.tv_sec.saturating_add(add_sec);
        let mut tv_nsec = now.tv_nsec + add_nsec;
        if tv_nsec >= 1_000_000_000 {
            tv_sec = tv_sec.saturating_add(1);
            tv_nsec -= 1_000_000_000;
        }
        Self {
            ts: libc::timespec { tv_sec, tv_nsec },
        }
    }
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Block while `*word == expected`, until woken or `deadline` passes.
pub(crate) fn wait(word: &AtomicU32, expected: u32, deadline: Option<&Deadline>) -> WaitStatus {
    let timeout = deadline.map_or(core::ptr::null(), |d| &d.ts as *const libc::timespec);
    loop {
        // SAFETY: `word` is a live, aligned u32; the timeout pointer is null or
        // points at a timespec that outlives the call.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_futex,
                word.as_ptr(),
                FUTEX_WAIT_BITSET | FUTEX_PRIVATE_FLAG,
                expected,
                timeout,
                core::ptr::null::<u32>(),
                FUTEX_BITSET_MATCH_ANY,
            )
        };
        if rc == 0 {
            return WaitStatus::Woken;
        }
        match last_errno() {
            libc::EINTR => continue,
            libc::ETIMEDOUT => return WaitStatus::TimedOut,
            // EAGAIN: the word already changed. Anything else is reported as a
            // spurious wake; every caller re-checks its predicate.
            _ => return WaitStatus::Woken,
        }
    }
}

fn wake(word: &AtomicU32, count: i32) -> Result<usize, SyncError> {
    // SAFETY: Linux futex syscall on a live, aligned userspace word.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            FUTEX_WAKE | FUTEX_PRIVATE_FLAG,
            count,
        )
    };
    if rc < 0 {
        return Err(SyncError::Native {
            op: "futex_wake",
            errno: last_errno(),
        });
    }
    Ok(rc as usize)
}

pub(crate) fn wake_one(word: &AtomicU32) -> Result<usize, SyncError> {
    wake(word, 1)
}

pub(crate) fn wake_all(word: &AtomicU32) -> Result<usize, SyncError> {
    wake(word, i32::MAX)
}

/// Kernel thread id of the caller.
pub(crate) fn native_thread_id() -> u64 {
    // SAFETY: gettid takes no arguments and cannot fail.
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

pub(crate) fn yield_now() {
    // SAFETY: sched_yield has no preconditions.
    unsafe { libc::sched_yield() };
}
