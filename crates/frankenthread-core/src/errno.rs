//! POSIX error numbers used by the runtime's error mapping.
//!
//! Values follow Linux; they are reported through `errno()` on every error
//! type regardless of the target the runtime was built for.

pub const EPERM: i32 = 1;
pub const ESRCH: i32 = 3;
pub const EINTR: i32 = 4;
pub const EIO: i32 = 5;
pub const EAGAIN: i32 = 11;
pub const ENOMEM: i32 = 12;
pub const EFAULT: i32 = 14;
pub const EBUSY: i32 = 16;
pub const EINVAL: i32 = 22;
pub const EDEADLK: i32 = 35;
pub const ENOSYS: i32 = 38;
pub const ETIMEDOUT: i32 = 110;
pub const ECANCELED: i32 = 125;

/// Symbolic name for an errno value, or `"EUNKNOWN"`.
#[must_use]
pub const fn name(errno: i32) -> &'static str {
    match errno {
        EPERM => "EPERM",
        ESRCH => "ESRCH",
        EINTR => "EINTR",
        EIO => "EIO",
        EAGAIN => "EAGAIN",
        ENOMEM => "ENOMEM",
        EFAULT => "EFAULT",
        EBUSY => "EBUSY",
        EINVAL => "EINVAL",
        EDEADLK => "EDEADLK",
        ENOSYS => "ENOSYS",
        ETIMEDOUT => "ETIMEDOUT",
        ECANCELED => "ECANCELED",
        _ => "EUNKNOWN",
    }
}
