#![allow(dead_code)]

use std::{io, os::fd::RawFd, time::Duration};

pub(crate) trait OrErrno<T>: Sized {
    fn true_or_errno(self, f: impl FnOnce() -> T) -> io::Result<T>;
    #[inline(always)]
    fn true_val_or_errno(self, value: T) -> io::Result<T> { self.true_or_errno(|| value) }
}
impl<B: ToBool, T> OrErrno<T> for B {
    #[inline]
    fn true_or_errno(self, f: impl FnOnce() -> T) -> io::Result<T> {
        if self.to_bool() {
            Ok(f())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

pub(crate) trait FdOrErrno: Sized {
    fn fd_or_errno(self) -> io::Result<Self>;
}
impl FdOrErrno for RawFd {
    #[inline]
    fn fd_or_errno(self) -> io::Result<Self> { (self != -1).true_val_or_errno(self) }
}

pub(crate) trait ToBool {
    fn to_bool(self) -> bool;
}
impl ToBool for bool {
    #[inline(always)]
    fn to_bool(self) -> bool { self }
}
impl ToBool for i32 {
    #[inline(always)]
    fn to_bool(self) -> bool { self != 0 }
}

/// Bounds of the delay between attempts to connect to a listener with a full backlog. Such an
/// attempt fails with `EAGAIN` while the socket stays writable, so readiness can't be waited for.
pub(crate) const CONNECT_BACKOFF_MIN: Duration = Duration::from_millis(1);
pub(crate) const CONNECT_BACKOFF_MAX: Duration = Duration::from_millis(64);

/// Doubles a connection retry delay, up to the limit.
#[inline]
pub(crate) fn next_connect_backoff(backoff: Duration) -> Duration {
    backoff.saturating_mul(2).min(CONNECT_BACKOFF_MAX)
}

/// Classification of an `errno` value coming out of a nonblocking socket call.
pub(crate) trait WouldBlockExt {
    /// `EAGAIN`/`EWOULDBLOCK`.
    fn is_would_block(&self) -> bool;
    /// `EINPROGRESS`, `EALREADY` or would-block, all of which mean that a nonblocking `connect`
    /// has not finished yet.
    fn is_connect_in_progress(&self) -> bool;
    /// `EINTR`.
    fn is_interrupted(&self) -> bool;
}
impl WouldBlockExt for io::Error {
    #[inline]
    fn is_would_block(&self) -> bool { self.kind() == io::ErrorKind::WouldBlock }
    #[inline]
    fn is_connect_in_progress(&self) -> bool {
        self.is_would_block()
            || matches!(self.raw_os_error(), Some(libc::EINPROGRESS | libc::EALREADY))
    }
    #[inline]
    fn is_interrupted(&self) -> bool { self.kind() == io::ErrorKind::Interrupted }
}

#[cold]
#[inline(never)]
pub(crate) fn busy_error() -> io::Error { io::Error::from_raw_os_error(libc::EBUSY) }
