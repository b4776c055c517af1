//! The readiness-notification interface that endpoints are driven by.
//!
//! Endpoints never block: whenever a socket call reports that it cannot make progress, the
//! endpoint registers the descriptor with a [`Reactor`] and finishes the operation from the
//! callback. Any event loop can back this interface; [`PollReactor`](poll::PollReactor) is a
//! ready-made single-threaded one.

pub mod poll;

use std::{
    fmt::{self, Debug, Formatter},
    io,
    os::fd::{BorrowedFd, RawFd},
    time::{Duration, Instant},
};

/// The direction of readiness a registration waits for.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Interest {
    /// The descriptor has data to read, or a connection to accept.
    Read,
    /// The descriptor has room in its send buffer, or finished connecting.
    Write,
}
impl Interest {
    #[inline]
    pub(crate) const fn index(self) -> usize {
        match self {
            Self::Read => 0,
            Self::Write => 1,
        }
    }
}

/// Why a registration's callback was invoked.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Readiness {
    /// The descriptor became ready in the registered direction.
    Ready,
    /// The timeout elapsed first.
    TimedOut,
}

/// Callback invoked once when a registration fires, with the registered descriptor.
pub type ReadyCallback = Box<dyn FnOnce(RawFd, Readiness)>;

/// Identifies one registration with a reactor, so that it can be withdrawn.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Registration {
    pub(crate) fd: RawFd,
    pub(crate) interest: Interest,
    pub(crate) id: u64,
}
impl Registration {
    /// Constructs a registration token. Meant for [`Reactor`] implementors.
    #[inline]
    pub const fn new(fd: RawFd, interest: Interest, id: u64) -> Self { Self { fd, interest, id } }
    /// The registered descriptor.
    #[inline]
    pub const fn fd(&self) -> RawFd { self.fd }
    /// The direction of readiness waited for.
    #[inline]
    pub const fn interest(&self) -> Interest { self.interest }
    /// The reactor-specific identifier of the registration.
    #[inline]
    pub const fn id(&self) -> u64 { self.id }
}
impl Debug for Registration {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Registration")
            .field(&self.fd)
            .field(&self.interest)
            .field(&self.id)
            .finish()
    }
}

/// Callback invoked once when a timer elapses.
pub type TimerCallback = Box<dyn FnOnce()>;

/// Identifies one timer scheduled with a reactor, so that it can be cancelled.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timer {
    pub(crate) deadline: Instant,
    pub(crate) id: u64,
}
impl Timer {
    /// Constructs a timer token. Meant for [`Reactor`] implementors.
    #[inline]
    pub const fn new(deadline: Instant, id: u64) -> Self { Self { deadline, id } }
    /// When the timer elapses.
    #[inline]
    pub const fn deadline(&self) -> Instant { self.deadline }
    /// The reactor-specific identifier of the timer.
    #[inline]
    pub const fn id(&self) -> u64 { self.id }
}

/// A readiness-notification reactor.
///
/// Registrations are oneshot: the callback fires exactly once, either with
/// [`Ready`](Readiness::Ready) or, if a timeout was given and elapsed first, with
/// [`TimedOut`](Readiness::TimedOut), unless the registration is withdrawn beforehand with
/// [`deregister`](Reactor::deregister). There may be at most one registration per descriptor and
/// direction at a time.
///
/// Timers are oneshot too, and are how waits that no descriptor can signal are expressed.
///
/// Callbacks must be invoked from the reactor's dispatch loop, never from within `register` or
/// `schedule`, and without any internal borrow held, so that they may register again.
pub trait Reactor {
    /// Waits for `fd` to become ready in the direction of `interest`, or for `timeout` to elapse,
    /// whichever comes first. A timeout of `None` waits indefinitely.
    ///
    /// Fails with `EBUSY` if there already is a registration for the same descriptor and
    /// direction.
    fn register(
        &self,
        fd: BorrowedFd<'_>,
        interest: Interest,
        timeout: Option<Duration>,
        callback: ReadyCallback,
    ) -> io::Result<Registration>;
    /// Withdraws a registration, dropping its callback without invoking it. Returns `false` if the
    /// registration has already fired or been withdrawn.
    fn deregister(&self, registration: Registration) -> bool;
    /// Invokes `callback` once `delay` has elapsed.
    fn schedule(&self, delay: Duration, callback: TimerCallback) -> io::Result<Timer>;
    /// Cancels a timer, dropping its callback without invoking it. Returns `false` if the timer
    /// has already fired or been cancelled.
    fn cancel_timer(&self, timer: Timer) -> bool;
}
