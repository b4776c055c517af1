//! Bookkeeping for operations that are waiting on a [`Reactor`](crate::Reactor).
//!
//! An operation is a retryable attempt paired with a completion callback. The attempt is made
//! right away; if it would block, the endpoint's descriptor is registered with the reactor and
//! the attempt is made again from scratch once the reactor reports readiness. This repeats until
//! the attempt either succeeds or fails for good, at which point the completion callback is
//! invoked exactly once.
//!
//! Retries only hold a weak reference to the endpoint. Closing the endpoint withdraws its
//! registrations, and a retry that fires after the endpoint is gone does nothing. A
//! [`PendingOperation`] handle can also stop an operation explicitly.

use {
    crate::{
        busy_error,
        endpoint::Shared,
        reactor::{Interest, ReadyCallback, Reactor, Registration},
    },
    std::{
        cell::{Cell, RefCell},
        fmt::{self, Debug, Formatter},
        io,
        os::fd::BorrowedFd,
        rc::{Rc, Weak},
    },
    tracing::trace,
};

pub(crate) type Attempt<T> = Box<dyn FnMut(BorrowedFd<'_>) -> io::Result<Option<T>>>;
pub(crate) type Completion<T> = Box<dyn FnOnce(io::Result<T>)>;

/// Type-erased view of an operation, as stored by its endpoint and handle.
pub(crate) trait Op {
    fn is_pending(&self) -> bool;
    /// Drops the completion callback without invoking it and withdraws the current
    /// registration, if any. Returns `false` if the operation had already finished.
    fn cancel(&self, reactor: Option<&dyn Reactor>) -> bool;
}

struct OpState<T> {
    interest: Interest,
    registration: Cell<Option<Registration>>,
    attempt: RefCell<Option<Attempt<T>>>,
    on_complete: Cell<Option<Completion<T>>>,
}
impl<T> OpState<T> {
    fn finish(&self, result: io::Result<T>) {
        // Releases whatever the attempt owns, such as the descriptor being sent, before the
        // callback runs.
        drop(self.attempt.borrow_mut().take());
        if let Some(on_complete) = self.on_complete.take() {
            on_complete(result);
        }
    }
}
impl<T> Op for OpState<T> {
    fn is_pending(&self) -> bool {
        // Cell<Option<Box<..>>> can't be peeked at without taking
        let cb = self.on_complete.take();
        let pending = cb.is_some();
        self.on_complete.set(cb);
        pending
    }
    fn cancel(&self, reactor: Option<&dyn Reactor>) -> bool {
        let Some(on_complete) = self.on_complete.take() else { return false };
        if let (Some(reactor), Some(registration)) = (reactor, self.registration.take()) {
            reactor.deregister(registration);
        }
        drop(self.attempt.borrow_mut().take());
        drop(on_complete);
        true
    }
}

/// Handle to an operation that may still be waiting on the reactor.
///
/// Dropping the handle does **not** cancel the operation.
pub struct PendingOperation {
    op: Rc<dyn Op>,
    endpoint: Weak<Shared>,
    interest: Interest,
}
impl PendingOperation {
    /// Whether the operation has neither completed nor been cancelled.
    ///
    /// An operation whose endpoint was closed is cancelled.
    #[inline]
    pub fn is_pending(&self) -> bool { self.op.is_pending() }
    /// The direction of readiness the operation waits for.
    #[inline]
    pub fn interest(&self) -> Interest { self.interest }
    /// Stops the operation: any outstanding reactor registration is withdrawn and the completion
    /// callback is dropped without being invoked. Returns `false` if the operation had already
    /// completed or been cancelled.
    pub fn cancel(&self) -> bool {
        let endpoint = self.endpoint.upgrade();
        let cancelled = self.op.cancel(endpoint.as_deref().map(|s| &*s.reactor));
        if let Some(endpoint) = endpoint {
            endpoint.release(self.interest, &self.op);
        }
        if cancelled {
            trace!(interest = ?self.interest, "pending operation cancelled");
        }
        cancelled
    }
}
impl Debug for PendingOperation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingOperation")
            .field("interest", &self.interest)
            .field("is_pending", &self.is_pending())
            .finish()
    }
}

/// Starts an operation on the endpoint. The first attempt is made before this returns, which
/// means that the completion callback may have already been invoked by then.
///
/// If another operation in the same direction is still pending, the callback immediately
/// receives `EBUSY`.
pub(crate) fn start<T: 'static>(
    shared: &Rc<Shared>,
    interest: Interest,
    attempt: Attempt<T>,
    on_complete: Completion<T>,
) -> PendingOperation {
    let op = Rc::new(OpState {
        interest,
        registration: Cell::new(None),
        attempt: RefCell::new(Some(attempt)),
        on_complete: Cell::new(Some(on_complete)),
    });
    let dyn_op: Rc<dyn Op> = op.clone();
    let handle = PendingOperation { op: Rc::clone(&dyn_op), endpoint: Rc::downgrade(shared), interest };
    if !shared.claim(interest, dyn_op) {
        op.finish(Err(busy_error()));
        return handle;
    }
    step(Rc::downgrade(shared), op);
    handle
}

/// Returns the handle of an operation that failed before it could start, having delivered `error`
/// to the callback. The endpoint's slots are left alone.
pub(crate) fn fail<T: 'static>(
    shared: &Rc<Shared>,
    interest: Interest,
    error: io::Error,
    on_complete: Completion<T>,
) -> PendingOperation {
    let op = Rc::new(OpState::<T> {
        interest,
        registration: Cell::new(None),
        attempt: RefCell::new(None),
        on_complete: Cell::new(Some(on_complete)),
    });
    op.finish(Err(error));
    PendingOperation { op, endpoint: Rc::downgrade(shared), interest }
}

fn step<T: 'static>(endpoint: Weak<Shared>, op: Rc<OpState<T>>) {
    op.registration.set(None);
    if !op.is_pending() {
        return;
    }
    let Some(shared) = endpoint.upgrade().filter(|s| s.is_alive()) else { return };

    let result = {
        let mut attempt = op.attempt.borrow_mut();
        let Some(attempt) = attempt.as_mut() else { return };
        attempt(shared.fd())
    };
    let result = match result {
        Ok(Some(val)) => Ok(val),
        Ok(None) => {
            let (weak, opc) = (endpoint.clone(), Rc::clone(&op));
            let callback: ReadyCallback = Box::new(move |_, _| step(weak, opc));
            match shared.reactor.register(shared.fd(), op.interest, None, callback) {
                Ok(registration) => {
                    trace!(?registration, "operation would block, rearmed");
                    op.registration.set(Some(registration));
                    return;
                }
                Err(e) => Err(e),
            }
        }
        Err(e) => Err(e),
    };
    let dyn_op: Rc<dyn Op> = op.clone();
    shared.release(op.interest, &dyn_op);
    drop(shared);
    op.finish(result);
}
