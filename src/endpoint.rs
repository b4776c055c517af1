//! [`Endpoint`], a nonblocking Unix domain stream socket driven by a [`Reactor`].

pub mod options;

use {
    crate::{
        addr,
        c_wrappers,
        error::{wrong_state, BindError, ConnectError, SocketCreationError},
        pending::{self, Op, PendingOperation},
        reactor::{Interest, Readiness, Reactor},
        next_connect_backoff, ConnectWaitMode, WouldBlockExt, CONNECT_BACKOFF_MIN,
    },
    std::{
        cell::{Cell, RefCell},
        fmt::{self, Debug, Formatter},
        io::{self, prelude::*},
        os::fd::{AsFd, AsRawFd, BorrowedFd, IntoRawFd, OwnedFd, RawFd},
        path::{Path, PathBuf},
        rc::Rc,
        time::{Duration, Instant},
    },
    tracing::{debug, trace},
};

/// The lifecycle stage of an [`Endpoint`].
///
/// ```text
/// Created ─┬─ bind ──> Bound ─ listen ──> Listening
///          └─ connect ──> Connecting ──> Connected
/// ```
///
/// Endpoints received from [`accept`](Endpoint::accept), [`pair`](Endpoint::pair) or descriptor
/// passing start out `Connected`. Closing is represented by the endpoint being dropped.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum EndpointState {
    /// Freshly created, neither bound nor connected.
    Created,
    /// Bound to a path.
    Bound,
    /// Accepting connections.
    Listening,
    /// Waiting for a nonblocking `connect` to finish.
    Connecting,
    /// Connected to a peer.
    Connected,
}

/// State that outlives the endpoint for as long as a retry is holding on to it.
pub(crate) struct Shared {
    raw_fd: RawFd,
    alive: Cell<bool>,
    state: Cell<EndpointState>,
    pub(crate) reactor: Rc<dyn Reactor>,
    pending: [RefCell<Option<Rc<dyn Op>>>; 2],
}
impl Shared {
    #[inline]
    pub(crate) fn is_alive(&self) -> bool { self.alive.get() }
    /// Borrows the endpoint's descriptor.
    ///
    /// Must only be called while [`is_alive`](Self::is_alive) holds.
    #[inline]
    pub(crate) fn fd(&self) -> BorrowedFd<'_> {
        debug_assert!(self.is_alive(), "endpoint descriptor used after close");
        // SAFETY: the descriptor is owned by the endpoint, which clears `alive` before closing it
        unsafe { BorrowedFd::borrow_raw(self.raw_fd) }
    }
    /// Takes the slot for `interest`. Fails if an operation that is still pending occupies it.
    pub(crate) fn claim(&self, interest: Interest, op: Rc<dyn Op>) -> bool {
        let Some(slot) = self.pending.get(interest.index()) else { return false };
        let mut slot = slot.borrow_mut();
        if slot.as_ref().is_some_and(|o| o.is_pending()) {
            return false;
        }
        *slot = Some(op);
        true
    }
    /// Empties the slot for `interest` if it's occupied by `op`.
    pub(crate) fn release(&self, interest: Interest, op: &Rc<dyn Op>) {
        let Some(slot) = self.pending.get(interest.index()) else { return };
        let mut slot = slot.borrow_mut();
        let same = slot
            .as_ref()
            .is_some_and(|o| Rc::as_ptr(o).cast::<()>() == Rc::as_ptr(op).cast::<()>());
        if same {
            *slot = None;
        }
    }
}

/// Cancels pending operations when the endpoint goes away. Declared before the descriptor in
/// [`Endpoint`] so that this happens while the descriptor is still open.
struct LifetimeGuard(Rc<Shared>);
impl Drop for LifetimeGuard {
    fn drop(&mut self) {
        let shared = &*self.0;
        shared.alive.set(false);
        for slot in &shared.pending {
            let op = slot.borrow_mut().take();
            if let Some(op) = op {
                if op.cancel(Some(&*shared.reactor)) {
                    trace!(fd = shared.raw_fd, "pending operation cancelled by close");
                }
            }
        }
    }
}

/// A Unix domain stream socket in nonblocking mode.
///
/// Every operation that would block is turned into a registration with the endpoint's
/// [`Reactor`], and its outcome is delivered to a callback from the reactor's dispatch loop.
/// There may be at most one such operation in flight per direction: one that waits for the
/// socket to become readable ([`accept_with`](Self::accept_with) and descriptor receives) and one
/// that waits for it to become writable (descriptor sends).
///
/// Dropping the endpoint closes the socket and silently cancels every operation in flight.
pub struct Endpoint {
    shared: LifetimeGuard,
    fd: OwnedFd,
}

/// Creation.
impl Endpoint {
    /// Creates an unbound, unconnected endpoint.
    ///
    /// The socket is put into nonblocking close-on-exec mode before this returns.
    pub fn create(reactor: Rc<dyn Reactor>) -> Result<Self, SocketCreationError> {
        let fd = c_wrappers::create_uds()?;
        trace!(fd = fd.as_raw_fd(), "local socket created");
        Ok(Self::wrap(reactor, fd, EndpointState::Created))
    }
    /// Creates a pair of endpoints connected to each other.
    pub fn pair(reactor: Rc<dyn Reactor>) -> Result<(Self, Self), SocketCreationError> {
        let (a, b) = c_wrappers::create_uds_pair()?;
        trace!(fds = ?(a.as_raw_fd(), b.as_raw_fd()), "local socket pair created");
        Ok((
            Self::wrap(Rc::clone(&reactor), a, EndpointState::Connected),
            Self::wrap(reactor, b, EndpointState::Connected),
        ))
    }
    /// Wraps a descriptor of an already connected Unix domain stream socket, switching it into
    /// nonblocking mode.
    pub fn from_connected_fd(reactor: Rc<dyn Reactor>, fd: OwnedFd) -> io::Result<Self> {
        c_wrappers::set_nonblocking(fd.as_fd(), true)?;
        Ok(Self::wrap(reactor, fd, EndpointState::Connected))
    }
    fn wrap(reactor: Rc<dyn Reactor>, fd: OwnedFd, state: EndpointState) -> Self {
        let shared = Shared {
            raw_fd: fd.as_raw_fd(),
            alive: Cell::new(true),
            state: Cell::new(state),
            reactor,
            pending: Default::default(),
        };
        Self { shared: LifetimeGuard(Rc::new(shared)), fd }
    }
}

/// Accessors.
impl Endpoint {
    /// The current lifecycle stage.
    #[inline]
    pub fn state(&self) -> EndpointState { self.shared.0.state.get() }
    /// The reactor that drives this endpoint.
    #[inline]
    pub fn reactor(&self) -> &Rc<dyn Reactor> { &self.shared.0.reactor }
    /// Whether the socket is in nonblocking mode, as reported by the OS. Always `true` unless
    /// somebody tampered with the descriptor.
    pub fn is_nonblocking(&self) -> io::Result<bool> { c_wrappers::get_nonblocking(self.fd.as_fd()) }
    /// The path the socket is bound to. Empty for unnamed sockets.
    pub fn local_path(&self) -> io::Result<PathBuf> {
        c_wrappers::local_addr(self.fd.as_fd()).map(|raw| addr::decode(&raw))
    }
    /// The path the peer's socket is bound to. Empty if the peer is unnamed, which is the case
    /// for clients that did not bind before connecting.
    pub fn peer_path(&self) -> io::Result<PathBuf> {
        c_wrappers::peer_addr(self.fd.as_fd()).map(|raw| addr::decode(&raw))
    }
    /// Takes the socket's pending error (`SO_ERROR`), if any.
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        c_wrappers::take_error(self.fd.as_fd())
    }

    #[inline]
    pub(crate) fn shared(&self) -> &Rc<Shared> { &self.shared.0 }
    #[inline]
    fn set_state(&self, state: EndpointState) {
        trace!(fd = self.fd.as_raw_fd(), from = ?self.state(), to = ?state, "state transition");
        self.shared.0.state.set(state);
    }
    pub(crate) fn expect_state(&self, expected: EndpointState, op: &str) -> io::Result<()> {
        let state = self.state();
        if state == expected {
            Ok(())
        } else {
            Err(wrong_state(op, state))
        }
    }
}

/// Server side.
impl Endpoint {
    /// Binds the endpoint to a filesystem path, which must not exist yet.
    ///
    /// The endpoint must be in the [`Created`](EndpointState::Created) state. On failure, the
    /// state is left unchanged.
    pub fn bind(&self, path: impl AsRef<Path>) -> Result<(), BindError> {
        let path = path.as_ref();
        self.expect_state(EndpointState::Created, "bind").map_err(|e| BindError::new(path, e))?;
        let raw = addr::encode(path).map_err(|e| BindError::new(path, e))?;
        c_wrappers::bind(self.fd.as_fd(), &raw).map_err(|e| BindError::new(path, e))?;
        self.set_state(EndpointState::Bound);
        debug!(fd = self.fd.as_raw_fd(), ?path, "local socket bound");
        Ok(())
    }
    /// Starts accepting connections with the given backlog.
    ///
    /// The endpoint must be [`Bound`](EndpointState::Bound).
    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        self.expect_state(EndpointState::Bound, "listen on")?;
        c_wrappers::listen(self.fd.as_fd(), backlog)?;
        self.set_state(EndpointState::Listening);
        Ok(())
    }
    /// Accepts one connection if there is one waiting, returning `Ok(None)` otherwise.
    pub fn accept(&self) -> io::Result<Option<Endpoint>> {
        self.expect_state(EndpointState::Listening, "accept on")?;
        accept_once(self.reactor(), self.fd.as_fd())
    }
    /// Accepts one connection, waiting on the reactor for one to arrive if necessary.
    ///
    /// All failures, including the endpoint not listening, are delivered to `on_complete`.
    pub fn accept_with(
        &self,
        on_complete: impl FnOnce(io::Result<Endpoint>) + 'static,
    ) -> PendingOperation {
        let on_complete = Box::new(on_complete);
        if let Err(e) = self.expect_state(EndpointState::Listening, "accept on") {
            return pending::fail(self.shared(), Interest::Read, e, on_complete);
        }
        let reactor = Rc::clone(self.reactor());
        let attempt = Box::new(move |fd: BorrowedFd<'_>| accept_once(&reactor, fd));
        pending::start(self.shared(), Interest::Read, attempt, on_complete)
    }
}

fn accept_once(reactor: &Rc<dyn Reactor>, fd: BorrowedFd<'_>) -> io::Result<Option<Endpoint>> {
    loop {
        match c_wrappers::accept(fd) {
            Ok(conn) => {
                trace!(listener = fd.as_raw_fd(), fd = conn.as_raw_fd(), "connection accepted");
                return Ok(Some(Endpoint::wrap(Rc::clone(reactor), conn, EndpointState::Connected)));
            }
            Err(e) if e.is_would_block() => return Ok(None),
            Err(e) if e.is_interrupted() => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Callback receiving the outcome of [`Endpoint::connect`]: the connected endpoint, `None` if
/// the wait timed out, or an error that occurred after the connection attempt had started.
pub type ConnectCallback = Box<dyn FnOnce(Result<Option<Endpoint>, ConnectError>)>;

/// Client side.
impl Endpoint {
    /// Connects to the endpoint listening at `path`.
    ///
    /// The endpoint must be in the [`Created`](EndpointState::Created) state, and is handed over
    /// to `on_complete` once connected:
    /// - if the connection is established right away, `on_complete` is invoked before this
    ///   returns;
    /// - if it's in progress, the endpoint waits for write readiness with the reactor, for no
    ///   longer than `wait_mode` permits. Upon readiness, the socket's pending error is checked
    ///   and the connection attempt is confirmed, after which `on_complete` receives either the
    ///   endpoint or the error. If the wait times out, `on_complete` receives `Ok(None)` and the
    ///   endpoint is closed;
    /// - if the listener's backlog is full, the attempt is repeated on a reactor timer, with the
    ///   delay doubling up to a limit, for as long as `wait_mode` permits.
    ///
    /// Failures detected before this returns are returned directly, in which case `on_complete`
    /// is never invoked. This includes the listener not existing or refusing the connection.
    pub fn connect(
        self,
        path: impl AsRef<Path>,
        wait_mode: ConnectWaitMode,
        on_complete: impl FnOnce(Result<Option<Endpoint>, ConnectError>) + 'static,
    ) -> Result<(), ConnectError> {
        let path = path.as_ref();
        let err = |e| ConnectError::new(path, e);
        self.expect_state(EndpointState::Created, "connect").map_err(err)?;
        let raw = addr::encode(path).map_err(|e| ConnectError::new(path, e))?;
        match c_wrappers::connect(self.fd.as_fd(), &raw) {
            Ok(()) => {
                self.set_state(EndpointState::Connected);
                debug!(fd = self.fd.as_raw_fd(), ?path, "connected synchronously");
                on_complete(Ok(Some(self)));
                Ok(())
            }
            Err(e) if e.is_connect_in_progress() => {
                self.set_state(EndpointState::Connecting);
                let deadline = wait_mode.timeout().map(|t| Instant::now().checked_add(t));
                let attempt = ConnectAttempt {
                    endpoint: self,
                    path: path.to_owned(),
                    raw,
                    // A timeout too large to represent is as good as none
                    deadline: deadline.flatten(),
                    on_complete: Rc::new(Cell::new(Some(Box::new(on_complete)))),
                    backoff: CONNECT_BACKOFF_MIN,
                };
                attempt.wait(&e).map_err(err)
            }
            Err(e) => Err(err(e)),
        }
    }
}

struct ConnectAttempt {
    endpoint: Endpoint,
    path: PathBuf,
    raw: addr::RawAddress,
    deadline: Option<Instant>,
    on_complete: Rc<Cell<Option<ConnectCallback>>>,
    backoff: Duration,
}
impl ConnectAttempt {
    /// Waits for the attempt that failed with `e` to be worth repeating.
    fn wait(self, e: &io::Error) -> io::Result<()> {
        // A full backlog is reported as would-block, and is the one case where the socket is
        // writable without the attempt having made progress
        if e.is_would_block() {
            self.back_off()
        } else {
            self.arm()
        }
    }

    fn arm(self) -> io::Result<()> {
        let timeout = self.deadline.map(|d| d.saturating_duration_since(Instant::now()));
        let reactor = Rc::clone(self.endpoint.reactor());
        let fd = self.endpoint.fd.as_raw_fd();
        // SAFETY: the endpoint, and thus the descriptor, is moved into the callback, so it stays
        // open for as long as the registration exists
        let bfd = unsafe { BorrowedFd::borrow_raw(fd) };
        let registration = reactor.register(
            bfd,
            Interest::Write,
            timeout,
            Box::new(move |_, readiness| self.resume(readiness)),
        )?;
        trace!(?registration, ?timeout, "connect in progress");
        Ok(())
    }

    fn back_off(mut self) -> io::Result<()> {
        let remaining = self.deadline.map(|d| d.saturating_duration_since(Instant::now()));
        let delay = remaining.map_or(self.backoff, |r| r.min(self.backoff));
        self.backoff = next_connect_backoff(self.backoff);
        let reactor = Rc::clone(self.endpoint.reactor());
        let timer = reactor.schedule(delay, Box::new(move || self.retry()))?;
        trace!(?timer, ?delay, "listener backlog full, retrying connect later");
        Ok(())
    }

    fn complete(&self, result: Result<Option<Endpoint>, ConnectError>) {
        if let Some(on_complete) = self.on_complete.take() {
            on_complete(result);
        }
    }

    fn resume(self, readiness: Readiness) {
        match readiness {
            Readiness::Ready => self.retry(),
            Readiness::TimedOut => self.time_out(),
        }
    }

    fn time_out(self) {
        debug!(path = ?self.path, "connect timed out");
        let on_complete = self.on_complete.take();
        // The endpoint is closed before the callback runs
        drop(self.endpoint);
        if let Some(on_complete) = on_complete {
            on_complete(Ok(None));
        }
    }

    fn retry(self) {
        let fd = self.endpoint.fd.as_fd();
        let result = match c_wrappers::take_error(fd) {
            Ok(Some(e)) | Err(e) => Err(e),
            Ok(None) => c_wrappers::connect(fd, &self.raw),
        };
        match result {
            Ok(()) => self.connected(),
            Err(e) if e.raw_os_error() == Some(libc::EISCONN) => self.connected(),
            Err(e) if e.is_connect_in_progress() => {
                if self.deadline.is_some_and(|d| d <= Instant::now()) {
                    return self.time_out();
                }
                let (on_complete, path) = (Rc::clone(&self.on_complete), self.path.clone());
                if let Err(e) = self.wait(&e) {
                    if let Some(on_complete) = on_complete.take() {
                        on_complete(Err(ConnectError::new(&path, e)));
                    }
                }
            }
            Err(e) => {
                debug!(path = ?self.path, error = %e, "connect failed");
                let err = ConnectError::new(&self.path, e);
                self.complete(Err(err));
            }
        }
    }

    fn connected(self) {
        self.endpoint.set_state(EndpointState::Connected);
        debug!(fd = self.endpoint.fd.as_raw_fd(), path = ?self.path, "connected");
        let Self { endpoint, on_complete, .. } = self;
        if let Some(on_complete) = on_complete.take() {
            on_complete(Ok(Some(endpoint)));
        }
    }
}

/// Teardown.
impl Endpoint {
    /// Closes the socket, reporting errors that dropping would ignore. Pending operations are
    /// cancelled first.
    pub fn close(self) -> io::Result<()> {
        let Self { shared, fd } = self;
        drop(shared);
        c_wrappers::close(fd)
    }
    /// Releases ownership of the descriptor after cancelling pending operations.
    pub fn into_fd(self) -> OwnedFd {
        let Self { shared, fd } = self;
        drop(shared);
        fd
    }
}

impl Read for &Endpoint {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let size_or_err =
            unsafe { libc::read(self.fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
        #[allow(clippy::as_conversions, clippy::cast_sign_loss)]
        let ret = ok_or_errno!(size_or_err >= 0 => size_or_err as usize);
        ret
    }
}
impl Write for &Endpoint {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let size_or_err =
            unsafe { libc::write(self.fd.as_raw_fd(), buf.as_ptr().cast(), buf.len()) };
        #[allow(clippy::as_conversions, clippy::cast_sign_loss)]
        let ret = ok_or_errno!(size_or_err >= 0 => size_or_err as usize);
        ret
    }
    #[inline]
    fn flush(&mut self) -> io::Result<()> { Ok(()) }
}
impl Read for Endpoint {
    #[inline]
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> { (&*self).read(buf) }
}
impl Write for Endpoint {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> { (&*self).write(buf) }
    #[inline]
    fn flush(&mut self) -> io::Result<()> { Ok(()) }
}

forward_as_fd!(Endpoint, fd);
impl From<Endpoint> for OwnedFd {
    #[inline]
    fn from(endpoint: Endpoint) -> Self { endpoint.into_fd() }
}
impl IntoRawFd for Endpoint {
    #[inline]
    fn into_raw_fd(self) -> RawFd { self.into_fd().into_raw_fd() }
}

impl Debug for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("fd", &self.fd.as_raw_fd())
            .field("state", &self.state())
            .finish()
    }
}
