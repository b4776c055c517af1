//! Asynchronous endpoints for the Tokio runtime.
//!
//! [`Endpoint`] is the Tokio counterpart of [the callback-driven one](crate::Endpoint), with the
//! runtime's I/O driver standing in for the reactor. It covers the client side and descriptor
//! passing; byte I/O is available through [`as_stream`](Endpoint::as_stream).

use {
    crate::{
        addr, c_wrappers,
        error::{ConnectError, ReceiveDescriptorError, SendDescriptorError},
        exchange::{recv_fd_once, send_fd_once},
        next_connect_backoff, ConnectWaitMode, WouldBlockExt, CONNECT_BACKOFF_MIN,
    },
    std::{
        io,
        os::{
            fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd},
            unix::net::UnixStream as StdUnixStream,
        },
        path::Path,
    },
    tokio::{
        io::Interest,
        net::UnixStream,
        time::{sleep, timeout_at, Instant},
    },
    tracing::debug,
};

/// A connected Unix domain stream socket registered with the Tokio runtime.
#[derive(Debug)]
pub struct Endpoint(UnixStream);

impl Endpoint {
    /// Connects to the endpoint listening at `path`.
    ///
    /// Resolves to `Ok(None)` if `wait_mode` is a timeout and the connection could not be
    /// established before it elapsed. Like its callback-driven counterpart, the socket's pending
    /// error is checked and the connection confirmed once the socket becomes writable, and a
    /// listener with a full backlog is retried after a delay that doubles up to a limit.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn connect(
        path: impl AsRef<Path>,
        wait_mode: ConnectWaitMode,
    ) -> Result<Option<Self>, ConnectError> {
        let path = path.as_ref();
        let err = |e| ConnectError::new(path, e);
        let raw = addr::encode(path).map_err(|e| ConnectError::new(path, e))?;
        let fd = c_wrappers::create_uds().map_err(err)?;
        let deadline = wait_mode.timeout().and_then(|t| Instant::now().checked_add(t));

        let backlog_full = match c_wrappers::connect(fd.as_fd(), &raw) {
            Ok(()) => None,
            Err(e) if e.is_connect_in_progress() => Some(e.is_would_block()),
            Err(e) => return Err(err(e)),
        };
        let stream = UnixStream::from_std(StdUnixStream::from(fd)).map_err(err)?;
        let Some(backlog_full) = backlog_full else {
            debug!(?path, "connected synchronously");
            return Ok(Some(Self(stream)));
        };

        let confirm = confirm_connect(&stream, &raw, backlog_full);
        let confirmed = match deadline {
            Some(deadline) => match timeout_at(deadline, confirm).await {
                Ok(r) => r,
                Err(_elapsed) => {
                    debug!(?path, "connect timed out");
                    return Ok(None);
                }
            },
            None => confirm.await,
        };
        confirmed.map_err(err)?;
        debug!(?path, "connected");
        Ok(Some(Self(stream)))
    }

    /// Sends the descriptor `fd` to the peer, waiting for room in the send buffer if necessary.
    pub async fn send_descriptor(&self, fd: BorrowedFd<'_>) -> Result<(), SendDescriptorError> {
        self.0
            .async_io(Interest::WRITABLE, || {
                send_fd_once(self.0.as_fd(), fd)?.ok_or_else(would_block)
            })
            .await
            .map_err(SendDescriptorError::from)
    }

    /// Receives a descriptor from the peer, waiting for one to arrive if necessary.
    ///
    /// Resolves to `Ok(None)` if the peer sent data without a well-formed descriptor attached.
    pub async fn receive_descriptor(&self) -> Result<Option<OwnedFd>, ReceiveDescriptorError> {
        self.0
            .async_io(Interest::READABLE, || recv_fd_once(self.0.as_fd())?.ok_or_else(would_block))
            .await
            .map_err(ReceiveDescriptorError::from)
    }

    /// Receives a descriptor and wraps it into an endpoint registered with the current runtime.
    pub async fn receive_wrapped_endpoint(&self) -> Result<Option<Self>, ReceiveDescriptorError> {
        let Some(fd) = self.receive_descriptor().await? else { return Ok(None) };
        Self::from_connected_fd(fd).map(Some).map_err(ReceiveDescriptorError::from)
    }

    /// Wraps a descriptor of an already connected Unix domain stream socket.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn from_connected_fd(fd: OwnedFd) -> io::Result<Self> {
        c_wrappers::set_nonblocking(fd.as_fd(), true)?;
        UnixStream::from_std(StdUnixStream::from(fd)).map(Self)
    }

    /// Borrows the underlying Tokio stream, for byte I/O.
    #[inline]
    pub fn as_stream(&self) -> &UnixStream { &self.0 }
    /// Unwraps into the underlying Tokio stream.
    #[inline]
    pub fn into_stream(self) -> UnixStream { self.0 }
}

impl From<UnixStream> for Endpoint {
    #[inline]
    fn from(stream: UnixStream) -> Self { Self(stream) }
}

impl AsFd for Endpoint {
    #[inline]
    fn as_fd(&self) -> BorrowedFd<'_> { self.0.as_fd() }
}
impl AsRawFd for Endpoint {
    #[inline]
    fn as_raw_fd(&self) -> RawFd { self.0.as_raw_fd() }
}

/// Waits for a connection in progress to finish, checking the pending error and confirming the
/// connection every time the socket becomes writable. While the listener's backlog is full, the
/// socket is writable all along, so the attempt is repeated on a timer instead.
async fn confirm_connect(
    stream: &UnixStream,
    raw: &addr::RawAddress,
    mut backlog_full: bool,
) -> io::Result<()> {
    let mut backoff = CONNECT_BACKOFF_MIN;
    loop {
        if backlog_full {
            sleep(backoff).await;
            backoff = next_connect_backoff(backoff);
        } else {
            stream.writable().await?;
        }
        let fd = stream.as_fd();
        let result = match c_wrappers::take_error(fd)? {
            Some(e) => Err(e),
            None => c_wrappers::connect(fd, raw),
        };
        match result {
            Ok(()) => return Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EISCONN) => return Ok(()),
            Err(e) if e.is_would_block() => backlog_full = true,
            Err(e) if e.is_connect_in_progress() => {
                backlog_full = false;
                // Clears the readiness that Tokio cached, so that the next wait blocks
                let _ = stream.try_io(Interest::WRITABLE, || Err::<(), _>(would_block()));
            }
            Err(e) => return Err(e),
        }
    }
}

fn would_block() -> io::Error { io::Error::from(io::ErrorKind::WouldBlock) }
