//! Passing file descriptors between processes over a connected [`Endpoint`].
//!
//! A descriptor travels as a single `SCM_RIGHTS` control message attached to a one-byte payload,
//! since a stream socket will not carry control data on its own. The byte is discarded on the
//! receiving end. Both directions are nonblocking: a send that finds the socket buffer full, or a
//! receive that finds it empty, waits for readiness on the endpoint's reactor and retries from
//! scratch.
//!
//! Received descriptors are close-on-exec.

mod ancillary;

use {
    crate::{
        endpoint::{Endpoint, EndpointState},
        error::{ReceiveDescriptorError, SendDescriptorError},
        pending::{self, PendingOperation},
        reactor::Interest,
        WouldBlockExt,
    },
    ancillary::{AncillaryMessage, CONTROL_LEN},
    std::{
        io,
        mem::zeroed,
        os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd},
        rc::Rc,
    },
    tracing::{debug, trace},
};

/// The byte that accompanies every descriptor.
const PLACEHOLDER: u8 = 0;

#[cfg(uds_msg_nosignal)]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(uds_msg_nosignal))]
const SEND_FLAGS: libc::c_int = 0;

#[cfg(uds_cmsg_cloexec)]
const RECV_FLAGS: libc::c_int = libc::MSG_CMSG_CLOEXEC;
#[cfg(not(uds_cmsg_cloexec))]
const RECV_FLAGS: libc::c_int = 0;

/// Makes one attempt at sending `fd` over `socket`.
///
/// Returns `Ok(None)` if the socket's send buffer is full.
pub(crate) fn send_fd_once(socket: BorrowedFd<'_>, fd: BorrowedFd<'_>) -> io::Result<Option<()>> {
    let mut payload = [PLACEHOLDER];
    let mut control = AncillaryMessage::for_send(fd.as_raw_fd());
    let mut iov = libc::iovec { iov_base: payload.as_mut_ptr().cast(), iov_len: payload.len() };
    // SAFETY: msghdr is plain old data
    let mut hdr: libc::msghdr = unsafe { zeroed() };
    hdr.msg_iov = &mut iov;
    hdr.msg_iovlen = 1;
    hdr.msg_control = control.as_mut_ptr().cast();
    #[allow(clippy::as_conversions)]
    {
        hdr.msg_controllen = CONTROL_LEN as _;
    }

    loop {
        let ret = unsafe { libc::sendmsg(socket.as_raw_fd(), &hdr, SEND_FLAGS) };
        if ret > 0 {
            return Ok(Some(()));
        }
        if ret == 0 {
            return Err(io::Error::from(io::ErrorKind::WriteZero));
        }
        let e = io::Error::last_os_error();
        if e.is_interrupted() {
            continue;
        }
        return if e.is_would_block() { Ok(None) } else { Err(e) };
    }
}

/// Makes one attempt at receiving a descriptor from `socket`.
///
/// Returns `Ok(None)` if there's nothing to receive yet and `Ok(Some(None))` if a byte arrived
/// without a well-formed descriptor attached. End of file is reported as
/// [`UnexpectedEof`](io::ErrorKind::UnexpectedEof).
pub(crate) fn recv_fd_once(socket: BorrowedFd<'_>) -> io::Result<Option<Option<OwnedFd>>> {
    let mut payload = [0_u8];
    let mut control = AncillaryMessage::for_receive();
    let mut iov = libc::iovec { iov_base: payload.as_mut_ptr().cast(), iov_len: payload.len() };
    // SAFETY: as above
    let mut hdr: libc::msghdr = unsafe { zeroed() };
    hdr.msg_iov = &mut iov;
    hdr.msg_iovlen = 1;
    hdr.msg_control = control.as_mut_ptr().cast();
    #[allow(clippy::as_conversions)]
    {
        hdr.msg_controllen = CONTROL_LEN as _;
    }

    let ret = loop {
        let ret = unsafe { libc::recvmsg(socket.as_raw_fd(), &mut hdr, RECV_FLAGS) };
        if ret >= 0 {
            break ret;
        }
        let e = io::Error::last_os_error();
        if e.is_interrupted() {
            continue;
        }
        return if e.is_would_block() { Ok(None) } else { Err(e) };
    };
    if ret == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "peer closed the connection before sending a descriptor",
        ));
    }

    #[allow(clippy::as_conversions, clippy::unnecessary_cast)]
    let controllen = hdr.msg_controllen as usize;
    // SAFETY: the kernel has just installed these descriptors into our table, and nothing else
    // knows about them
    let mut fds = control.received_fds(controllen).map(|raw| unsafe { OwnedFd::from_raw_fd(raw) });
    let fd = fds.next();
    // Closes every descriptor past the first one
    let surplus = fds.count();
    let truncated = hdr.msg_flags & libc::MSG_CTRUNC != 0;
    if truncated || surplus != 0 {
        debug!(surplus, truncated, "malformed control data, discarding descriptors");
        return Ok(Some(None));
    }
    #[cfg(not(uds_cmsg_cloexec))]
    if let Some(fd) = &fd {
        crate::c_wrappers::set_cloexec(fd.as_fd())?;
    }
    Ok(Some(fd))
}

/// Descriptor passing.
impl Endpoint {
    /// Sends the descriptor `fd` to the peer, waiting on the reactor for room in the send buffer
    /// if necessary.
    ///
    /// `fd` is kept alive until the operation completes or is cancelled, and then dropped. The
    /// peer receives a duplicate of it, so the sender is free to close its copy afterwards.
    ///
    /// Every outcome is delivered to `on_complete`, which may be invoked before this returns. The
    /// endpoint must be [`Connected`](EndpointState::Connected), and only one send may be in
    /// flight at a time: a second one fails with `EBUSY`.
    pub fn send_descriptor<F: AsFd + 'static>(
        &self,
        fd: F,
        on_complete: impl FnOnce(Result<(), SendDescriptorError>) + 'static,
    ) -> PendingOperation {
        let on_complete = Box::new(move |r: io::Result<()>| on_complete(r.map_err(Into::into)));
        if let Err(e) = self.expect_state(EndpointState::Connected, "send a descriptor over") {
            return pending::fail(self.shared(), Interest::Write, e, on_complete);
        }
        trace!(socket = self.as_raw_fd(), fd = fd.as_fd().as_raw_fd(), "sending descriptor");
        let attempt = Box::new(move |socket: BorrowedFd<'_>| send_fd_once(socket, fd.as_fd()));
        pending::start(self.shared(), Interest::Write, attempt, on_complete)
    }

    /// Receives a descriptor from the peer, waiting on the reactor for one to arrive if
    /// necessary.
    ///
    /// `on_complete` receives `Ok(None)` if the peer sent data without a descriptor attached, or
    /// a control message that is anything other than exactly one descriptor. The peer closing
    /// the connection is reported as [`UnexpectedEof`](io::ErrorKind::UnexpectedEof).
    ///
    /// The same rules as for [`send_descriptor`](Self::send_descriptor) apply to state, busyness
    /// and callback delivery.
    pub fn receive_descriptor(
        &self,
        on_complete: impl FnOnce(Result<Option<OwnedFd>, ReceiveDescriptorError>) + 'static,
    ) -> PendingOperation {
        let on_complete =
            Box::new(move |r: io::Result<Option<OwnedFd>>| on_complete(r.map_err(Into::into)));
        if let Err(e) = self.expect_state(EndpointState::Connected, "receive a descriptor from") {
            return pending::fail(self.shared(), Interest::Read, e, on_complete);
        }
        trace!(socket = self.as_raw_fd(), "receiving descriptor");
        pending::start(self.shared(), Interest::Read, Box::new(recv_fd_once), on_complete)
    }

    /// Receives a descriptor like [`receive_descriptor`](Self::receive_descriptor) does, and
    /// wraps it into an endpoint driven by the same reactor.
    ///
    /// The descriptor is trusted to be a connected Unix domain stream socket.
    pub fn receive_wrapped_endpoint(
        &self,
        on_complete: impl FnOnce(Result<Option<Endpoint>, ReceiveDescriptorError>) + 'static,
    ) -> PendingOperation {
        let reactor = Rc::clone(self.reactor());
        self.receive_descriptor(move |result| {
            let wrapped = result.and_then(|fd| {
                fd.map(|fd| Endpoint::from_connected_fd(reactor, fd))
                    .transpose()
                    .map_err(ReceiveDescriptorError::from)
            });
            on_complete(wrapped);
        })
    }
}
