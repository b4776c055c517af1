use {
    crate::{
        error::{ReceiveDescriptorError, SendDescriptorError},
        tests::util::*,
        Endpoint, EndpointState,
    },
    color_eyre::eyre::{bail, ensure},
    std::{
        fs::File,
        io::{self, prelude::*},
        mem::{size_of, zeroed},
        os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd},
        ptr,
        rc::Rc,
    },
};

type SendSlot = Slot<Result<(), SendDescriptorError>>;
type RecvSlot = Slot<Result<Option<OwnedFd>, ReceiveDescriptorError>>;

#[test]
fn pass_pipe_over_pair() -> TestResult {
    test_wrapper(|| {
        let (reactor, dyn_reactor) = new_reactor()?;
        let (a, b) = Endpoint::pair(dyn_reactor).opname("socketpair")?;

        for i in 0..num_iterations() {
            let (rx, tx) = pipe()?;
            let identity = file_identity(&rx)?;

            // Receiving first makes the receive wait on the reactor
            let received = RecvSlot::new();
            let recv_op = b.receive_descriptor(received.setter());
            ensure!(recv_op.is_pending(), "receive completed with nothing sent");

            let sent = SendSlot::new();
            a.send_descriptor(rx, sent.setter());
            ensure!(sent.is_set(), "send to an empty buffer did not complete synchronously");
            sent.take()?.opname("send")?;

            let r = received.clone();
            drive_until(&reactor, move || r.is_set())?;
            let Some(fd) = received.take()?.opname("receive")? else {
                bail!("descriptor #{i} got lost");
            };
            ensure_eq!(file_identity(&fd)?, identity);

            let mut tx = File::from(tx);
            tx.write_all(b"through the pipe").opname("pipe write")?;
            drop(tx);
            let mut buf = String::new();
            File::from(fd).read_to_string(&mut buf).opname("pipe read")?;
            ensure_eq!(buf, "through the pipe");
        }
        ensure!(reactor.is_idle(), "registrations left behind");
        Ok(())
    })
}

/// Fills up the socket buffer so that the send has to wait for the reader to drain it.
#[test]
fn send_waits_for_buffer_space() -> TestResult {
    test_wrapper(|| {
        let (reactor, dyn_reactor) = new_reactor()?;
        let (mut a, mut b) = Endpoint::pair(dyn_reactor).opname("socketpair")?;

        let chunk = [0xa5_u8; 4096];
        let mut filled = 0;
        // Big chunks first, then single bytes to plug whatever room is left
        for len in [chunk.len(), 1] {
            loop {
                match a.write(&chunk[..len]) {
                    Ok(n) => filled += n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(e).opname("buffer fill"),
                }
            }
        }
        ensure!(filled > 0, "socket buffer had no room at all");

        let (rx, _tx) = pipe()?;
        let identity = file_identity(&rx)?;
        let sent = SendSlot::new();
        let op = a.send_descriptor(rx, sent.setter());
        ensure!(op.is_pending(), "send into a full buffer did not wait");
        ensure!(!sent.is_set(), "send into a full buffer completed");

        let mut drained = 0;
        let mut buf = [0; 4096];
        while drained < filled {
            match b.read(&mut buf).opname("buffer drain")? {
                0 => bail!("unexpected end of file after {drained} bytes"),
                n => {
                    ensure!(buf[..n].iter().all(|&x| x == 0xa5), "filler corrupted");
                    drained += n;
                }
            }
        }

        let s = sent.clone();
        drive_until(&reactor, move || s.is_set())?;
        sent.take()?.opname("send")?;
        ensure!(!op.is_pending(), "handle still pending after completion");

        let received = RecvSlot::new();
        b.receive_descriptor(received.setter());
        let r = received.clone();
        drive_until(&reactor, move || r.is_set())?;
        let Some(fd) = received.take()?.opname("receive")? else { bail!("descriptor got lost") };
        ensure_eq!(file_identity(&fd)?, identity);
        Ok(())
    })
}

#[test]
fn plain_byte_yields_no_descriptor() -> TestResult {
    test_wrapper(|| {
        let (reactor, dyn_reactor) = new_reactor()?;
        let (mut a, b) = Endpoint::pair(dyn_reactor).opname("socketpair")?;
        a.write_all(&[0]).opname("write")?;
        let received = RecvSlot::new();
        b.receive_descriptor(received.setter());
        let r = received.clone();
        drive_until(&reactor, move || r.is_set())?;
        ensure!(received.take()?.opname("receive")?.is_none(), "descriptor out of nowhere");
        Ok(())
    })
}

#[test]
fn peer_hangup_is_unexpected_eof() -> TestResult {
    test_wrapper(|| {
        let (reactor, dyn_reactor) = new_reactor()?;
        let (a, b) = Endpoint::pair(dyn_reactor).opname("socketpair")?;
        let received = RecvSlot::new();
        b.receive_descriptor(received.setter());
        a.close().opname("close")?;
        let r = received.clone();
        drive_until(&reactor, move || r.is_set())?;
        let Err(e) = received.take()? else { bail!("receive from a closed peer succeeded") };
        ensure_eq!(e.io_kind(), io::ErrorKind::UnexpectedEof);
        Ok(())
    })
}

#[test]
fn second_receive_is_busy() -> TestResult {
    test_wrapper(|| {
        let (reactor, dyn_reactor) = new_reactor()?;
        let (a, b) = Endpoint::pair(dyn_reactor).opname("socketpair")?;

        let first = RecvSlot::new();
        let first_op = b.receive_descriptor(first.setter());
        let second = RecvSlot::new();
        let second_op = b.receive_descriptor(second.setter());
        ensure!(!second_op.is_pending(), "second receive is pending");
        let Err(e) = second.take()? else { bail!("second receive succeeded") };
        ensure_eq!(e.raw_os_error(), Some(libc::EBUSY));
        ensure!(first_op.is_pending(), "busy failure disturbed the first receive");

        // The send direction is independent
        let (rx, _tx) = pipe()?;
        let sent = SendSlot::new();
        b.send_descriptor(rx, sent.setter());
        sent.take()?.opname("send in the other direction")?;

        let (rx, _tx) = pipe()?;
        a.send_descriptor(rx, |r| r.expect("send failed"));
        let f = first.clone();
        drive_until(&reactor, move || f.is_set())?;
        ensure!(first.take()?.opname("receive")?.is_some(), "descriptor got lost");
        Ok(())
    })
}

#[test]
fn exchange_requires_connection() -> TestResult {
    test_wrapper(|| {
        let (_reactor, dyn_reactor) = new_reactor()?;
        let fresh = Endpoint::create(dyn_reactor).opname("socket creation")?;
        let (rx, _tx) = pipe()?;

        let sent = SendSlot::new();
        let op = fresh.send_descriptor(rx, sent.setter());
        ensure!(!op.is_pending(), "misplaced send is pending");
        let Err(e) = sent.take()? else { bail!("send over an unconnected endpoint succeeded") };
        ensure_eq!(e.io_kind(), io::ErrorKind::InvalidInput);

        let received = RecvSlot::new();
        fresh.receive_descriptor(received.setter());
        let Err(e) = received.take()? else { bail!("receive on an unconnected endpoint succeeded") };
        ensure_eq!(e.io_kind(), io::ErrorKind::InvalidInput);
        Ok(())
    })
}

#[test]
fn pass_endpoint() -> TestResult {
    test_wrapper(|| {
        let (reactor, dyn_reactor) = new_reactor()?;
        let (a, b) = Endpoint::pair(Rc::clone(&dyn_reactor)).opname("socketpair")?;
        let (mut near, far) = Endpoint::pair(Rc::clone(&dyn_reactor)).opname("socketpair")?;

        let wrapped = Slot::new();
        b.receive_wrapped_endpoint(wrapped.setter());
        a.send_descriptor(far, |r| r.expect("send failed"));
        let w = wrapped.clone();
        drive_until(&reactor, move || w.is_set())?;
        let Some(mut far) = wrapped.take()?.opname("receive")? else {
            bail!("endpoint got lost");
        };
        ensure_eq!(far.state(), EndpointState::Connected);
        ensure!(far.is_nonblocking().opname("fcntl")?, "received endpoint is in blocking mode");
        ensure!(Rc::ptr_eq(far.reactor(), &dyn_reactor), "received endpoint has another reactor");

        near.write_all(b"hi").opname("write")?;
        let mut buf = [0; 2];
        far.read_exact(&mut buf).opname("read")?;
        ensure_eq!(&buf, b"hi");
        Ok(())
    })
}

/// Sends every one of `fds` in a single control message, which is something `send_descriptor`
/// never does.
#[allow(clippy::as_conversions, clippy::cast_possible_truncation)]
fn send_many(socket: &Endpoint, fds: &[BorrowedFd<'_>]) -> TestResult {
    let raw = fds.iter().map(AsRawFd::as_raw_fd).collect::<Vec<RawFd>>();
    let payload_len = (raw.len() * size_of::<RawFd>()) as libc::c_uint;
    let space = unsafe { libc::CMSG_SPACE(payload_len) } as usize;
    // u64 elements for alignment
    let mut control = vec![0_u64; space.div_ceil(size_of::<u64>())];
    let mut byte = [0_u8];
    let mut iov = libc::iovec { iov_base: byte.as_mut_ptr().cast(), iov_len: byte.len() };
    let mut hdr: libc::msghdr = unsafe { zeroed() };
    hdr.msg_iov = &mut iov;
    hdr.msg_iovlen = 1;
    hdr.msg_control = control.as_mut_ptr().cast();
    hdr.msg_controllen = space as _;
    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&hdr);
        ensure!(!cmsg.is_null(), "no room for a control message header");
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(payload_len) as _;
        ptr::copy_nonoverlapping(raw.as_ptr(), libc::CMSG_DATA(cmsg).cast::<RawFd>(), raw.len());
    }
    if unsafe { libc::sendmsg(socket.as_raw_fd(), &hdr, 0) } != 1 {
        return Err(io::Error::last_os_error()).opname("sendmsg");
    }
    Ok(())
}

/// Whether every copy of the pipe's write end has been closed, as seen from its read end.
fn write_end_closed(rx: &OwnedFd) -> TestResult<bool> {
    let mut pfd = libc::pollfd { fd: rx.as_raw_fd(), events: libc::POLLIN, revents: 0 };
    if unsafe { libc::poll(&mut pfd, 1, 0) } == -1 {
        return Err(io::Error::last_os_error()).opname("poll");
    }
    Ok(pfd.revents & libc::POLLHUP != 0)
}

/// A message with more than one descriptor yields none of them, and every descriptor that
/// arrived gets closed. Two descriptors fit into the receive buffer on 64-bit Linux, three
/// truncate the message.
#[cfg(any(target_os = "linux", target_os = "android"))]
#[test]
fn surplus_descriptors_are_closed() -> TestResult {
    test_wrapper(|| {
        let (reactor, dyn_reactor) = new_reactor()?;
        let (a, b) = Endpoint::pair(dyn_reactor).opname("socketpair")?;

        for num_fds in [2, 3] {
            let (rx, tx) = pipe()?;
            let copies =
                (0..num_fds).map(|_| tx.try_clone()).collect::<io::Result<Vec<_>>>().opname("dup")?;
            send_many(&a, &copies.iter().map(AsFd::as_fd).collect::<Vec<_>>())?;
            drop((tx, copies));

            let received = RecvSlot::new();
            b.receive_descriptor(received.setter());
            let r = received.clone();
            drive_until(&reactor, move || r.is_set())?;
            ensure!(
                received.take()?.opname("receive")?.is_none(),
                "descriptor out of a message with {num_fds} of them"
            );
            ensure!(write_end_closed(&rx)?, "descriptors out of a message with {num_fds} leaked");
        }

        // The connection is still usable afterwards
        let (rx, _tx) = pipe()?;
        let identity = file_identity(&rx)?;
        a.send_descriptor(rx, |r| r.expect("send failed"));
        let received = RecvSlot::new();
        b.receive_descriptor(received.setter());
        let r = received.clone();
        drive_until(&reactor, move || r.is_set())?;
        let Some(fd) = received.take()?.opname("receive")? else { bail!("descriptor got lost") };
        ensure_eq!(file_identity(&fd)?, identity);
        Ok(())
    })
}
