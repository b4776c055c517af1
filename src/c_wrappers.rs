use {
    crate::{addr::RawAddress, FdOrErrno, OrErrno},
    libc::{c_int, sockaddr, sockaddr_un, socklen_t, AF_UNIX, SOCK_STREAM},
    std::{
        io,
        mem::{size_of, zeroed},
        os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd},
        ptr,
    },
};
#[cfg(not(any(target_os = "linux", target_os = "android")))]
use std::os::fd::AsFd;

#[allow(clippy::as_conversions)]
const SUN_SIZE: socklen_t = size_of::<sockaddr_un>() as socklen_t;

/// Creates a `SOCK_STREAM` local socket in nonblocking close-on-exec mode.
pub(crate) fn create_uds() -> io::Result<OwnedFd> {
    #[allow(unused_mut)]
    let mut ty = SOCK_STREAM;
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        ty |= libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC;
    }
    let fd = unsafe { libc::socket(AF_UNIX, ty, 0) }.fd_or_errno()?;
    // SAFETY: we just created this descriptor
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        set_nonblocking(fd.as_fd(), true)?;
        set_cloexec(fd.as_fd())?;
    }
    Ok(fd)
}

/// Creates a connected pair of `SOCK_STREAM` local sockets in nonblocking close-on-exec mode.
pub(crate) fn create_uds_pair() -> io::Result<(OwnedFd, OwnedFd)> {
    #[allow(unused_mut)]
    let mut ty = SOCK_STREAM;
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        ty |= libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC;
    }
    let mut fds: [c_int; 2] = [-1; 2];
    let success = unsafe { libc::socketpair(AF_UNIX, ty, 0, fds.as_mut_ptr()) } != -1;
    let [a, b] = ok_or_errno!(success => fds)?;
    // SAFETY: we just created those descriptors
    let (a, b) = unsafe { (OwnedFd::from_raw_fd(a), OwnedFd::from_raw_fd(b)) };
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    for fd in [a.as_fd(), b.as_fd()] {
        set_nonblocking(fd, true)?;
        set_cloexec(fd)?;
    }
    Ok((a, b))
}

/// Copies the raw address into a properly aligned `sockaddr_un` for the duration of `f`.
fn with_sockaddr<T>(addr: &RawAddress, f: impl FnOnce(*const sockaddr, socklen_t) -> T) -> T {
    let mut sun = unsafe {
        // SAFETY: sockaddr_un is plain old data, i.e. an all-zero pattern is allowed
        zeroed::<sockaddr_un>()
    };
    let bytes = addr.as_bytes();
    // SAFETY: RawAddress never exceeds the size of sockaddr_un
    unsafe {
        ptr::copy_nonoverlapping(bytes.as_ptr(), ptr::addr_of_mut!(sun).cast::<u8>(), bytes.len())
    };
    f(ptr::addr_of!(sun).cast(), addr.socklen())
}

pub(crate) fn bind(fd: BorrowedFd<'_>, addr: &RawAddress) -> io::Result<()> {
    with_sockaddr(addr, |sa, len| unsafe { libc::bind(fd.as_raw_fd(), sa, len) } != -1)
        .true_val_or_errno(())
}

pub(crate) fn connect(fd: BorrowedFd<'_>, addr: &RawAddress) -> io::Result<()> {
    with_sockaddr(addr, |sa, len| unsafe { libc::connect(fd.as_raw_fd(), sa, len) } != -1)
        .true_val_or_errno(())
}

pub(crate) fn listen(fd: BorrowedFd<'_>, backlog: c_int) -> io::Result<()> {
    let success = unsafe { libc::listen(fd.as_raw_fd(), backlog) != -1 };
    ok_or_errno!(success => ())
}

/// Accepts a connection, returning a nonblocking close-on-exec descriptor.
pub(crate) fn accept(fd: BorrowedFd<'_>) -> io::Result<OwnedFd> {
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    let new_fd = unsafe {
        libc::accept4(
            fd.as_raw_fd(),
            ptr::null_mut(),
            ptr::null_mut(),
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };
    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    let new_fd = unsafe { libc::accept(fd.as_raw_fd(), ptr::null_mut(), ptr::null_mut()) };
    let new_fd = new_fd.fd_or_errno()?;
    // SAFETY: we just got this descriptor from the kernel
    let new_fd = unsafe { OwnedFd::from_raw_fd(new_fd) };
    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    {
        set_nonblocking(new_fd.as_fd(), true)?;
        set_cloexec(new_fd.as_fd())?;
    }
    Ok(new_fd)
}

/// Reads the pending error of the socket (`SO_ERROR`), clearing it.
pub(crate) fn take_error(fd: BorrowedFd<'_>) -> io::Result<Option<io::Error>> {
    let mut errno: c_int = 0;
    #[allow(clippy::as_conversions)]
    let mut len = size_of::<c_int>() as socklen_t;
    let success = unsafe {
        libc::getsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            ptr::addr_of_mut!(errno).cast(),
            &mut len,
        )
    } != -1;
    ok_or_errno!(success => (errno != 0).then(|| io::Error::from_raw_os_error(errno)))
}

fn get_name(
    fd: BorrowedFd<'_>,
    f: unsafe extern "C" fn(c_int, *mut sockaddr, *mut socklen_t) -> c_int,
) -> io::Result<Vec<u8>> {
    let mut sun = unsafe {
        // SAFETY: as above
        zeroed::<sockaddr_un>()
    };
    let mut len = SUN_SIZE;
    let success = unsafe { f(fd.as_raw_fd(), ptr::addr_of_mut!(sun).cast(), &mut len) } != -1;
    ok_or_errno!(success => ())?;
    #[allow(clippy::as_conversions)]
    let len = (len as usize).min(size_of::<sockaddr_un>());
    // SAFETY: sockaddr_un is fully initialized, the length is clamped to its size
    let bytes = unsafe { std::slice::from_raw_parts(ptr::addr_of!(sun).cast::<u8>(), len) };
    Ok(bytes.to_vec())
}
/// Raw address the socket is bound to.
pub(crate) fn local_addr(fd: BorrowedFd<'_>) -> io::Result<Vec<u8>> {
    get_name(fd, libc::getsockname)
}
/// Raw address of the peer the socket is connected to.
pub(crate) fn peer_addr(fd: BorrowedFd<'_>) -> io::Result<Vec<u8>> {
    get_name(fd, libc::getpeername)
}

pub(crate) fn set_nonblocking(fd: BorrowedFd<'_>, nonblocking: bool) -> io::Result<()> {
    let old_flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL, 0) }.fd_or_errno()?;
    let new_flags = if nonblocking {
        old_flags | libc::O_NONBLOCK
    } else {
        old_flags & !libc::O_NONBLOCK
    };
    let success = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, new_flags) } != -1;
    ok_or_errno!(success => ())
}
pub(crate) fn get_nonblocking(fd: BorrowedFd<'_>) -> io::Result<bool> {
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL, 0) }.fd_or_errno()?;
    Ok(flags & libc::O_NONBLOCK != 0)
}

#[cfg_attr(all(any(target_os = "linux", target_os = "android"), uds_cmsg_cloexec), allow(dead_code))]
pub(crate) fn set_cloexec(fd: BorrowedFd<'_>) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFD, 0) }.fd_or_errno()?;
    let success =
        unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, flags | libc::FD_CLOEXEC) } != -1;
    ok_or_errno!(success => ())
}

/// Closes the descriptor, reporting the error instead of swallowing it like `OwnedFd`'s drop.
pub(crate) fn close(fd: OwnedFd) -> io::Result<()> {
    use std::os::fd::IntoRawFd;
    let success = unsafe { libc::close(fd.into_raw_fd()) } != -1;
    ok_or_errno!(success => ())
}
