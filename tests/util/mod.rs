//! Test utilities for binding listeners at fresh paths, driving the reactor and collecting
//! callback results.
#![allow(dead_code, unused_macros)]

#[macro_use]
mod eyre;
#[macro_use]
mod namegen;
mod xorshift;

#[allow(unused_imports)]
pub use {eyre::*, namegen::*, xorshift::*};

use {
    crate::{addr, c_wrappers, Endpoint, PollReactor, Reactor},
    color_eyre::eyre::{bail, ensure},
    std::{
        cell::RefCell,
        fs::File,
        io,
        os::{
            fd::{AsFd, FromRawFd, OwnedFd},
            unix::fs::MetadataExt,
        },
        path::{Path, PathBuf},
        rc::Rc,
        time::{Duration, Instant},
    },
    tracing_subscriber::EnvFilter,
};

fn intvar(nam: &str) -> Option<u32> {
    let val = std::env::var(nam).ok()?;
    val.trim().parse().ok()
}
/// How many times the tests that loop do so.
pub fn num_iterations() -> u32 { intvar("FDPASS_TEST_ITERATIONS").filter(|n| *n > 0).unwrap_or(4) }

pub fn test_wrapper(f: impl FnOnce() -> TestResult) -> TestResult {
    testinit();
    f()
}

/// Installs the error report hook and the log subscriber, which prints to the test harness.
pub fn testinit() {
    eyre::install();
    // Fails if another test got there first, which is fine
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Creates a reactor, returning both the concrete handle used to drive it and the one endpoints
/// take.
pub fn new_reactor() -> TestResult<(Rc<PollReactor>, Rc<dyn Reactor>)> {
    let reactor = Rc::new(PollReactor::new().opname("reactor creation")?);
    let dyn_reactor: Rc<dyn Reactor> = reactor.clone();
    Ok((reactor, dyn_reactor))
}

const DRIVE_LIMIT: Duration = Duration::from_secs(10);

/// Turns the reactor until `done` holds. Fails if the reactor runs out of registrations first or
/// if that takes unreasonably long.
pub fn drive_until(reactor: &PollReactor, mut done: impl FnMut() -> bool) -> TestResult {
    let deadline = Instant::now() + DRIVE_LIMIT;
    while !done() {
        if reactor.is_idle() {
            bail!("reactor ran out of registrations before the condition was met");
        }
        let now = Instant::now();
        if now >= deadline {
            bail!("condition not met within {DRIVE_LIMIT:?}");
        }
        reactor.turn(Some(deadline - now)).opname("reactor turn")?;
    }
    Ok(())
}

/// Receives the single value a callback is invoked with.
pub struct Slot<T>(Rc<RefCell<Option<T>>>);
impl<T: 'static> Slot<T> {
    pub fn new() -> Self { Self(Rc::new(RefCell::new(None))) }
    /// A callback that fills the slot.
    pub fn setter(&self) -> impl FnOnce(T) + 'static {
        let inner = Rc::clone(&self.0);
        move |val| *inner.borrow_mut() = Some(val)
    }
    pub fn is_set(&self) -> bool { self.0.borrow().is_some() }
    pub fn take(&self) -> TestResult<T> {
        match self.0.borrow_mut().take() {
            Some(val) => Ok(val),
            None => bail!("callback was not invoked"),
        }
    }
}
impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self { Self(Rc::clone(&self.0)) }
}

/// Removes the socket file when dropped.
#[derive(Debug)]
pub struct SocketFile(PathBuf);
impl SocketFile {
    pub fn new(path: PathBuf) -> Self { Self(path) }
    pub fn path(&self) -> &Path { &self.0 }
}
impl Drop for SocketFile {
    fn drop(&mut self) { let _ = std::fs::remove_file(&self.0); }
}

/// Binds a listener to the first free path the generator comes up with.
pub fn listen_at_fresh_path(
    reactor: &Rc<dyn Reactor>,
    namegen: &mut NameGen,
    backlog: i32,
) -> TestResult<(SocketFile, Endpoint)> {
    use io::ErrorKind::*;
    for path in namegen {
        let listener = Endpoint::create(Rc::clone(reactor)).opname("listener creation")?;
        match listener.bind(&path) {
            Ok(()) => {}
            Err(e) if matches!(e.io_kind(), AddrInUse | PermissionDenied) => {
                eprintln!("\"{}\", skipping", e.io_kind());
                continue;
            }
            Err(e) => return Err(e).opname("bind"),
        }
        let file = SocketFile(path);
        listener.listen(backlog).opname("listen")?;
        return Ok((file, listener));
    }
    unreachable!("name generator is infinite")
}

/// Connects to the listener at `path` until its backlog is full, returning the connections that
/// made it in. The listener should have been given a small backlog.
pub fn fill_backlog(path: &Path) -> TestResult<Vec<OwnedFd>> {
    let raw = addr::encode(path).opname("address encoding")?;
    let mut fillers = Vec::new();
    loop {
        ensure!(fillers.len() <= 64, "backlog never filled up");
        let fd = c_wrappers::create_uds().opname("socket creation")?;
        match c_wrappers::connect(fd.as_fd(), &raw) {
            Ok(()) => fillers.push(fd),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(fillers),
            Err(e) => return Err(e).opname("filler connect"),
        }
    }
}

/// Accepts as many connections as there are `fillers`, making room in the backlog.
pub fn drain_backlog(listener: &Endpoint, fillers: &[OwnedFd]) -> TestResult {
    for i in 0..fillers.len() {
        ensure!(listener.accept().opname("accept")?.is_some(), "filler #{i} not in the backlog");
    }
    Ok(())
}

pub fn pipe() -> TestResult<(OwnedFd, OwnedFd)> {
    let mut fds = [-1; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
        return Err(io::Error::last_os_error()).opname("pipe creation");
    }
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Device and inode numbers, which identify the open file behind a descriptor.
pub fn file_identity(fd: impl AsFd) -> TestResult<(u64, u64)> {
    let file = File::from(fd.as_fd().try_clone_to_owned().opname("descriptor duplication")?);
    let meta = file.metadata().opname("fstat")?;
    Ok((meta.dev(), meta.ino()))
}
