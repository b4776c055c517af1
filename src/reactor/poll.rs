//! [`PollReactor`], a single-threaded [`Reactor`] on top of the `polling` crate.

use {
    super::{Interest, ReadyCallback, Readiness, Reactor, Registration, Timer, TimerCallback},
    crate::busy_error,
    polling::{Event, Events, Poller},
    std::{
        cell::{Cell, RefCell},
        collections::{BTreeMap, HashMap},
        fmt::{self, Debug, Formatter},
        io,
        os::fd::{AsRawFd, BorrowedFd, RawFd},
        time::{Duration, Instant},
    },
    tracing::trace,
};

struct Waiter {
    id: u64,
    deadline: Option<Instant>,
    callback: ReadyCallback,
}

#[derive(Default)]
struct Entry {
    waiters: [Option<Waiter>; 2],
    in_poller: bool,
}
impl Entry {
    fn is_empty(&self) -> bool { self.waiters.iter().all(Option::is_none) }
    fn event(&self, key: usize) -> Event {
        let [read, write] = &self.waiters;
        match (read.is_some(), write.is_some()) {
            (true, true) => Event::all(key),
            (true, false) => Event::readable(key),
            (false, true) => Event::writable(key),
            (false, false) => Event::none(key),
        }
    }
    fn take(&mut self, interest: Interest) -> Option<Waiter> {
        self.waiters.get_mut(interest.index()).and_then(Option::take)
    }
}

/// A single-threaded, callback-dispatching readiness reactor.
///
/// Registrations are kept in a table keyed by descriptor and interest, with the union of the
/// interests of each descriptor armed in a [`Poller`] in oneshot mode. Dispatch happens in
/// [`turn`](Self::turn), which is meant to be called in a loop by the owner of the reactor; the
/// [`run`](Self::run) and [`run_until`](Self::run_until) helpers do exactly that.
///
/// Timers are kept in a separate table ordered by deadline.
///
/// Within one turn, elapsed timeouts and timers are dispatched before readiness, so a
/// registration with a zero timeout always times out.
pub struct PollReactor {
    poller: Poller,
    events: RefCell<Events>,
    entries: RefCell<HashMap<RawFd, Entry>>,
    timers: RefCell<BTreeMap<Timer, TimerCallback>>,
    next_id: Cell<u64>,
}
impl PollReactor {
    /// Creates a reactor with no registrations.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poller: Poller::new()?,
            events: RefCell::new(Events::new()),
            entries: RefCell::new(HashMap::new()),
            timers: RefCell::new(BTreeMap::new()),
            next_id: Cell::new(0),
        })
    }

    /// Whether there are no outstanding registrations or timers.
    pub fn is_idle(&self) -> bool {
        self.entries.borrow().is_empty() && self.timers.borrow().is_empty()
    }
    /// Number of outstanding registrations, timers included.
    pub fn num_registrations(&self) -> usize {
        let waiters: usize = self
            .entries
            .borrow()
            .values()
            .map(|e| e.waiters.iter().filter(|w| w.is_some()).count())
            .sum();
        waiters + self.timers.borrow().len()
    }

    fn next_id(&self) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id.wrapping_add(1));
        id
    }

    /// Waits for readiness or the nearest timeout, for no longer than `max_wait` (`None` meaning
    /// no limit), and invokes the callbacks of every registration that fired. Returns how many
    /// callbacks were invoked.
    pub fn turn(&self, max_wait: Option<Duration>) -> io::Result<usize> {
        let wait = {
            let now = Instant::now();
            let nearest_timer = self.timers.borrow().keys().next().map(Timer::deadline);
            let nearest = self
                .entries
                .borrow()
                .values()
                .flat_map(|e| e.waiters.iter().flatten())
                .filter_map(|w| w.deadline)
                .chain(nearest_timer)
                .min()
                .map(|d| d.saturating_duration_since(now));
            match (nearest, max_wait) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            }
        };

        let mut events = self.events.borrow_mut();
        events.clear();
        match self.poller.wait(&mut events, wait) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }

        let now = Instant::now();
        let mut expired = Vec::new();
        {
            let mut timers = self.timers.borrow_mut();
            while let Some(entry) = timers.first_entry() {
                if entry.key().deadline > now {
                    break;
                }
                expired.push(entry.remove());
            }
        }
        let mut fired = Vec::new();
        let mut touched = Vec::new();
        {
            let mut entries = self.entries.borrow_mut();
            for (&fd, entry) in entries.iter_mut() {
                for slot in &mut entry.waiters {
                    if slot.as_ref().and_then(|w| w.deadline).is_some_and(|d| d <= now) {
                        if let Some(w) = slot.take() {
                            fired.push((fd, Readiness::TimedOut, w.callback));
                            touched.push(fd);
                        }
                    }
                }
            }
            for ev in events.iter() {
                let Ok(fd) = RawFd::try_from(ev.key) else { continue };
                let Some(entry) = entries.get_mut(&fd) else { continue };
                // Oneshot mode disarmed the descriptor entirely, so it needs rearming even if
                // the waiter that's left is for the other direction.
                touched.push(fd);
                for (ready, interest) in [(ev.readable, Interest::Read), (ev.writable, Interest::Write)]
                {
                    if !ready {
                        continue;
                    }
                    if let Some(w) = entry.take(interest) {
                        fired.push((fd, Readiness::Ready, w.callback));
                    }
                }
            }
            touched.sort_unstable();
            touched.dedup();
            for fd in touched {
                self.sync(&mut entries, fd)?;
            }
        }
        drop(events);

        let num_fired = expired.len() + fired.len();
        if num_fired != 0 {
            trace!(num_fired, "dispatching reactor callbacks");
        }
        for callback in expired {
            callback();
        }
        for (fd, readiness, callback) in fired {
            callback(fd, readiness);
        }
        Ok(num_fired)
    }

    /// Turns until there are no registrations or timers left.
    pub fn run(&self) -> io::Result<()> {
        while !self.is_idle() {
            self.turn(None)?;
        }
        Ok(())
    }

    /// Turns until `done` returns `true`. Fails with [`WouldBlock`](io::ErrorKind::WouldBlock)
    /// if the reactor runs out of registrations first, since nothing could ever change the
    /// outcome of `done` after that.
    pub fn run_until(&self, mut done: impl FnMut() -> bool) -> io::Result<()> {
        loop {
            if done() {
                return Ok(());
            }
            if self.is_idle() {
                return Err(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    "reactor ran out of registrations before the condition was met",
                ));
            }
            self.turn(None)?;
        }
    }

    /// Brings the poller in line with the table entry of `fd`, removing the entry and the
    /// descriptor from the poller if nothing is waiting on it anymore.
    #[allow(clippy::as_conversions, clippy::cast_sign_loss)]
    fn sync(&self, entries: &mut HashMap<RawFd, Entry>, fd: RawFd) -> io::Result<()> {
        let Some(entry) = entries.get_mut(&fd) else { return Ok(()) };
        // SAFETY: descriptors must stay open for as long as they have registrations, which is
        // the case here since the entry is still there
        let bfd = unsafe { BorrowedFd::borrow_raw(fd) };
        if entry.is_empty() {
            if entry.in_poller {
                if let Err(e) = self.poller.delete(bfd) {
                    trace!(fd, error = %e, "failed to remove descriptor from poller");
                }
            }
            entries.remove(&fd);
            return Ok(());
        }
        let event = entry.event(fd as usize);
        if entry.in_poller {
            self.poller.modify(bfd, event)
        } else {
            // SAFETY: same as above, and the entry is removed before the descriptor is closed
            unsafe { self.poller.add(fd, event)? };
            entry.in_poller = true;
            Ok(())
        }
    }
}

impl Reactor for PollReactor {
    fn register(
        &self,
        fd: BorrowedFd<'_>,
        interest: Interest,
        timeout: Option<Duration>,
        callback: ReadyCallback,
    ) -> io::Result<Registration> {
        let raw = fd.as_raw_fd();
        let id = self.next_id();
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));

        let mut entries = self.entries.borrow_mut();
        let entry = entries.entry(raw).or_default();
        let Some(slot) = entry.waiters.get_mut(interest.index()) else { unreachable!() };
        if slot.is_some() {
            return Err(busy_error());
        }
        *slot = Some(Waiter { id, deadline, callback });
        if let Err(e) = self.sync(&mut entries, raw) {
            if let Some(entry) = entries.get_mut(&raw) {
                entry.take(interest);
            }
            // Leaves the poller as it was, or removes the entry if it's now empty
            if let Err(rollback) = self.sync(&mut entries, raw) {
                trace!(fd = raw, error = %rollback, "failed to roll back poller");
            }
            return Err(e);
        }
        trace!(fd = raw, ?interest, ?timeout, id, "registered");
        Ok(Registration::new(raw, interest, id))
    }

    fn deregister(&self, registration: Registration) -> bool {
        let mut entries = self.entries.borrow_mut();
        let Some(entry) = entries.get_mut(&registration.fd) else { return false };
        let Some(slot) = entry.waiters.get_mut(registration.interest.index()) else {
            return false;
        };
        if slot.as_ref().map(|w| w.id) != Some(registration.id) {
            return false;
        }
        let waiter = slot.take();
        if let Err(e) = self.sync(&mut entries, registration.fd) {
            trace!(?registration, error = %e, "failed to update poller after deregistration");
        }
        drop(entries);
        // Dropped outside of the borrow, since it may own things that deregister on drop
        drop(waiter);
        trace!(?registration, "deregistered");
        true
    }

    fn schedule(&self, delay: Duration, callback: TimerCallback) -> io::Result<Timer> {
        let Some(deadline) = Instant::now().checked_add(delay) else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "timer delay out of range"));
        };
        let timer = Timer::new(deadline, self.next_id());
        self.timers.borrow_mut().insert(timer, callback);
        trace!(?timer, ?delay, "timer scheduled");
        Ok(timer)
    }

    fn cancel_timer(&self, timer: Timer) -> bool {
        let callback = self.timers.borrow_mut().remove(&timer);
        // Dropped outside of the borrow, like deregistered callbacks
        callback.is_some()
    }
}

impl Debug for PollReactor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollReactor")
            .field("num_registrations", &self.num_registrations())
            .finish_non_exhaustive()
    }
}
