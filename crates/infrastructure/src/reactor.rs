//! Single-threaded readiness reactor on top of `poll(2)`.
//!
//! Interest is registered per handle and direction. Read and write
//! registrations may carry an absolute deadline; when it passes without the
//! matching readiness the registration is dropped and the handle's exception
//! callback is invoked instead, so a stalled operation and an OS-level error
//! end up on the same failure path.
//!
//! `Reactor` is a cheap handle: clones share one registration table. Nothing
//! in here is `Send`; every callback runs on the thread inside [`Reactor::run`].

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Handler invoked with the handle that became ready.
pub type Callback = Rc<dyn Fn(RawFd)>;

const READ_EVENTS: libc::c_short = libc::POLLIN;
const WRITE_EVENTS: libc::c_short = libc::POLLOUT;
const EXCEPTION_EVENTS: libc::c_short = libc::POLLPRI;
const ERROR_EVENTS: libc::c_short = libc::POLLERR | libc::POLLNVAL | libc::POLLPRI;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Direction {
    Read,
    Write,
}

impl Direction {
    fn events(self) -> libc::c_short {
        match self {
            Self::Read => READ_EVENTS,
            Self::Write => WRITE_EVENTS,
        }
    }
}

/// Which kinds of interest are registered for a handle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
    pub exception: bool,
}

impl Interest {
    pub fn is_empty(&self) -> bool {
        !(self.read || self.write || self.exception)
    }
}

struct Timed {
    callback: Callback,
    deadline: Option<Instant>,
}

/// The `pollfd` array handed to the kernel; only tracked handles appear.
#[derive(Default)]
struct PollSet {
    fds: Vec<libc::pollfd>,
}

impl PollSet {
    fn register(&mut self, fd: RawFd, events: libc::c_short) {
        match self.fds.iter_mut().find(|p| p.fd == fd) {
            Some(entry) => entry.events |= events,
            None => self.fds.push(libc::pollfd {
                fd,
                events,
                revents: 0,
            }),
        }
    }

    fn deregister(&mut self, fd: RawFd, events: libc::c_short) {
        if let Some(entry) = self.fds.iter_mut().find(|p| p.fd == fd) {
            entry.events &= !events;
        }
    }

    fn remove(&mut self, fd: RawFd) {
        self.fds.retain(|p| p.fd != fd);
    }

    fn contains(&self, fd: RawFd) -> bool {
        self.fds.iter().any(|p| p.fd == fd)
    }
}

#[derive(Default)]
struct Registrations {
    reads: BTreeMap<RawFd, Timed>,
    writes: BTreeMap<RawFd, Timed>,
    exceptions: BTreeMap<RawFd, Callback>,
    poll_set: PollSet,
}

impl Registrations {
    fn timed(&mut self, direction: Direction) -> &mut BTreeMap<RawFd, Timed> {
        match direction {
            Direction::Read => &mut self.reads,
            Direction::Write => &mut self.writes,
        }
    }

    fn register_timed(
        &mut self,
        direction: Direction,
        fd: RawFd,
        callback: Callback,
        deadline: Option<Instant>,
    ) -> bool {
        let map = self.timed(direction);
        if map.contains_key(&fd) {
            return false;
        }
        map.insert(fd, Timed { callback, deadline });
        self.poll_set.register(fd, direction.events());
        true
    }

    fn remove_timed(&mut self, direction: Direction, fd: RawFd) -> bool {
        let removed = self.timed(direction).remove(&fd).is_some();
        if removed {
            self.poll_set.deregister(fd, direction.events());
            self.clean(fd);
        }
        removed
    }

    /// Drop `fd` from the poll set once nothing is registered for it.
    fn clean(&mut self, fd: RawFd) {
        if !self.reads.contains_key(&fd)
            && !self.writes.contains_key(&fd)
            && !self.exceptions.contains_key(&fd)
        {
            self.poll_set.remove(fd);
        }
    }

    fn earliest_deadline(&self) -> Option<Instant> {
        self.reads
            .values()
            .chain(self.writes.values())
            .filter_map(|t| t.deadline)
            .min()
    }
}

#[derive(Clone, Default)]
pub struct Reactor {
    inner: Rc<RefCell<Registrations>>,
}

impl Reactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register for read readiness. Returns false, leaving the existing
    /// registration untouched, if `fd` already has one.
    pub fn register_read<F>(&self, fd: RawFd, callback: F, deadline: Option<Instant>) -> bool
    where
        F: Fn(RawFd) + 'static,
    {
        self.inner
            .borrow_mut()
            .register_timed(Direction::Read, fd, Rc::new(callback), deadline)
    }

    /// Register for write readiness. Same semantics as [`Self::register_read`].
    pub fn register_write<F>(&self, fd: RawFd, callback: F, deadline: Option<Instant>) -> bool
    where
        F: Fn(RawFd) + 'static,
    {
        self.inner
            .borrow_mut()
            .register_timed(Direction::Write, fd, Rc::new(callback), deadline)
    }

    /// Register the handler for errors, hang-ups and expired deadlines.
    pub fn register_exception<F>(&self, fd: RawFd, callback: F) -> bool
    where
        F: Fn(RawFd) + 'static,
    {
        let mut inner = self.inner.borrow_mut();
        if inner.exceptions.contains_key(&fd) {
            return false;
        }
        inner.exceptions.insert(fd, Rc::new(callback));
        inner.poll_set.register(fd, EXCEPTION_EVENTS);
        true
    }

    pub fn remove_read(&self, fd: RawFd) {
        self.inner.borrow_mut().remove_timed(Direction::Read, fd);
    }

    pub fn remove_write(&self, fd: RawFd) {
        self.inner.borrow_mut().remove_timed(Direction::Write, fd);
    }

    pub fn remove_exception(&self, fd: RawFd) {
        let mut inner = self.inner.borrow_mut();
        if inner.exceptions.remove(&fd).is_some() {
            inner.poll_set.deregister(fd, EXCEPTION_EVENTS);
            inner.clean(fd);
        }
    }

    /// Drop every registration for `fd`.
    pub fn remove_all(&self, fd: RawFd) {
        self.remove_read(fd);
        self.remove_write(fd);
        self.remove_exception(fd);
    }

    pub fn interest(&self, fd: RawFd) -> Interest {
        let inner = self.inner.borrow();
        Interest {
            read: inner.reads.contains_key(&fd),
            write: inner.writes.contains_key(&fd),
            exception: inner.exceptions.contains_key(&fd),
        }
    }

    /// True if `fd` is part of the underlying poll set.
    pub fn is_tracked(&self, fd: RawFd) -> bool {
        self.inner.borrow().poll_set.contains(fd)
    }

    /// Number of handles in the poll set.
    pub fn handles(&self) -> usize {
        self.inner.borrow().poll_set.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles() == 0
    }

    /// Dispatch events until no handle is registered any more.
    ///
    /// Only a failure of the polling primitive itself is returned; errors on
    /// individual handles are reported through their exception callbacks.
    pub fn run(&self) -> io::Result<()> {
        debug!("Reactor running");
        while !self.is_empty() {
            self.turn(None)?;
        }
        debug!("Reactor has no registrations left, stopping");
        Ok(())
    }

    /// One poll and dispatch cycle. Waits at most `max_wait` (or until the
    /// earliest deadline) and returns the number of callbacks invoked.
    pub fn turn(&self, max_wait: Option<Duration>) -> io::Result<usize> {
        let now = Instant::now();
        let (mut fds, timeout) = {
            let inner = self.inner.borrow();
            if inner.poll_set.fds.is_empty() {
                return Ok(0);
            }
            let until_deadline = inner
                .earliest_deadline()
                .map(|d| d.saturating_duration_since(now));
            let wait = match (until_deadline, max_wait) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            (inner.poll_set.fds.clone(), poll_timeout_ms(wait))
        };

        let ready = poll(&mut fds, timeout)?;
        trace!(handles = fds.len(), ready, timeout_ms = timeout, "poll returned");

        let mut fired = BTreeSet::new();
        let mut dispatched = 0;
        if ready > 0 {
            for pfd in fds.iter().filter(|p| p.revents != 0) {
                dispatched += self.dispatch_ready(pfd.fd, pfd.revents, &mut fired);
            }
        }
        dispatched += self.expire(Instant::now(), &fired);
        Ok(dispatched)
    }

    fn dispatch_ready(
        &self,
        fd: RawFd,
        revents: libc::c_short,
        fired: &mut BTreeSet<(RawFd, Direction)>,
    ) -> usize {
        let mut dispatched = 0;

        if revents & ERROR_EVENTS != 0 {
            fired.insert((fd, Direction::Read));
            fired.insert((fd, Direction::Write));
            if let Some(callback) = self.exception_callback(fd) {
                callback(fd);
                return 1;
            }
        }

        let hangup = revents & libc::POLLHUP != 0;
        if revents & (READ_EVENTS | ERROR_EVENTS) != 0 || hangup {
            if let Some(callback) = self.timed_callback(Direction::Read, fd) {
                fired.insert((fd, Direction::Read));
                callback(fd);
                dispatched += 1;
            } else if hangup {
                if let Some(callback) = self.exception_callback(fd) {
                    callback(fd);
                    return dispatched + 1;
                }
            }
        }

        if revents & (WRITE_EVENTS | ERROR_EVENTS) != 0 {
            if let Some(callback) = self.timed_callback(Direction::Write, fd) {
                fired.insert((fd, Direction::Write));
                callback(fd);
                dispatched += 1;
            }
        }

        dispatched
    }

    /// Clear read/write registrations whose deadline has passed and raise
    /// one exception per affected handle.
    fn expire(&self, now: Instant, fired: &BTreeSet<(RawFd, Direction)>) -> usize {
        let expired: BTreeSet<RawFd> = {
            let mut inner = self.inner.borrow_mut();
            let mut expired = BTreeSet::new();
            for direction in [Direction::Read, Direction::Write] {
                let due: Vec<RawFd> = inner
                    .timed(direction)
                    .iter()
                    .filter(|(fd, t)| {
                        t.deadline.is_some_and(|d| d <= now) && !fired.contains(&(**fd, direction))
                    })
                    .map(|(fd, _)| *fd)
                    .collect();
                for fd in due {
                    inner.remove_timed(direction, fd);
                    expired.insert(fd);
                }
            }
            expired
        };

        let mut dispatched = 0;
        for fd in expired {
            match self.exception_callback(fd) {
                Some(callback) => {
                    debug!(fd, "Deadline expired");
                    callback(fd);
                    dispatched += 1;
                }
                None => debug!(fd, "Deadline expired without an exception handler"),
            }
        }
        dispatched
    }

    fn timed_callback(&self, direction: Direction, fd: RawFd) -> Option<Callback> {
        self.inner
            .borrow_mut()
            .timed(direction)
            .get(&fd)
            .map(|t| Rc::clone(&t.callback))
    }

    fn exception_callback(&self, fd: RawFd) -> Option<Callback> {
        self.inner.borrow().exceptions.get(&fd).map(Rc::clone)
    }
}

/// Milliseconds for `poll(2)`, rounded up so a pending deadline is never
/// polled for with a zero timeout in a busy loop. `None` blocks.
fn poll_timeout_ms(wait: Option<Duration>) -> libc::c_int {
    match wait {
        None => -1,
        Some(wait) => {
            let millis = wait.as_nanos().div_ceil(1_000_000);
            libc::c_int::try_from(millis).unwrap_or(libc::c_int::MAX)
        }
    }
}

fn poll(fds: &mut [libc::pollfd], timeout: libc::c_int) -> io::Result<usize> {
    // SAFETY: `fds` is a valid, exclusively borrowed slice of pollfd structs
    // and its length is passed alongside the pointer.
    let result = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout) };
    if result < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(0);
        }
        return Err(err);
    }
    Ok(result as usize)
}
