//! The reactor: epoll ownership, event dispatch, timers, and wake-up.
//!
//! One `IoManager` runs one thread's event loop and owns every socket
//! registered with it. Readiness events are delivered edge-triggered;
//! sockets drain until EAGAIN and record what the kernel still has in
//! their `can_read`/`can_write` flags. The only level-triggered
//! registration is the internal loopback UDP control channel used for
//! cross-thread wake-up.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;

use slab::Slab;
use tracing::{debug, trace};

use crate::pollable::{Pollable, Registration, Token};
use crate::state::NetState;
use crate::sys;
use crate::timer::TimerHeap;

/// Events fetched per `epoll_wait`.
const EPOLL_EVENT_CAPACITY: usize = 1024;

/// Default shared scratch buffer size (about 3.3 MiB). One `readv` against a
/// socket buffer plus this scratch empties the kernel in the common case.
const DEFAULT_SCRATCH_CAPACITY: usize = 3_495_200;

/// Size of the wake-up datagram.
const WAKE_DATAGRAM_LEN: usize = 8;

/// Deferred hook invocation, queued when work is already possible without
/// waiting for a new readiness edge.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ReadyKind {
    Read,
    Write,
}

struct RegEntry {
    pollable: Rc<dyn Pollable>,
    generation: u32,
}

/// Reactor state shared between the `IoManager` handle and every socket
/// bound to it.
pub(crate) struct Core {
    epoll_fd: RawFd,
    registry: RefCell<Slab<RegEntry>>,
    next_generation: Cell<u32>,
    scratch: RefCell<Box<[u8]>>,
    timers: RefCell<TimerHeap>,
    ready_queue: RefCell<VecDeque<(Token, ReadyKind)>>,
    ctrl: Rc<ControlChannel>,
}

impl Core {
    /// Assign a registry slot (and token) to a pollable if it has none.
    fn ensure_token(&self, pollable: &Rc<dyn Pollable>) -> Token {
        if let Some(token) = pollable.registration().token.get() {
            return token;
        }
        let generation = self.next_generation.get();
        self.next_generation.set(generation.wrapping_add(1));
        let index = self.registry.borrow_mut().insert(RegEntry {
            pollable: pollable.clone(),
            generation,
        }) as u32;
        let token = Token { index, generation };
        pollable.registration().token.set(Some(token));
        token
    }

    fn lookup(&self, token: Token) -> Option<Rc<dyn Pollable>> {
        let registry = self.registry.borrow();
        let entry = registry.get(token.index as usize)?;
        if entry.generation != token.generation {
            return None;
        }
        Some(entry.pollable.clone())
    }

    pub(crate) fn is_live(&self, token: Token) -> bool {
        self.registry
            .borrow()
            .get(token.index as usize)
            .map_or(false, |e| e.generation == token.generation)
    }

    /// Retire a registration. The fd itself leaves the epoll set when it
    /// is closed.
    pub(crate) fn unregister(&self, token: Token) {
        let mut registry = self.registry.borrow_mut();
        let matches = registry
            .get(token.index as usize)
            .map_or(false, |e| e.generation == token.generation);
        if matches {
            registry.remove(token.index as usize);
        }
    }

    /// Arm edge-triggered read interest. Idempotent; never disarmed
    /// implicitly.
    pub(crate) fn watch_read(&self, pollable: &Rc<dyn Pollable>) {
        let reg = pollable.registration();
        assert!(reg.fd_valid(), "cannot watch a socket without an fd");
        if reg.armed_read.get() {
            return;
        }
        let token = self.ensure_token(pollable);
        let mut interest = (libc::EPOLLIN | libc::EPOLLET) as u32;
        let op = if reg.armed_write.get() {
            interest |= libc::EPOLLOUT as u32;
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        self.epoll_ctl(op, reg.fd.get(), interest, token);
        reg.armed_read.set(true);
    }

    /// Arm edge-triggered write interest. Idempotent.
    pub(crate) fn watch_write(&self, pollable: &Rc<dyn Pollable>) {
        let reg = pollable.registration();
        assert!(reg.fd_valid(), "cannot watch a socket without an fd");
        if reg.armed_write.get() {
            return;
        }
        let token = self.ensure_token(pollable);
        let mut interest = (libc::EPOLLOUT | libc::EPOLLET) as u32;
        let op = if reg.armed_read.get() {
            interest |= libc::EPOLLIN as u32;
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        self.epoll_ctl(op, reg.fd.get(), interest, token);
        reg.armed_write.set(true);
    }

    fn epoll_ctl(&self, op: i32, fd: RawFd, interest: u32, token: Token) {
        let mut event = libc::epoll_event {
            events: interest,
            u64: token.pack(),
        };
        let rc = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut event) };
        assert_eq!(
            rc,
            0,
            "epoll_ctl failed: {}",
            io::Error::last_os_error()
        );
    }

    /// Queue a deferred hook invocation for an already-ready pollable.
    ///
    /// An edge that fired before a callback was installed never re-fires,
    /// so arming against an already-ready fd goes through this queue; the
    /// main loop drains it before blocking.
    pub(crate) fn enqueue_ready(&self, pollable: &Rc<dyn Pollable>, kind: ReadyKind) {
        let token = self.ensure_token(pollable);
        self.ready_queue.borrow_mut().push_back((token, kind));
    }

    pub(crate) fn enqueue_ready_token(&self, token: Token, kind: ReadyKind) {
        self.ready_queue.borrow_mut().push_back((token, kind));
    }

    /// Borrow the shared scratch read buffer for a single `do_read`.
    pub(crate) fn scratch(&self) -> std::cell::RefMut<'_, Box<[u8]>> {
        self.scratch.borrow_mut()
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}

/// Loopback UDP socket used to unblock `epoll_wait` from anywhere.
struct ControlChannel {
    reg: Registration,
    wake: Cell<bool>,
}

impl ControlChannel {
    fn open() -> io::Result<Rc<ControlChannel>> {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        if let Err(e) = sys::set_nonblock_cloexec(fd) {
            unsafe { libc::close(fd) };
            return Err(e);
        }
        let ep = crate::endpoint::Endpoint::new(u32::from_be_bytes([127, 0, 0, 1]), 0);
        let addr = sys::sockaddr_from(&ep);
        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            let e = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(e);
        }
        let reg = Registration::new();
        reg.fd.set(fd);
        Ok(Rc::new(ControlChannel {
            reg,
            wake: Cell::new(false),
        }))
    }

    fn bound_addr(&self) -> io::Result<libc::sockaddr_in> {
        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockname(
                self.reg.fd.get(),
                &mut addr as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(addr)
    }

    /// Send the wake datagram from the control socket to itself.
    fn send_wake(&self) {
        let addr = self.bound_addr().expect("control socket has no name");
        let buf = [0u8; WAKE_DATAGRAM_LEN];
        let sent = unsafe {
            libc::sendto(
                self.reg.fd.get(),
                buf.as_ptr() as *const libc::c_void,
                WAKE_DATAGRAM_LEN,
                0,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        assert_eq!(sent, WAKE_DATAGRAM_LEN as isize, "wake datagram not sent");
    }

    fn take_wake(&self) -> bool {
        self.wake.replace(false)
    }
}

impl Pollable for ControlChannel {
    fn registration(&self) -> &Registration {
        &self.reg
    }

    fn on_read_notify(self: Rc<Self>) {
        // Any datagram here is a wake-up, valid or not. Drain them all.
        let mut buf = [0u8; WAKE_DATAGRAM_LEN];
        loop {
            let rc = unsafe {
                libc::recvfrom(
                    self.reg.fd.get(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    WAKE_DATAGRAM_LEN,
                    0,
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                )
            };
            if rc < 0 {
                break;
            }
        }
        self.wake.set(true);
    }

    fn on_write_notify(self: Rc<Self>) {}

    fn on_exception(self: Rc<Self>, _state: NetState) {
        // The loop must wake regardless of what happened to the channel.
        self.wake.set(true);
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        if self.reg.fd_valid() {
            unsafe {
                libc::close(self.reg.fd.get());
            }
        }
    }
}

/// Cross-thread wake-up handle.
///
/// Owns a private UDP socket aimed at the reactor's control channel, so
/// waking never touches the reactor's own descriptors. Fire-and-forget
/// and idempotent: any number of wakes collapse into one observation.
pub struct Waker {
    fd: RawFd,
    target: libc::sockaddr_in,
}

impl Waker {
    /// Unblock the reactor's current (or next) readiness wait.
    pub fn wake(&self) {
        let buf = [0u8; WAKE_DATAGRAM_LEN];
        unsafe {
            // Best effort: the reactor may already be gone.
            libc::sendto(
                self.fd,
                buf.as_ptr() as *const libc::c_void,
                WAKE_DATAGRAM_LEN,
                0,
                &self.target as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            );
        }
    }
}

impl Drop for Waker {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// The event loop: owns the readiness facility, the control channel, the
/// shared scratch buffer, and the timer queue.
pub struct IoManager {
    core: Rc<Core>,
}

impl IoManager {
    /// Create a reactor with the default scratch buffer size.
    pub fn new() -> io::Result<IoManager> {
        IoManager::with_scratch_capacity(DEFAULT_SCRATCH_CAPACITY)
    }

    /// Create a reactor with an explicit scratch buffer size (0 selects
    /// the default).
    pub fn with_scratch_capacity(capacity: usize) -> io::Result<IoManager> {
        let capacity = if capacity == 0 {
            DEFAULT_SCRATCH_CAPACITY
        } else {
            capacity
        };
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let ctrl = match ControlChannel::open() {
            Ok(ctrl) => ctrl,
            Err(e) => {
                unsafe { libc::close(epoll_fd) };
                return Err(e);
            }
        };
        let core = Rc::new(Core {
            epoll_fd,
            registry: RefCell::new(Slab::new()),
            next_generation: Cell::new(1),
            scratch: RefCell::new(vec![0u8; capacity].into_boxed_slice()),
            timers: RefCell::new(TimerHeap::new()),
            ready_queue: RefCell::new(VecDeque::new()),
            ctrl: ctrl.clone(),
        });

        // The control channel is the one level-triggered registration:
        // a wake datagram must be seen even if the loop missed an edge.
        let pollable: Rc<dyn Pollable> = ctrl;
        let token = core.ensure_token(&pollable);
        core.epoll_ctl(
            libc::EPOLL_CTL_ADD,
            pollable.registration().fd.get(),
            libc::EPOLLIN as u32,
            token,
        );
        pollable.registration().armed_read.set(true);

        Ok(IoManager { core })
    }

    pub(crate) fn core(&self) -> &Rc<Core> {
        &self.core
    }

    /// Unblock the loop from the reactor thread itself.
    ///
    /// Sends a datagram from the control socket to its own bound address;
    /// the loop observes the wake flag after the current dispatch batch
    /// and returns OK.
    pub fn interrupt(&self) {
        self.core.ctrl.send_wake();
    }

    /// Create a [`Waker`] that can interrupt this reactor from other
    /// threads.
    pub fn waker(&self) -> io::Result<Waker> {
        let target = self.core.ctrl.bound_addr()?;
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Waker { fd, target })
    }

    /// Run `callback` roughly `ms` milliseconds from now, from inside the
    /// main loop. The callback receives its remaining milliseconds at
    /// fire time.
    pub fn schedule_timeout<F>(&self, ms: i64, callback: F)
    where
        F: FnOnce(i64) + 'static,
    {
        self.core.timers.borrow_mut().push(ms, Box::new(callback));
    }

    /// Block on readiness, dispatch events and timers, and return when a
    /// wake-up is observed (OK) or the wait fails (system error).
    pub fn run_main_loop(&self) -> NetState {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; EPOLL_EVENT_CAPACITY];
        let mut prev_time = sys::now_ms();
        loop {
            self.drain_ready_queue();

            let timeout: i32 = match self.core.timers.borrow().front_remaining() {
                None => -1,
                Some(ms) => ms.clamp(0, i64::from(i32::MAX)) as i32,
            };

            let count = loop {
                let rc = unsafe {
                    libc::epoll_wait(
                        self.core.epoll_fd,
                        events.as_mut_ptr(),
                        events.len() as i32,
                        timeout,
                    )
                };
                if rc >= 0 {
                    break rc as usize;
                }
                let err = sys::errno();
                if err != libc::EINTR {
                    return NetState::system(err);
                }
                // Interrupted: wait again without recomputing the timeout.
            };

            self.dispatch(&events[..count]);
            prev_time = self.update_timers(count, prev_time);

            if self.core.ctrl.take_wake() {
                debug!("wake-up observed, leaving main loop");
                return NetState::ok();
            }
        }
    }

    /// Invoke hooks deferred by `enqueue_ready` until the queue is empty.
    fn drain_ready_queue(&self) {
        loop {
            let item = self.core.ready_queue.borrow_mut().pop_front();
            let (token, kind) = match item {
                Some(item) => item,
                None => break,
            };
            let pollable = match self.core.lookup(token) {
                Some(p) => p,
                None => continue, // retired before its turn
            };
            trace!(?kind, index = token.index, "draining deferred readiness");
            match kind {
                ReadyKind::Read => pollable.on_read_notify(),
                ReadyKind::Write => pollable.on_write_notify(),
            }
        }
    }

    fn dispatch(&self, events: &[libc::epoll_event]) {
        for raw in events {
            let bits_all = raw.events;
            let token = Token::unpack(raw.u64);
            let pollable = match self.core.lookup(token) {
                Some(p) => p,
                None => continue, // freed between wait and dispatch
            };
            let mut bits = bits_all;

            if bits & libc::EPOLLERR as u32 != 0 {
                let code = sys::socket_error(pollable.registration().fd.get());
                if code != 0 {
                    trace!(index = token.index, code, "socket error condition");
                    pollable.on_exception(NetState::system(code));
                    continue;
                }
                bits &= !(libc::EPOLLERR as u32);
            }

            if bits_all & libc::EPOLLHUP as u32 != 0 {
                // Funnel hang-up through the read path so the EOF is
                // observed there.
                pollable.on_read_notify();
                continue;
            }

            if bits_all & libc::EPOLLIN as u32 != 0 {
                pollable.clone().on_read_notify();
                bits &= !(libc::EPOLLIN as u32);
            }

            if bits_all & libc::EPOLLOUT as u32 != 0 {
                // The read hook may have destroyed the pollable.
                if self.core.is_live(token) {
                    pollable.clone().on_write_notify();
                }
                bits &= !(libc::EPOLLOUT as u32);
            }

            debug_assert_eq!(
                bits & !(libc::EPOLLHUP as u32 | libc::EPOLLRDHUP as u32),
                0,
                "unhandled readiness bits {bits:#x}"
            );
        }
    }

    /// Advance the timer queue after a dispatch pass and return the new
    /// reference time.
    ///
    /// A zero-event wake means the wait timed out: the front entry is due,
    /// and every entry within the coalescing slack of it fires in heap
    /// order. A non-zero wake just ages all entries by the elapsed delta.
    /// With an empty queue this only refreshes the reference time.
    fn update_timers(&self, event_count: usize, prev_time: u64) -> u64 {
        if self.core.timers.borrow().is_empty() {
            return sys::now_ms();
        }
        if event_count == 0 {
            let fired = self.core.timers.borrow_mut().pop_due();
            for entry in fired {
                let remaining = entry.remaining_ms;
                (entry.callback)(remaining);
            }
            sys::now_ms()
        } else {
            let now = sys::now_ms();
            let delta = now.saturating_sub(prev_time) as i64;
            self.core.timers.borrow_mut().decrement_all(delta);
            now
        }
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        // Drop every registration (closing socket fds through their
        // owners) and free pending timer callbacks.
        self.core.registry.borrow_mut().clear();
        self.core.timers.borrow_mut().clear();
        self.core.ready_queue.borrow_mut().clear();
    }
}
