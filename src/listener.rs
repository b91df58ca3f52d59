//! Listening sockets and file-descriptor-exhaustion recovery.

use std::cell::{Cell, RefCell};
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;

use tracing::{debug, warn};

use crate::callback::{AcceptCallback, CallbackSlot};
use crate::endpoint::Endpoint;
use crate::pollable::{Pollable, Registration};
use crate::reactor::{Core, IoManager, ReadyKind};
use crate::socket::Socket;
use crate::state::NetState;
use crate::sys;

fn open_dev_null() -> RawFd {
    unsafe { libc::open(c"/dev/null".as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) }
}

pub(crate) struct ListenerShared {
    core: Rc<Core>,
    reg: Registration,
    /// Reserve descriptor sacrificed to drain the backlog under
    /// EMFILE/ENFILE, then reopened.
    dummy_fd: Cell<RawFd>,
    bound: Cell<bool>,
    accept_cb: CallbackSlot<AcceptCallback>,
    /// User-provided socket the next accepted fd is transferred into.
    slot: RefCell<Option<Socket>>,
}

impl ListenerShared {
    /// Accept until EAGAIN, handing back the first new fd.
    ///
    /// Returns -1 with an OK state when the backlog is drained, -1 with
    /// an error state otherwise.
    fn do_accept(&self, state: &mut NetState) -> RawFd {
        debug_assert!(self.reg.can_read.get());
        loop {
            let fd = unsafe {
                libc::accept4(
                    self.reg.fd.get(),
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if fd >= 0 {
                return fd;
            }
            let err = sys::errno();
            if err == libc::EAGAIN || err == libc::EWOULDBLOCK {
                self.reg.can_read.set(false);
                return -1;
            }
            if err == libc::EINTR {
                continue;
            }
            let drained = self.handle_fd_exhaustion(err);
            if drained {
                self.reg.can_read.set(false);
            }
            *state = NetState::system(err);
            return -1;
        }
    }

    /// EMFILE/ENFILE recovery: close the reserve fd, accept-and-close one
    /// pending connection so the client sees a reset instead of hanging
    /// in the backlog, then reopen the reserve. Without this an
    /// edge-triggered listener wedges on a permanently-readable fd.
    ///
    /// Every other errno is a no-op. Returns true when the recovery
    /// accept found the backlog already empty.
    fn handle_fd_exhaustion(&self, err: i32) -> bool {
        if err != libc::EMFILE && err != libc::ENFILE {
            return false;
        }
        warn!(code = err, "out of file descriptors, recycling reserve fd");
        unsafe {
            libc::close(self.dummy_fd.get());
        }
        let mut drained = false;
        let fd = unsafe {
            libc::accept(
                self.reg.fd.get(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };
        if fd >= 0 {
            unsafe {
                libc::close(fd);
            }
        } else {
            let e = sys::errno();
            drained = e == libc::EAGAIN || e == libc::EWOULDBLOCK;
        }
        let dummy = open_dev_null();
        assert!(dummy >= 0, "failed to reopen reserve descriptor");
        self.dummy_fd.set(dummy);
        drained
    }
}

impl Pollable for ListenerShared {
    fn registration(&self) -> &Registration {
        &self.reg
    }

    fn on_read_notify(self: Rc<Self>) {
        debug_assert!(self.bound.get());
        self.reg.can_read.set(true);
        if self.accept_cb.is_empty() {
            return;
        }
        let mut state = NetState::ok();
        let fd = self.do_accept(&mut state);
        if fd < 0 {
            if !state.is_ok() {
                let slot = self.slot.borrow_mut().take();
                if let Some(callback) = self.accept_cb.release() {
                    callback(slot, state);
                }
            }
            return;
        }
        let slot = self.slot.borrow_mut().take();
        let socket = slot.expect("async_accept always installs a socket slot");
        socket.install_fd(fd);
        debug!(fd, "accepted connection");
        // The slot is already cleared, so the callback may install its
        // successor via async_accept; with can_read still set that queues
        // the next accept immediately.
        if let Some(callback) = self.accept_cb.release() {
            callback(Some(socket), NetState::ok());
        }
    }

    fn on_write_notify(self: Rc<Self>) {
        // Listeners are never armed for write.
    }

    fn on_exception(self: Rc<Self>, state: NetState) {
        self.handle_fd_exhaustion(state.code());
        if let Some(callback) = self.accept_cb.release() {
            let slot = self.slot.borrow_mut().take();
            callback(slot, state);
        }
    }
}

impl Drop for ListenerShared {
    fn drop(&mut self) {
        if self.reg.fd_valid() {
            unsafe {
                libc::close(self.reg.fd.get());
            }
        }
        if self.dummy_fd.get() >= 0 {
            unsafe {
                libc::close(self.dummy_fd.get());
            }
        }
    }
}

/// A listening TCP socket delivering accepted connections through a
/// callback.
pub struct ServerSocket {
    shared: Rc<ListenerShared>,
}

impl ServerSocket {
    /// Create an unbound listener. The reserve descriptor for
    /// fd-exhaustion recovery is opened here.
    pub fn new(io: &IoManager) -> io::Result<ServerSocket> {
        let dummy = open_dev_null();
        if dummy < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ServerSocket {
            shared: Rc::new(ListenerShared {
                core: io.core().clone(),
                reg: Registration::new(),
                dummy_fd: Cell::new(dummy),
                bound: Cell::new(false),
                accept_cb: CallbackSlot::new(),
                slot: RefCell::new(None),
            }),
        })
    }

    /// Bind and listen on `endpoint` with the OS maximum backlog.
    /// Returns false on any error, leaving no fd behind.
    pub fn bind(&self, endpoint: &Endpoint) -> bool {
        let shared = &self.shared;
        debug_assert!(!shared.bound.get());
        let fd = match sys::create_tcp_listener_fd() {
            Ok(fd) => fd,
            Err(_) => return false,
        };
        let addr = sys::sockaddr_from(endpoint);
        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            unsafe {
                libc::close(fd);
            }
            return false;
        }
        let rc = unsafe { libc::listen(fd, libc::SOMAXCONN) };
        if rc != 0 {
            unsafe {
                libc::close(fd);
            }
            return false;
        }
        shared.reg.fd.set(fd);
        shared.bound.set(true);
        debug!(fd, %endpoint, "listener bound");
        true
    }

    /// Install `slot` as the socket the next accepted fd is transferred
    /// into, and `callback` to receive it. One accept per call; the
    /// callback re-arms by calling `async_accept` again.
    pub fn async_accept<F>(&self, slot: Socket, callback: F)
    where
        F: FnOnce(Option<Socket>, NetState) + 'static,
    {
        let shared = &self.shared;
        assert!(shared.bound.get(), "accept on an unbound listener");
        *shared.slot.borrow_mut() = Some(slot);
        shared.accept_cb.set(Box::new(callback));
        let pollable: Rc<dyn Pollable> = shared.clone();
        shared.core.watch_read(&pollable);
        if shared.reg.can_read.get() {
            shared.core.enqueue_ready(&pollable, ReadyKind::Read);
        }
    }

    /// The locally bound endpoint (useful after binding port 0).
    pub fn local_endpoint(&self) -> io::Result<Endpoint> {
        sys::local_endpoint(self.shared.reg.fd.get())
    }

    /// Stop listening: close the fd and retire the registration.
    pub fn close(&self) {
        let shared = &self.shared;
        if shared.reg.fd_valid() {
            unsafe {
                libc::close(shared.reg.fd.get());
            }
            shared.reg.fd.set(-1);
        }
        shared.bound.set(false);
        shared.reg.armed_read.set(false);
        shared.reg.can_read.set(false);
        shared.accept_cb.release();
        shared.slot.borrow_mut().take();
        if let Some(token) = shared.reg.token.take() {
            shared.core.unregister(token);
        }
    }
}
