//! Connected-TCP sockets and the outbound connect state machine.

use std::cell::{Cell, RefCell, RefMut};
use std::io;
use std::ops::Deref;
use std::os::fd::RawFd;
use std::rc::Rc;

use tracing::debug;

use crate::buffer::Buffer;
use crate::callback::{
    CallbackSlot, CloseHandler, ConnectCallback, ReadCallback, WriteCallback,
};
use crate::endpoint::Endpoint;
use crate::pollable::{Pollable, Registration};
use crate::reactor::{Core, IoManager, ReadyKind};
use crate::state::NetState;
use crate::sys;

/// Close progression of a connected socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Closing,
    Closed,
}

/// Outbound connect progression. Accepted sockets are born `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnPhase {
    Disconnected,
    Connecting,
    Connected,
}

pub(crate) struct SocketShared {
    core: Rc<Core>,
    reg: Registration,
    phase: Cell<Phase>,
    conn: Cell<ConnPhase>,
    eof: Cell<bool>,
    /// Half-close deferred until the write buffer drains.
    shutdown_pending: Cell<bool>,
    read_buf: RefCell<Buffer>,
    write_buf: RefCell<Buffer>,
    /// Bytes already flushed for the in-progress user write request.
    prev_write_size: Cell<usize>,
    read_cb: CallbackSlot<ReadCallback>,
    write_cb: CallbackSlot<WriteCallback>,
    connect_cb: CallbackSlot<ConnectCallback>,
    close_cb: CallbackSlot<Box<dyn CloseHandler>>,
}

impl SocketShared {
    fn new(core: Rc<Core>, conn: ConnPhase) -> Rc<SocketShared> {
        Rc::new(SocketShared {
            core,
            reg: Registration::new(),
            phase: Cell::new(Phase::Open),
            conn: Cell::new(conn),
            eof: Cell::new(false),
            shutdown_pending: Cell::new(false),
            read_buf: RefCell::new(Buffer::with_capacity(0)),
            write_buf: RefCell::new(Buffer::with_capacity(0)),
            prev_write_size: Cell::new(0),
            read_cb: CallbackSlot::new(),
            write_cb: CallbackSlot::new(),
            connect_cb: CallbackSlot::new(),
            close_cb: CallbackSlot::new(),
        })
    }

    /// Drain the kernel until EAGAIN with two-segment scatter reads:
    /// segment 0 is the read buffer's writable span, segment 1 the
    /// reactor's shared scratch buffer. Overflow into the scratch segment
    /// is injected back into the read buffer, growing it exactly.
    fn do_read(&self, state: &mut NetState) -> usize {
        state.clear();
        // A seen EOF replays as a zero-byte read until the user closes.
        if self.eof.get() {
            return 0;
        }
        let mut total = 0usize;
        loop {
            let mut read_buf = self.read_buf.borrow_mut();
            let mut scratch = self.core.scratch();
            let scratch_len = scratch.len();
            let seg0_len;
            let rc = {
                let mut acc = read_buf.write_accessor();
                seg0_len = acc.len();
                let iov = [
                    libc::iovec {
                        iov_base: acc.as_mut_ptr() as *mut libc::c_void,
                        iov_len: seg0_len,
                    },
                    libc::iovec {
                        iov_base: scratch.as_mut_ptr() as *mut libc::c_void,
                        iov_len: scratch_len,
                    },
                ];
                let rc = unsafe { libc::readv(self.reg.fd.get(), iov.as_ptr(), 2) };
                if rc > 0 {
                    acc.set_committed((rc as usize).min(seg0_len));
                }
                rc
            };
            if rc < 0 {
                let err = sys::errno();
                if err == libc::EAGAIN || err == libc::EWOULDBLOCK {
                    self.reg.can_read.set(false);
                    return total;
                }
                if err == libc::EINTR {
                    continue;
                }
                *state = NetState::system(err);
                return total;
            }
            if rc == 0 {
                self.eof.set(true);
                return total;
            }
            let n = rc as usize;
            if n > seg0_len {
                let overflow = n - seg0_len;
                if !read_buf.inject(&scratch[..overflow]) {
                    *state = NetState::system(libc::ENOBUFS);
                    return total;
                }
            }
            total += n;
            if n < seg0_len + scratch_len {
                // Short read: the kernel is empty.
                self.reg.can_read.set(false);
                return total;
            }
        }
    }

    /// Single flush attempt of the write buffer's readable span.
    fn do_write(&self, state: &mut NetState) -> usize {
        debug_assert!(self.write_buf.borrow().readable_size() > 0);
        state.clear();
        loop {
            let mut write_buf = self.write_buf.borrow_mut();
            let mut acc = write_buf.read_accessor();
            let len = acc.len();
            let rc = unsafe {
                libc::write(self.reg.fd.get(), acc.as_ptr() as *const libc::c_void, len)
            };
            if rc <= 0 {
                let err = sys::errno();
                if err == libc::EAGAIN || err == libc::EWOULDBLOCK {
                    self.reg.can_write.set(false);
                    return 0;
                }
                if err == libc::EINTR {
                    continue;
                }
                *state = NetState::system(err);
                return self.prev_write_size.get();
            }
            let n = rc as usize;
            if n < len {
                self.reg.can_write.set(false);
            }
            acc.set_committed(n);
            return n;
        }
    }

    /// Connected read path, including the asynchronous-close drain.
    fn readable(this: &Rc<Self>) {
        this.reg.can_read.set(true);

        if this.phase.get() == Phase::Closing {
            let mut state = NetState::ok();
            let n = this.do_read(&mut state);
            if !state.is_ok() {
                if let Some(handler) = this.close_cb.release() {
                    handler.on_close(state);
                }
                if this.reg.fd_valid() {
                    this.destroy();
                }
                return;
            }
            if n > 0 {
                // Bytes arriving during close go to the data hook. The
                // handler leaves its slot while running so it may install
                // a replacement.
                if let Some(mut handler) = this.close_cb.release() {
                    handler.on_data(n);
                    if this.close_cb.is_empty() {
                        this.close_cb.set(handler);
                    }
                }
                if this.eof.get() {
                    // Data and FIN came in one drain; replay the EOF so
                    // the close hook still fires.
                    if let Some(token) = this.reg.token.get() {
                        this.core.enqueue_ready_token(token, ReadyKind::Read);
                    }
                }
            } else if this.eof.get() {
                if let Some(handler) = this.close_cb.release() {
                    handler.on_close(NetState::ok());
                }
                if this.reg.fd_valid() {
                    this.destroy();
                }
            }
            return;
        }

        // No reader installed: leave the bytes in the kernel and let the
        // OS apply back-pressure.
        if this.read_cb.is_empty() {
            return;
        }
        let mut state = NetState::ok();
        let n = this.do_read(&mut state);
        if let Some(callback) = this.read_cb.release() {
            let socket = Socket {
                shared: this.clone(),
            };
            callback(&socket, n, state);
        }
    }

    /// Connected write path.
    fn writable(this: &Rc<Self>) {
        this.reg.can_write.set(true);
        if this.write_buf.borrow().readable_size() == 0 {
            return;
        }
        let mut state = NetState::ok();
        let n = this.do_write(&mut state);
        if state.is_ok() {
            if this.write_buf.borrow().readable_size() == 0 {
                let total = this.prev_write_size.get() + n;
                this.prev_write_size.set(0);
                if this.shutdown_pending.replace(false) {
                    unsafe {
                        libc::shutdown(this.reg.fd.get(), libc::SHUT_WR);
                    }
                }
                if let Some(callback) = this.write_cb.release() {
                    let socket = Socket {
                        shared: this.clone(),
                    };
                    callback(&socket, total, state);
                }
            } else {
                this.prev_write_size
                    .set(this.prev_write_size.get() + n);
            }
        } else {
            let total = this.prev_write_size.get();
            this.prev_write_size.set(0);
            if let Some(callback) = this.write_cb.release() {
                let socket = Socket {
                    shared: this.clone(),
                };
                callback(&socket, total, state);
            }
        }
    }

    /// Close the fd and retire the registration. Callbacks that already
    /// ran are gone; the rest are dropped.
    fn destroy(&self) {
        if self.reg.fd_valid() {
            unsafe {
                libc::close(self.reg.fd.get());
            }
            self.reg.fd.set(-1);
        }
        self.phase.set(Phase::Closed);
        self.reg.armed_read.set(false);
        self.reg.armed_write.set(false);
        self.reg.can_read.set(false);
        self.reg.can_write.set(false);
        self.read_cb.release();
        self.write_cb.release();
        self.connect_cb.release();
        self.close_cb.release();
        if let Some(token) = self.reg.token.take() {
            self.core.unregister(token);
        }
    }
}

impl Pollable for SocketShared {
    fn registration(&self) -> &Registration {
        &self.reg
    }

    fn on_read_notify(self: Rc<Self>) {
        match self.conn.get() {
            ConnPhase::Connected => SocketShared::readable(&self),
            // Readiness before the connection exists carries nothing.
            ConnPhase::Disconnected | ConnPhase::Connecting => {}
        }
    }

    fn on_write_notify(self: Rc<Self>) {
        match self.conn.get() {
            ConnPhase::Connected => SocketShared::writable(&self),
            ConnPhase::Connecting => {
                // First writability completes the handshake.
                self.reg.can_write.set(true);
                self.conn.set(ConnPhase::Connected);
                debug!(fd = self.reg.fd.get(), "connect completed");
                if let Some(callback) = self.connect_cb.release() {
                    let socket = ClientSocket {
                        sock: Socket {
                            shared: self.clone(),
                        },
                    };
                    callback(&socket, NetState::ok());
                }
            }
            ConnPhase::Disconnected => {}
        }
    }

    fn on_exception(self: Rc<Self>, state: NetState) {
        debug_assert!(!state.is_ok());
        match self.conn.get() {
            ConnPhase::Connected => {
                if let Some(callback) = self.read_cb.release() {
                    let socket = Socket {
                        shared: self.clone(),
                    };
                    callback(&socket, 0, state);
                }
                // The read callback may have destroyed the socket.
                if self.reg.fd_valid() {
                    if let Some(callback) = self.write_cb.release() {
                        let socket = Socket {
                            shared: self.clone(),
                        };
                        callback(&socket, 0, state);
                    }
                }
            }
            ConnPhase::Connecting => {
                self.conn.set(ConnPhase::Disconnected);
                debug!(code = state.code(), "connect failed");
                if let Some(callback) = self.connect_cb.release() {
                    let socket = ClientSocket {
                        sock: Socket {
                            shared: self.clone(),
                        },
                    };
                    callback(&socket, state);
                }
            }
            ConnPhase::Disconnected => {}
        }
    }
}

impl Drop for SocketShared {
    fn drop(&mut self) {
        if self.reg.fd_valid() {
            unsafe {
                libc::close(self.reg.fd.get());
            }
        }
    }
}

/// A connected (or to-be-accepted) TCP socket bound to one [`IoManager`]
/// for its whole life.
///
/// All methods must be called from the reactor thread. The socket stays
/// registered, and its callbacks keep firing, until [`Socket::close`] or
/// the asynchronous close protocol retires it, even if this handle is
/// dropped.
pub struct Socket {
    pub(crate) shared: Rc<SocketShared>,
}

impl Socket {
    /// A socket with no fd yet, to be populated by
    /// [`ServerSocket::async_accept`](crate::ServerSocket::async_accept).
    pub fn new(io: &IoManager) -> Socket {
        Socket {
            shared: SocketShared::new(io.core().clone(), ConnPhase::Connected),
        }
    }

    /// Install a one-shot read callback and arm read readiness.
    ///
    /// The callback fires with the number of bytes appended to
    /// [`read_buffer`](Socket::read_buffer) (zero with an OK state means
    /// EOF) once the socket is readable; if it already is, on the next
    /// loop iteration.
    pub fn async_read<F>(&self, callback: F)
    where
        F: FnOnce(&Socket, usize, NetState) + 'static,
    {
        let shared = &self.shared;
        assert!(shared.reg.fd_valid(), "read on a socket without an fd");
        shared.read_cb.set(Box::new(callback));
        let pollable: Rc<dyn Pollable> = shared.clone();
        shared.core.watch_read(&pollable);
        if shared.reg.can_read.get() || shared.eof.get() {
            shared.core.enqueue_ready(&pollable, ReadyKind::Read);
        }
    }

    /// Append `data` to the write buffer and flush it as the socket
    /// allows, firing `callback` once everything is in the kernel.
    pub fn async_write<F>(&self, data: &[u8], callback: F)
    where
        F: FnOnce(&Socket, usize, NetState) + 'static,
    {
        let shared = &self.shared;
        assert!(shared.reg.fd_valid(), "write on a socket without an fd");
        if shared.write_buf.borrow().readable_size() == 0 {
            shared.prev_write_size.set(0);
        }
        shared.write_buf.borrow_mut().write(data);
        shared.write_cb.set(Box::new(callback));
        let pollable: Rc<dyn Pollable> = shared.clone();
        shared.core.watch_write(&pollable);
        if shared.reg.can_write.get() {
            shared.core.enqueue_ready(&pollable, ReadyKind::Write);
        }
    }

    /// Begin a graceful close: flush pending writes, send FIN, drain the
    /// peer until its FIN, then close the fd.
    ///
    /// Bytes arriving meanwhile go to the handler's
    /// [`on_data`](CloseHandler::on_data) hook; the final transition
    /// consumes [`on_close`](CloseHandler::on_close).
    pub fn async_close<H>(&self, handler: H)
    where
        H: CloseHandler,
    {
        let shared = &self.shared;
        assert!(shared.reg.fd_valid(), "close on a socket without an fd");
        shared.phase.set(Phase::Closing);
        shared.close_cb.set(Box::new(handler));
        if shared.write_buf.borrow().readable_size() == 0 {
            unsafe {
                libc::shutdown(shared.reg.fd.get(), libc::SHUT_WR);
            }
        } else {
            shared.shutdown_pending.set(true);
        }
        let pollable: Rc<dyn Pollable> = shared.clone();
        shared.core.watch_read(&pollable);
        if shared.reg.can_read.get() || shared.eof.get() {
            shared.core.enqueue_ready(&pollable, ReadyKind::Read);
        }
    }

    /// Close immediately: the fd is closed, the registration retired, and
    /// any pending callbacks dropped.
    pub fn close(&self) {
        debug!(fd = self.shared.reg.fd.get(), "socket closed");
        self.shared.destroy();
    }

    /// The buffer incoming bytes are staged in. Callbacks typically
    /// `read()` from it.
    pub fn read_buffer(&self) -> RefMut<'_, Buffer> {
        self.shared.read_buf.borrow_mut()
    }

    /// The buffer outgoing bytes are staged in.
    pub fn write_buffer(&self) -> RefMut<'_, Buffer> {
        self.shared.write_buf.borrow_mut()
    }

    pub fn local_endpoint(&self) -> io::Result<Endpoint> {
        sys::local_endpoint(self.shared.reg.fd.get())
    }

    pub fn peer_endpoint(&self) -> io::Result<Endpoint> {
        sys::peer_endpoint(self.shared.reg.fd.get())
    }

    /// Adopt an accepted fd. The socket becomes connected with fresh
    /// readiness state.
    pub(crate) fn install_fd(&self, fd: RawFd) {
        sys::set_tcp_nodelay(fd);
        let shared = &self.shared;
        shared.reg.fd.set(fd);
        shared.conn.set(ConnPhase::Connected);
        shared.phase.set(Phase::Open);
        shared.eof.set(false);
        shared.reg.can_read.set(false);
        shared.reg.can_write.set(false);
    }
}

/// An outbound TCP socket: a [`Socket`] plus the
/// DISCONNECTED -> CONNECTING -> CONNECTED machine.
pub struct ClientSocket {
    sock: Socket,
}

impl ClientSocket {
    pub fn new(io: &IoManager) -> ClientSocket {
        ClientSocket {
            sock: Socket {
                shared: SocketShared::new(io.core().clone(), ConnPhase::Disconnected),
            },
        }
    }

    /// Start a non-blocking connect to `endpoint`.
    ///
    /// Returns false if the socket could not even be created locally.
    /// Every other outcome, including connection refusal, reaches
    /// `callback` asynchronously.
    pub fn async_connect<F>(&self, endpoint: &Endpoint, callback: F) -> bool
    where
        F: FnOnce(&ClientSocket, NetState) + 'static,
    {
        let shared = &self.sock.shared;
        debug_assert_eq!(shared.conn.get(), ConnPhase::Disconnected);
        let fd = match sys::create_tcp_fd() {
            Ok(fd) => fd,
            Err(e) => {
                debug!(error = %e, "socket creation failed");
                return false;
            }
        };
        shared.reg.fd.set(fd);
        shared.connect_cb.set(Box::new(callback));
        let addr = sys::sockaddr_from(endpoint);
        let rc = unsafe {
            libc::connect(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        let pollable: Rc<dyn Pollable> = shared.clone();
        if rc == 0 {
            // Loopback can connect synchronously; completion is still
            // delivered from inside the loop.
            shared.conn.set(ConnPhase::Connecting);
            shared.core.watch_write(&pollable);
            shared.core.enqueue_ready(&pollable, ReadyKind::Write);
            return true;
        }
        let err = sys::errno();
        // EINTR on connect means the attempt continues in the background.
        if err == libc::EINPROGRESS || err == libc::EINTR {
            shared.conn.set(ConnPhase::Connecting);
            shared.core.watch_write(&pollable);
            return true;
        }
        // Route errors and the like fail synchronously on a non-blocking
        // connect; they still reach the callback like any other failure.
        debug!(code = err, "connect failed synchronously");
        unsafe {
            libc::close(fd);
        }
        shared.reg.fd.set(-1);
        if let Some(callback) = shared.connect_cb.release() {
            callback(self, NetState::system(err));
        }
        true
    }
}

impl Deref for ClientSocket {
    type Target = Socket;

    fn deref(&self) -> &Socket {
        &self.sock
    }
}
