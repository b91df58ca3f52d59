//! Readiness-event receivers and their reactor-side bookkeeping.

use std::cell::Cell;
use std::os::fd::RawFd;
use std::rc::Rc;

use crate::state::NetState;

/// Identity of a registered pollable: slab index plus generation.
///
/// The pair is packed into the epoll user-data word, so a readiness event
/// delivered after the slot was freed (and possibly reused) is detected by
/// a generation mismatch and dropped instead of reaching a stranger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Token {
    pub index: u32,
    pub generation: u32,
}

impl Token {
    pub fn pack(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    pub fn unpack(raw: u64) -> Self {
        Token {
            index: raw as u32,
            generation: (raw >> 32) as u32,
        }
    }
}

/// Reactor-side registration state embedded in every pollable.
///
/// `can_read` / `can_write` track what the kernel is believed to have:
/// set on the corresponding readiness hook, cleared when a system call
/// reports EAGAIN/EWOULDBLOCK. The armed flags record which edge-triggered
/// interests have been installed; the reactor never disarms them
/// implicitly.
pub(crate) struct Registration {
    pub fd: Cell<RawFd>,
    pub token: Cell<Option<Token>>,
    pub armed_read: Cell<bool>,
    pub armed_write: Cell<bool>,
    pub can_read: Cell<bool>,
    pub can_write: Cell<bool>,
}

impl Registration {
    pub fn new() -> Self {
        Registration {
            fd: Cell::new(-1),
            token: Cell::new(None),
            armed_read: Cell::new(false),
            armed_write: Cell::new(false),
            can_read: Cell::new(false),
            can_write: Cell::new(false),
        }
    }

    #[inline]
    pub fn fd_valid(&self) -> bool {
        self.fd.get() >= 0
    }
}

/// An object owning a file descriptor and receiving readiness callbacks
/// from the reactor.
///
/// Hooks take `Rc<Self>` so implementations can mint user-facing handles
/// for the callbacks they invoke. Implementations must set
/// `can_read`/`can_write` on entry to the matching hook, retry EINTR
/// internally, and treat EAGAIN/EWOULDBLOCK as "drained for now".
pub(crate) trait Pollable {
    fn registration(&self) -> &Registration;

    /// The fd (or the whole socket) became readable.
    fn on_read_notify(self: Rc<Self>);

    /// The fd became writable.
    fn on_write_notify(self: Rc<Self>);

    /// The readiness facility reported a per-socket error.
    fn on_exception(self: Rc<Self>, state: NetState);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_packs_and_unpacks() {
        let token = Token {
            index: 0x0042_1234,
            generation: 0xdead_beef,
        };
        assert_eq!(Token::unpack(token.pack()), token);
    }

    #[test]
    fn registration_defaults() {
        let reg = Registration::new();
        assert!(!reg.fd_valid());
        assert!(reg.token.get().is_none());
        assert!(!reg.armed_read.get());
        assert!(!reg.can_write.get());
    }
}
