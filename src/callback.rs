//! One-shot owning callback slots.
//!
//! Every user callback lives in a slot that is emptied (`release`) before
//! the callback runs. Releasing first means the callback cannot be
//! re-entered, and the slot is free for the callback itself to install a
//! replacement.

use std::cell::RefCell;

use crate::socket::{ClientSocket, Socket};
use crate::state::NetState;

/// Read completion: `(socket, bytes_read, state)`.
pub type ReadCallback = Box<dyn FnOnce(&Socket, usize, NetState)>;
/// Write completion: `(socket, bytes_written, state)`.
pub type WriteCallback = Box<dyn FnOnce(&Socket, usize, NetState)>;
/// Connect completion: `(socket, state)`.
pub type ConnectCallback = Box<dyn FnOnce(&ClientSocket, NetState)>;
/// Accept completion: the populated socket slot (returned unpopulated on
/// error) and the accept state.
pub type AcceptCallback = Box<dyn FnOnce(Option<Socket>, NetState)>;
/// Timer expiry: receives the entry's remaining milliseconds at fire time.
pub type TimeoutCallback = Box<dyn FnOnce(i64)>;

/// Handler for asynchronous close.
///
/// While a socket drains toward its FIN, arriving bytes are reported
/// through [`on_data`](CloseHandler::on_data); the final transition
/// (EOF or error) consumes the handler through
/// [`on_close`](CloseHandler::on_close).
pub trait CloseHandler: 'static {
    /// Bytes were received while the socket was closing.
    fn on_data(&mut self, _bytes: usize) {}

    /// The close protocol finished.
    fn on_close(self: Box<Self>, state: NetState);
}

impl<F: FnOnce(NetState) + 'static> CloseHandler for F {
    fn on_close(self: Box<Self>, state: NetState) {
        (*self)(state)
    }
}

/// Exclusive owner of a not-yet-invoked callback.
pub(crate) struct CallbackSlot<T> {
    slot: RefCell<Option<T>>,
}

impl<T> CallbackSlot<T> {
    pub fn new() -> Self {
        CallbackSlot {
            slot: RefCell::new(None),
        }
    }

    /// Install a callback, replacing any previous one.
    pub fn set(&self, callback: T) {
        *self.slot.borrow_mut() = Some(callback);
    }

    /// Take ownership out of the slot, leaving it empty.
    pub fn release(&self) -> Option<T> {
        self.slot.borrow_mut().take()
    }

    pub fn is_empty(&self) -> bool {
        self.slot.borrow().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn release_empties_the_slot() {
        let slot: CallbackSlot<Box<dyn FnOnce() -> u32>> = CallbackSlot::new();
        slot.set(Box::new(|| 7));
        assert!(!slot.is_empty());
        let cb = slot.release().unwrap();
        assert!(slot.is_empty());
        assert_eq!(cb(), 7);
        assert!(slot.release().is_none());
    }

    #[test]
    fn callback_may_reinstall_into_its_own_slot() {
        // Release-then-invoke: the running callback sees an empty slot and
        // may register its successor without losing it.
        let slot: Rc<CallbackSlot<Box<dyn FnOnce()>>> = Rc::new(CallbackSlot::new());
        let fired = Rc::new(Cell::new(0u32));

        let slot2 = slot.clone();
        let fired2 = fired.clone();
        slot.set(Box::new(move || {
            fired2.set(fired2.get() + 1);
            let fired3 = fired2.clone();
            slot2.set(Box::new(move || fired3.set(fired3.get() + 1)));
        }));

        (slot.release().unwrap())();
        assert_eq!(fired.get(), 1);
        assert!(!slot.is_empty());
        (slot.release().unwrap())();
        assert_eq!(fired.get(), 2);
    }

    #[test]
    fn close_handler_blanket_impl_forwards_state() {
        let seen = Rc::new(Cell::new(0));
        let seen2 = seen.clone();
        let handler: Box<dyn CloseHandler> =
            Box::new(move |state: NetState| seen2.set(state.code()));
        handler.on_close(NetState::system(libc::EPIPE));
        assert_eq!(seen.get(), libc::EPIPE);
    }
}
