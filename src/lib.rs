//! edgeio: a single-threaded, edge-triggered TCP networking core.
//!
//! One [`IoManager`] owns an epoll instance, a shared scratch read
//! buffer, a timer queue, and a loopback control channel for cross-thread
//! wake-up. Sockets are bound to it for life and drive their state
//! machines from readiness callbacks: [`ClientSocket`] adds a
//! non-blocking connect machine, [`ServerSocket`] an accept loop with
//! fd-exhaustion recovery. All user callbacks run inline on the reactor
//! thread; [`Waker`] is the only cross-thread entry point.
//!
//! ```no_run
//! use edgeio::{Endpoint, IoManager, ServerSocket, Socket};
//!
//! let io = IoManager::new().unwrap();
//! let server = ServerSocket::new(&io).unwrap();
//! assert!(server.bind(&Endpoint::parse("127.0.0.1:7878").unwrap()));
//! server.async_accept(Socket::new(&io), |socket, state| {
//!     assert!(state.is_ok());
//!     let socket = socket.unwrap();
//!     socket.async_read(|s, n, _state| {
//!         let data = s.read_buffer().read(n).to_vec();
//!         s.async_write(&data, |_, _, _| {});
//!     });
//! });
//! io.run_main_loop();
//! ```

mod buffer;
mod callback;
mod endpoint;
mod listener;
mod pollable;
mod reactor;
mod socket;
mod state;
mod sys;
mod timer;

pub use buffer::{Buffer, ReadAccessor, WriteAccessor};
pub use callback::CloseHandler;
pub use endpoint::{Endpoint, ENDPOINT_ERROR};
pub use listener::ServerSocket;
pub use reactor::{IoManager, Waker};
pub use socket::{ClientSocket, Socket};
pub use state::{Category, NetState};
