//! Close protocol: EOF replay, destruction from inside a callback, and
//! graceful asynchronous close.

use std::cell::Cell;
use std::rc::Rc;

use edgeio::{ClientSocket, Endpoint, IoManager, NetState, ServerSocket, Socket};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn bound_listener(io: &IoManager) -> (ServerSocket, Endpoint) {
    let server = ServerSocket::new(io).unwrap();
    assert!(server.bind(&Endpoint::parse("127.0.0.1:0").unwrap()));
    let local = server.local_endpoint().unwrap();
    (server, local)
}

#[test]
fn eof_is_replayed_to_subsequent_reads() {
    init_logging();
    let io = Rc::new(IoManager::new().unwrap());
    let (server, target) = bound_listener(&io);

    // The server closes every accepted connection immediately, so the
    // client observes a clean FIN.
    server.async_accept(Socket::new(&io), |socket, state| {
        assert!(state.is_ok());
        socket.unwrap().close();
    });

    let client = ClientSocket::new(&io);
    let eof_reads = Rc::new(Cell::new(0u32));
    let waker = Rc::new(io.waker().unwrap());
    {
        let eof_reads = eof_reads.clone();
        assert!(client.async_connect(&target, move |c, state| {
            assert!(state.is_ok());
            let again = eof_reads.clone();
            let waker2 = waker.clone();
            c.async_read(move |s, n, state| {
                assert!(state.is_ok(), "first read failed: {state}");
                assert_eq!(n, 0, "expected EOF");
                again.set(again.get() + 1);
                // Re-arm: the EOF must replay without any new readiness
                // event from the kernel.
                s.async_read(move |_, n, state| {
                    assert!(state.is_ok(), "replayed read failed: {state}");
                    assert_eq!(n, 0, "expected replayed EOF");
                    again.set(again.get() + 1);
                    waker2.wake();
                });
            });
        }));
    }

    io.schedule_timeout(5_000, |_| panic!("EOF replay timed out"));
    assert!(io.run_main_loop().is_ok());
    assert_eq!(eof_reads.get(), 2);
}

#[test]
fn callback_may_destroy_its_own_socket() {
    init_logging();
    let io = Rc::new(IoManager::new().unwrap());
    let (server, target) = bound_listener(&io);

    // The server's read callback destroys the very socket it runs on.
    server.async_accept(Socket::new(&io), |socket, state| {
        assert!(state.is_ok());
        let socket = socket.unwrap();
        socket.async_read(|s, _n, _state| {
            s.close();
        });
    });

    let client = ClientSocket::new(&io);
    let finished = Rc::new(Cell::new(false));
    let waker = Rc::new(io.waker().unwrap());
    {
        let finished = finished.clone();
        assert!(client.async_connect(&target, move |c, state| {
            assert!(state.is_ok());
            c.async_write(b"x", |_, _, state| assert!(state.is_ok()));
            c.async_read(move |_, n, _state| {
                // Whatever the close manifests as (EOF or reset), the
                // dispatcher must survive the mid-callback destruction.
                assert_eq!(n, 0);
                finished.set(true);
                waker.wake();
            });
        }));
    }

    io.schedule_timeout(5_000, |_| panic!("destruction test timed out"));
    assert!(io.run_main_loop().is_ok());
    assert!(finished.get());
}

#[test]
fn async_close_completes_after_peer_fin() {
    init_logging();
    let io = Rc::new(IoManager::new().unwrap());
    let (server, target) = bound_listener(&io);

    // Server: drain until EOF, then close its side so the client's
    // closing drain observes the FIN.
    fn drain_until_eof(socket: &Socket) {
        socket.async_read(|s, n, state| {
            assert!(state.is_ok());
            if n == 0 {
                s.close();
            } else {
                s.read_buffer().read(n);
                drain_until_eof(s);
            }
        });
    }
    server.async_accept(Socket::new(&io), |socket, state| {
        assert!(state.is_ok());
        drain_until_eof(&socket.unwrap());
    });

    let client = ClientSocket::new(&io);
    let closed = Rc::new(Cell::new(false));
    let waker = Rc::new(io.waker().unwrap());
    {
        let closed = closed.clone();
        assert!(client.async_connect(&target, move |c, state| {
            assert!(state.is_ok());
            let closed = closed.clone();
            let waker = waker.clone();
            c.async_write(b"bye", move |s, n, state| {
                assert!(state.is_ok());
                assert_eq!(n, 3);
                s.async_close(move |state: NetState| {
                    assert!(state.is_ok(), "close finished with {state}");
                    closed.set(true);
                    waker.wake();
                });
            });
        }));
    }

    io.schedule_timeout(5_000, |_| panic!("async close timed out"));
    assert!(io.run_main_loop().is_ok());
    assert!(closed.get());
}
