//! Large write with partial flushes: one user request, one completion.

use std::cell::Cell;
use std::rc::Rc;

use edgeio::{ClientSocket, Endpoint, IoManager, ServerSocket, Socket, Waker};

const TOTAL: usize = 16 * 1024 * 1024;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn finish_if_done(
    received: &Rc<Cell<usize>>,
    completions: &Rc<Cell<usize>>,
    waker: &Rc<Waker>,
) {
    if received.get() == TOTAL && completions.get() == 1 {
        waker.wake();
    }
}

#[test]
fn sixteen_mib_write_completes_exactly_once() {
    init_logging();
    let io = Rc::new(IoManager::new().unwrap());
    let server = ServerSocket::new(&io).unwrap();
    assert!(server.bind(&Endpoint::parse("127.0.0.1:0").unwrap()));
    let target = server.local_endpoint().unwrap();

    let received = Rc::new(Cell::new(0usize));
    let completions = Rc::new(Cell::new(0usize));
    let waker = Rc::new(io.waker().unwrap());

    // Server: discard everything, counting bytes. The client's 16 MiB
    // cannot fit in the socket buffers, so its write path must survive
    // many partial flushes while we drain.
    fn pump(
        socket: &Socket,
        received: Rc<Cell<usize>>,
        completions: Rc<Cell<usize>>,
        waker: Rc<Waker>,
    ) {
        socket.async_read(move |s, n, state| {
            assert!(state.is_ok(), "server read failed: {state}");
            if n > 0 {
                s.read_buffer().read(n);
                received.set(received.get() + n);
            }
            finish_if_done(&received, &completions, &waker);
            if received.get() < TOTAL {
                pump(s, received, completions, waker);
            }
        });
    }
    {
        let received = received.clone();
        let completions = completions.clone();
        let waker = waker.clone();
        server.async_accept(Socket::new(&io), move |socket, state| {
            assert!(state.is_ok());
            pump(&socket.unwrap(), received, completions, waker);
        });
    }

    let client = ClientSocket::new(&io);
    {
        let received = received.clone();
        let completions = completions.clone();
        let waker = waker.clone();
        let payload = vec![0x5Au8; TOTAL];
        assert!(client.async_connect(&target, move |c, state| {
            assert!(state.is_ok(), "connect failed: {state}");
            let received = received.clone();
            let completions = completions.clone();
            let waker = waker.clone();
            c.async_write(&payload, move |_, total, state| {
                assert!(state.is_ok(), "write failed: {state}");
                assert_eq!(total, TOTAL);
                completions.set(completions.get() + 1);
                finish_if_done(&received, &completions, &waker);
            });
        }));
    }

    io.schedule_timeout(30_000, |_| panic!("backpressure test timed out"));
    assert!(io.run_main_loop().is_ok());
    assert_eq!(received.get(), TOTAL);
    assert_eq!(completions.get(), 1);
}
