//! Outbound connect demo: send one line to an echo server and print the
//! reply.
//!
//! Usage: `connect_echo [addr:port]` (default 127.0.0.1:7878).

use std::rc::Rc;

use edgeio::{ClientSocket, Endpoint, IoManager, Socket, Waker};

fn read_reply(socket: &Socket, expected: usize, waker: Rc<Waker>) {
    socket.async_read(move |s, n, state| {
        if !state.is_ok() {
            eprintln!("read error: {state}");
            waker.wake();
            return;
        }
        if n == 0 {
            eprintln!("peer closed before echoing");
            waker.wake();
            return;
        }
        let data = s.read_buffer().read(n).to_vec();
        eprintln!("received: {}", String::from_utf8_lossy(&data).trim_end());
        if n >= expected {
            waker.wake();
        } else {
            read_reply(s, expected - n, waker);
        }
    });
}

fn main() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7878".to_string());
    let endpoint = Endpoint::parse(&addr).expect("invalid addr:port");

    let io = Rc::new(IoManager::new().expect("failed to create reactor"));
    let waker = Rc::new(io.waker().expect("failed to create waker"));

    let message = b"Hello from edgeio!\n";
    let client = ClientSocket::new(&io);
    {
        let waker = waker.clone();
        let ok = client.async_connect(&endpoint, move |c, state| {
            if !state.is_ok() {
                eprintln!("connect failed: {state}");
                waker.wake();
                return;
            }
            eprintln!("connected to {}", c.peer_endpoint().unwrap());
            c.async_write(message, |_, n, state| {
                if state.is_ok() {
                    eprintln!("sent {n} bytes");
                } else {
                    eprintln!("write error: {state}");
                }
            });
            read_reply(c, message.len(), waker);
        });
        assert!(ok, "could not start connect");
    }

    io.schedule_timeout(5_000, {
        let waker = waker.clone();
        move |_| {
            eprintln!("timed out");
            waker.wake();
        }
    });

    let state = io.run_main_loop();
    eprintln!("done: {state}");
    client.close();
}
