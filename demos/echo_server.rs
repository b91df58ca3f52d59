//! TCP echo server on a single reactor thread.
//!
//! Usage: `echo_server [addr:port]` (default 127.0.0.1:7878).

use std::rc::Rc;

use edgeio::{Endpoint, IoManager, ServerSocket, Socket};

fn pump(socket: &Socket, connection: u64) {
    socket.async_read(move |s, n, state| {
        if !state.is_ok() {
            eprintln!("[conn {connection}] read error: {state}");
            s.close();
            return;
        }
        if n == 0 {
            eprintln!("[conn {connection}] peer closed");
            s.close();
            return;
        }
        let data = s.read_buffer().read(n).to_vec();
        s.async_write(&data, move |_, _, state| {
            if !state.is_ok() {
                eprintln!("[conn {connection}] write error: {state}");
            }
        });
        pump(s, connection);
    });
}

fn accept_loop(server: Rc<ServerSocket>, io: Rc<IoManager>, connection: u64) {
    let slot = Socket::new(&io);
    let next = server.clone();
    server.async_accept(slot, move |socket, state| {
        match socket {
            Some(socket) if state.is_ok() => {
                match socket.peer_endpoint() {
                    Ok(peer) => eprintln!("[conn {connection}] accepted from {peer}"),
                    Err(_) => eprintln!("[conn {connection}] accepted"),
                }
                pump(&socket, connection);
            }
            _ => eprintln!("accept error: {state}"),
        }
        accept_loop(next, io, connection + 1);
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
    let server = Rc::new(ServerSocket::new(&io).expect("failed to create listener"));
    assert!(server.bind(&endpoint), "failed to bind {endpoint}");
    eprintln!("echo server listening on {endpoint}");

    accept_loop(server, io.clone(), 0);
    let state = io.run_main_loop();
    eprintln!("main loop exited: {state}");
}
