//! Raw file-descriptor helpers.

use std::io;
use std::os::fd::RawFd;

use crate::endpoint::Endpoint;

/// Last errno as an i32.
#[inline]
pub(crate) fn errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Compose O_NONBLOCK into the status flags and set FD_CLOEXEC.
pub(crate) fn set_nonblock_cloexec(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd_flags = libc::fcntl(fd, libc::F_GETFD);
        if fd_flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFD, fd_flags | libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn set_sockopt(fd: RawFd, level: i32, name: i32) {
    let one: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    // Baseline socket options never fail on a valid TCP fd; refusing to
    // run without them beats running misconfigured.
    assert_eq!(rc, 0, "setsockopt failed: {}", io::Error::last_os_error());
}

pub(crate) fn set_tcp_nodelay(fd: RawFd) {
    set_sockopt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY);
}

pub(crate) fn set_reuse_addr(fd: RawFd) {
    set_sockopt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR);
}

fn new_tcp_fd() -> io::Result<RawFd> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, libc::IPPROTO_TCP) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    if let Err(e) = set_nonblock_cloexec(fd) {
        unsafe { libc::close(fd) };
        return Err(e);
    }
    Ok(fd)
}

/// Non-blocking close-on-exec TCP fd with TCP_NODELAY and SO_REUSEADDR,
/// for outbound connections.
pub(crate) fn create_tcp_fd() -> io::Result<RawFd> {
    let fd = new_tcp_fd()?;
    set_tcp_nodelay(fd);
    set_reuse_addr(fd);
    Ok(fd)
}

/// Non-blocking close-on-exec TCP fd with SO_REUSEADDR only, for
/// listeners.
pub(crate) fn create_tcp_listener_fd() -> io::Result<RawFd> {
    let fd = new_tcp_fd()?;
    set_reuse_addr(fd);
    Ok(fd)
}

/// Build a `sockaddr_in` from an endpoint (host order in, network order
/// out).
pub(crate) fn sockaddr_from(endpoint: &Endpoint) -> libc::sockaddr_in {
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_addr.s_addr = endpoint.ipv4().to_be();
    addr.sin_port = endpoint.port().to_be();
    addr
}

/// Read back a socket's local name as an endpoint.
pub(crate) fn local_endpoint(fd: RawFd) -> io::Result<Endpoint> {
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockname(fd, &mut addr as *mut _ as *mut libc::sockaddr, &mut len)
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(endpoint_from(&addr))
}

/// Read back a connected socket's peer name as an endpoint.
pub(crate) fn peer_endpoint(fd: RawFd) -> io::Result<Endpoint> {
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let rc = unsafe {
        libc::getpeername(fd, &mut addr as *mut _ as *mut libc::sockaddr, &mut len)
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(endpoint_from(&addr))
}

fn endpoint_from(addr: &libc::sockaddr_in) -> Endpoint {
    Endpoint::new(u32::from_be(addr.sin_addr.s_addr), u16::from_be(addr.sin_port))
}

/// Per-socket error as reported by the kernel (SO_ERROR).
pub(crate) fn socket_error(fd: RawFd) -> i32 {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    assert_eq!(rc, 0, "getsockopt(SO_ERROR) failed");
    err
}

/// Wall-clock time in milliseconds.
pub(crate) fn now_ms() -> u64 {
    let mut tv: libc::timeval = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::gettimeofday(&mut tv, std::ptr::null_mut()) };
    assert_eq!(rc, 0, "gettimeofday failed");
    tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_fd_has_nonblock_and_cloexec() {
        let fd = create_tcp_fd().unwrap();
        unsafe {
            let fl = libc::fcntl(fd, libc::F_GETFL);
            assert!(fl & libc::O_NONBLOCK != 0);
            let fdfl = libc::fcntl(fd, libc::F_GETFD);
            assert!(fdfl & libc::FD_CLOEXEC != 0);
            libc::close(fd);
        }
    }

    #[test]
    fn sockaddr_round_trip() {
        let ep = Endpoint::parse("10.0.0.1:4242").unwrap();
        let addr = sockaddr_from(&ep);
        assert_eq!(u32::from_be(addr.sin_addr.s_addr), 0x0a00_0001);
        assert_eq!(u16::from_be(addr.sin_port), 4242);
    }

    #[test]
    fn now_ms_is_monotonic_enough() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
    }
}
