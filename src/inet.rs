//! Thin IPv4 socket facade: address conversion plus the raw `socket`/`bind`/
//! `listen`/`connect`/`accept4`/`sendto`/`recvfrom` calls `tcp.rs`/`udp.rs`
//! build their descriptors from.
//!
//! Grounded on the original C++ `Inet.hpp`/`InetLinux.cpp`: kept deliberately
//! thin (IPv4 only, no `getaddrinfo`/hostname resolution) since the socket
//! layer is explicitly out of this crate's core scope (§1) — it exists only
//! so `tcp.rs`/`udp.rs` have somewhere to anchor real file descriptors for
//! `descriptor::BasicDescriptor` to drive through the reactor.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::io::RawFd;

pub(crate) fn to_sockaddr_in(addr: SocketAddrV4) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: addr.port().to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from_ne_bytes(addr.ip().octets()),
        },
        sin_zero: [0; 8],
    }
}

pub(crate) fn from_sockaddr_in(raw: &libc::sockaddr_in) -> SocketAddrV4 {
    let ip = Ipv4Addr::from(raw.sin_addr.s_addr.to_ne_bytes());
    SocketAddrV4::new(ip, u16::from_be(raw.sin_port))
}

fn last_err() -> io::Error {
    io::Error::last_os_error()
}

/// `socket(AF_INET, SOCK_STREAM | SOCK_NONBLOCK | SOCK_CLOEXEC, 0)`.
pub(crate) fn new_tcp_socket() -> io::Result<RawFd> {
    let fd = unsafe {
        libc::socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(last_err());
    }
    Ok(fd)
}

/// `socket(AF_INET, SOCK_DGRAM | SOCK_CLOEXEC, 0)`.
pub(crate) fn new_udp_socket() -> io::Result<RawFd> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(last_err());
    }
    Ok(fd)
}

pub(crate) fn set_reuseaddr(fd: RawFd) -> io::Result<()> {
    let on: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &on as *const _ as *const libc::c_void,
            mem::size_of_val(&on) as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(last_err());
    }
    Ok(())
}

pub(crate) fn bind(fd: RawFd, addr: SocketAddrV4) -> io::Result<()> {
    let raw = to_sockaddr_in(addr);
    let rc = unsafe {
        libc::bind(
            fd,
            &raw as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(last_err());
    }
    Ok(())
}

pub(crate) fn listen(fd: RawFd, backlog: i32) -> io::Result<()> {
    let rc = unsafe { libc::listen(fd, backlog) };
    if rc < 0 {
        return Err(last_err());
    }
    Ok(())
}

/// A single non-blocking `connect` attempt. `EINPROGRESS` is reported as
/// `WouldBlock` so `execute_io`'s suspend loop treats it the same as
/// `EAGAIN` — the descriptor becomes writable once the connection resolves.
pub(crate) fn connect(fd: RawFd, addr: SocketAddrV4) -> io::Result<()> {
    let raw = to_sockaddr_in(addr);
    let rc = unsafe {
        libc::connect(
            fd,
            &raw as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        let err = last_err();
        if err.raw_os_error() == Some(libc::EINPROGRESS) {
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        return Err(err);
    }
    Ok(())
}

/// Read back `SO_ERROR` after a non-blocking connect's fd becomes writable,
/// to distinguish "connected" from "failed asynchronously".
pub(crate) fn take_socket_error(fd: RawFd) -> io::Result<()> {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc < 0 {
        return Err(last_err());
    }
    if err != 0 {
        return Err(io::Error::from_raw_os_error(err));
    }
    Ok(())
}

pub(crate) fn accept(fd: RawFd) -> io::Result<(RawFd, SocketAddrV4)> {
    let mut raw: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let client = unsafe {
        libc::accept4(
            fd,
            &mut raw as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_CLOEXEC,
        )
    };
    if client < 0 {
        return Err(last_err());
    }
    Ok((client, from_sockaddr_in(&raw)))
}

pub(crate) fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        return Err(last_err());
    }
    Ok(n as usize)
}

pub(crate) fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if n < 0 {
        return Err(last_err());
    }
    Ok(n as usize)
}

pub(crate) fn send_to(fd: RawFd, buf: &[u8], addr: SocketAddrV4) -> io::Result<usize> {
    let raw = to_sockaddr_in(addr);
    let n = unsafe {
        libc::sendto(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            0,
            &raw as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if n < 0 {
        return Err(last_err());
    }
    Ok(n as usize)
}

pub(crate) fn recv_from(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, SocketAddrV4)> {
    let mut raw: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let n = unsafe {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            0,
            &mut raw as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut len,
        )
    };
    if n < 0 {
        return Err(last_err());
    }
    Ok((n as usize, from_sockaddr_in(&raw)))
}

pub(crate) fn local_addr(fd: RawFd) -> io::Result<SocketAddrV4> {
    let mut raw: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockname(
            fd,
            &mut raw as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut len,
        )
    };
    if rc < 0 {
        return Err(last_err());
    }
    Ok(from_sockaddr_in(&raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sockaddr_round_trips() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 4242);
        let raw = to_sockaddr_in(addr);
        assert_eq!(from_sockaddr_in(&raw), addr);
    }
}
