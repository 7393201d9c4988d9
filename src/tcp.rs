//! TCP descriptor subclasses built on [`crate::descriptor::BasicDescriptor`]
//! and [`crate::inet`] (§4.6's consumer side — out of this crate's core
//! scope per §1, kept here only so `demos/echo.rs` and the integration tests
//! have a concrete socket type to drive through the reactor).
//!
//! Grounded on `mioco::tcp`'s `TcpListener`/`TcpStream` naming (the module
//! itself was not present in the retrieval pack; rebuilt from `lib.rs`'s
//! module declaration and `demos/echo.rs`'s usage).

use std::io;
use std::net::SocketAddrV4;

use crate::descriptor::BasicDescriptor;
use crate::error::{Error, Result};
use crate::inet;
use crate::reactor::Interest;

/// A listening TCP socket.
pub struct TcpListener {
    desc: BasicDescriptor,
}

impl TcpListener {
    /// Bind and listen on `addr`. Must be called from inside a running
    /// service coroutine.
    pub fn bind(addr: SocketAddrV4) -> Result<Self> {
        let desc = BasicDescriptor::new()?;
        desc.open(|| {
            let fd = inet::new_tcp_socket()?;
            inet::set_reuseaddr(fd)?;
            inet::bind(fd, addr)?;
            inet::listen(fd, 128)?;
            Ok(fd)
        })?;
        Ok(TcpListener { desc })
    }

    /// Accept one incoming connection, suspending the calling coroutine
    /// until one arrives.
    pub fn accept(&self) -> Result<(TcpStream, SocketAddrV4)> {
        let (client_fd, peer) = self.desc.execute_io(Interest::Read, inet::accept)?;
        let client_desc = BasicDescriptor::new()?;
        client_desc.open(|| Ok(client_fd))?;
        Ok((TcpStream { desc: client_desc }, peer))
    }

    pub fn local_addr(&self) -> Result<SocketAddrV4> {
        let fd = self.desc.raw_fd().ok_or_else(|| {
            Error::new(crate::error::ErrorKind::NotOpen)
        })?;
        inet::local_addr(fd).map_err(Error::from_io)
    }

    pub fn close(&self) -> Result<()> {
        self.desc.close()
    }
}

/// A connected (or connecting) TCP stream.
pub struct TcpStream {
    desc: BasicDescriptor,
}

impl TcpStream {
    /// Connect to `addr`, suspending until the connection resolves.
    pub fn connect(addr: SocketAddrV4) -> Result<Self> {
        let desc = BasicDescriptor::new()?;
        desc.open(inet::new_tcp_socket)?;
        let fd = desc.raw_fd().expect("just-opened descriptor has an fd");

        match inet::connect(fd, addr) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                // `connect` is in progress (EINPROGRESS); there is no syscall
                // to retry here, only a readiness condition to wait for, so
                // the first pass through `execute_io`'s task deliberately
                // reports "would block" to force one suspend-until-writable
                // cycle, then checks SO_ERROR for real on the retry.
                let mut checked = false;
                desc.execute_io(Interest::Write, move |fd| {
                    if !checked {
                        checked = true;
                        return Err(io::Error::from_raw_os_error(libc::EWOULDBLOCK));
                    }
                    inet::take_socket_error(fd)
                })?;
            }
            Err(e) => return Err(Error::from_io(e)),
        }
        Ok(TcpStream { desc })
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.desc.execute_io(Interest::Read, |fd| inet::read(fd, buf))
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        self.desc
            .execute_io(Interest::Write, |fd| inet::write(fd, buf))
    }

    pub fn close(&self) -> Result<()> {
        self.desc.close()
    }

    pub fn is_open(&self) -> bool {
        self.desc.is_open()
    }
}
