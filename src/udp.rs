//! UDP descriptor built on [`crate::descriptor::BasicDescriptor`] and
//! [`crate::inet`] — see `tcp.rs`'s module doc for scope/grounding notes.

use std::net::SocketAddrV4;

use crate::descriptor::BasicDescriptor;
use crate::error::{Error, ErrorKind, Result};
use crate::inet;
use crate::reactor::Interest;

pub struct UdpSocket {
    desc: BasicDescriptor,
}

impl UdpSocket {
    /// Bind to `addr`. Must be called from inside a running service
    /// coroutine.
    pub fn bind(addr: SocketAddrV4) -> Result<Self> {
        let desc = BasicDescriptor::new()?;
        desc.open(|| {
            let fd = inet::new_udp_socket()?;
            inet::set_reuseaddr(fd)?;
            inet::bind(fd, addr)?;
            Ok(fd)
        })?;
        Ok(UdpSocket { desc })
    }

    pub fn send_to(&self, buf: &[u8], addr: SocketAddrV4) -> Result<usize> {
        self.desc
            .execute_io(Interest::Write, |fd| inet::send_to(fd, buf, addr))
    }

    pub fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddrV4)> {
        self.desc
            .execute_io(Interest::Read, |fd| inet::recv_from(fd, buf))
    }

    pub fn local_addr(&self) -> Result<SocketAddrV4> {
        let fd = self
            .desc
            .raw_fd()
            .ok_or_else(|| Error::new(ErrorKind::NotOpen))?;
        inet::local_addr(fd).map_err(Error::from_io)
    }

    pub fn close(&self) -> Result<()> {
        self.desc.close()
    }

    pub fn cancel(&self) {
        self.desc.cancel()
    }

    pub fn is_open(&self) -> bool {
        self.desc.is_open()
    }
}
