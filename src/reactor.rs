//! SV's reactor: Linux epoll today, a documented stub for everything else.
//!
//! Four epoll instances bound together: one master plus three specialized
//! for read, write, and read-out-of-band readiness (§4.5). The three
//! sub-epolls use edge-triggered `EPOLLONESHOT`; the master observes the
//! wakeup pipe and the three sub-epolls through `EPOLL_CTL_ADD`d fds of its
//! own. A single epoll with per-class bits in one mask would avoid running
//! three kernel tables, but that is not what this is grounded on — kept as
//! three sub-epolls deliberately, not "fixed".

use std::io;
use std::os::unix::io::RawFd;

/// One of the three readiness classes a descriptor can wait on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
    ReadOob,
}

/// An event the reactor delivered: which fd, which class, fired together
/// (a single `epoll_wait` return can report several).
#[derive(Debug, Clone, Copy)]
pub struct ReadyEvent {
    pub fd: RawFd,
    pub interest: Interest,
}

fn epoll_event(interest: Interest) -> u32 {
    match interest {
        Interest::Read => (libc::EPOLLIN | libc::EPOLLET | libc::EPOLLONESHOT) as u32,
        Interest::Write => (libc::EPOLLOUT | libc::EPOLLET | libc::EPOLLONESHOT) as u32,
        Interest::ReadOob => (libc::EPOLLPRI | libc::EPOLLET | libc::EPOLLONESHOT) as u32,
    }
}

struct SubEpoll {
    fd: RawFd,
    interest: Interest,
}

impl SubEpoll {
    fn new(interest: Interest) -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(SubEpoll { fd, interest })
    }

    fn add(&self, target_fd: RawFd) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: epoll_event(self.interest),
            u64: target_fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.fd, libc::EPOLL_CTL_ADD, target_fd, &mut ev) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Rearm the one-shot registration for `target_fd` (§4.6 step 5).
    fn rearm(&self, target_fd: RawFd) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: epoll_event(self.interest),
            u64: target_fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.fd, libc::EPOLL_CTL_MOD, target_fd, &mut ev) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn remove(&self, target_fd: RawFd) {
        unsafe {
            libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, target_fd, std::ptr::null_mut());
        }
    }
}

impl Drop for SubEpoll {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// The master epoll plus its three children, and the wakeup pipe's read end
/// registered into the master.
pub struct Reactor {
    master: RawFd,
    read: SubEpoll,
    write: SubEpoll,
    read_oob: SubEpoll,
    wakeup_fd: RawFd,
}

const TOKEN_WAKEUP: u64 = u64::MAX;
const TOKEN_READ: u64 = u64::MAX - 1;
const TOKEN_WRITE: u64 = u64::MAX - 2;
const TOKEN_READ_OOB: u64 = u64::MAX - 3;

impl Reactor {
    pub fn new(wakeup_fd: RawFd) -> io::Result<Self> {
        let master = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if master < 0 {
            return Err(io::Error::last_os_error());
        }
        let read = SubEpoll::new(Interest::Read)?;
        let write = SubEpoll::new(Interest::Write)?;
        let read_oob = SubEpoll::new(Interest::ReadOob)?;

        register_child(master, read.fd, TOKEN_READ)?;
        register_child(master, write.fd, TOKEN_WRITE)?;
        register_child(master, read_oob.fd, TOKEN_READ_OOB)?;

        let mut wakeup_ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: TOKEN_WAKEUP,
        };
        let rc = unsafe {
            libc::epoll_ctl(master, libc::EPOLL_CTL_ADD, wakeup_fd, &mut wakeup_ev)
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(master) };
            return Err(err);
        }

        Ok(Reactor {
            master,
            read,
            write,
            read_oob,
            wakeup_fd,
        })
    }

    fn sub(&self, interest: Interest) -> &SubEpoll {
        match interest {
            Interest::Read => &self.read,
            Interest::Write => &self.write,
            Interest::ReadOob => &self.read_oob,
        }
    }

    pub fn register(&self, fd: RawFd) -> io::Result<()> {
        self.read.add(fd)?;
        self.write.add(fd)?;
        self.read_oob.add(fd)?;
        Ok(())
    }

    pub fn unregister(&self, fd: RawFd) {
        self.read.remove(fd);
        self.write.remove(fd);
        self.read_oob.remove(fd);
    }

    pub fn rearm(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.sub(interest).rearm(fd)
    }

    /// Block until the wakeup pipe has data or a sub-epoll reports readiness.
    /// `timeout_ms` of -1 blocks indefinitely, matching `epoll_wait`.
    pub fn wait(&self, timeout_ms: i32, out: &mut Vec<ReadyEvent>) -> io::Result<bool> {
        out.clear();
        let mut master_events: [libc::epoll_event; 8] = unsafe { std::mem::zeroed() };
        let n = unsafe {
            libc::epoll_wait(
                self.master,
                master_events.as_mut_ptr(),
                master_events.len() as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(err);
        }

        let mut woke = false;
        for ev in &master_events[..n as usize] {
            match ev.u64 {
                TOKEN_WAKEUP => woke = true,
                TOKEN_READ => self.drain_sub(&self.read, Interest::Read, out),
                TOKEN_WRITE => self.drain_sub(&self.write, Interest::Write, out),
                TOKEN_READ_OOB => self.drain_sub(&self.read_oob, Interest::ReadOob, out),
                _ => {}
            }
        }
        Ok(woke)
    }

    fn drain_sub(&self, sub: &SubEpoll, interest: Interest, out: &mut Vec<ReadyEvent>) {
        let mut events: [libc::epoll_event; 64] = unsafe { std::mem::zeroed() };
        loop {
            let n = unsafe { libc::epoll_wait(sub.fd, events.as_mut_ptr(), events.len() as i32, 0) };
            if n <= 0 {
                break;
            }
            for ev in &events[..n as usize] {
                out.push(ReadyEvent {
                    fd: ev.u64 as RawFd,
                    interest,
                });
            }
            if (n as usize) < events.len() {
                break;
            }
        }
    }
}

fn register_child(master: RawFd, child_fd: RawFd, token: u64) -> io::Result<()> {
    let mut ev = libc::epoll_event {
        events: libc::EPOLLIN as u32,
        u64: token,
    };
    let rc = unsafe { libc::epoll_ctl(master, libc::EPOLL_CTL_ADD, child_fd, &mut ev) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

impl Drop for Reactor {
    fn drop(&mut self) {
        unsafe {
            libc::epoll_ctl(self.master, libc::EPOLL_CTL_DEL, self.wakeup_fd, std::ptr::null_mut());
            libc::close(self.master);
        }
    }
}

unsafe impl Send for Reactor {}
unsafe impl Sync for Reactor {}
