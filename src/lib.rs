// Copyright 2015-2016 Dawid Ciężarkiewicz <dpc@dpc.pw>
// See LICENSE-MPL2 file for more information.

//! # rt-coro
//!
//! A scalable, coroutine-based, asynchronous I/O runtime for network
//! servers. Tasks are written as straight-line, blocking-looking code;
//! the runtime transparently suspends a task when the underlying socket
//! or synchronization primitive isn't ready and resumes it once it is,
//! multiplexing many thousands of these tasks over a small pool of OS
//! threads.
//!
//! Unlike `mioco`, the crate this one started from, the runtime owns its
//! reactor directly (four bound-together epoll instances on Linux, rather
//! than delegating to `mio::EventLoop`) and schedules coroutines through a
//! lock-free ready queue shared by every worker thread, rather than a
//! per-thread `mio` channel.
//!
//! # Layers
//!
//! * [`lf`] — lock-free forward list, Treiber stack, Michael-Scott queue,
//!   and the epoch-based deferred deleter that backs their safe memory
//!   reclamation.
//! * [`coroutine`] — the stackful, symmetric coroutine primitive.
//! * [`timer_queue`] — the process-wide time-task queue.
//! * [`service`] — the thread pool, ready queue, and reactor; [`Service`]
//!   is the entry point for running a batch of coroutines.
//! * [`descriptor`] — `BasicDescriptor` and `execute_io`, the
//!   suspend-on-`EAGAIN` loop every socket operation is built from.
//! * [`sync`] — `Mutex`, `SharedMutex`, `Semaphore`, `Event`, re-exporting
//!   [`timer::Timer`].
//! * [`tcp`], [`udp`] — concrete socket types built on [`descriptor`] and
//!   the thin [`inet`] facade.
//!
//! # Example
//!
//! See `demos/echo.rs` for a TCP echo server built on this crate.
//!
//! ```no_run
//! use rt_coro::service::{Config, Service};
//!
//! let svc = Service::new(Config::default()).unwrap();
//! svc.add_coro(|| {
//!     println!("hello from a coroutine");
//! });
//! svc.run().unwrap();
//! ```

#![warn(missing_docs)]
#![allow(clippy::missing_safety_doc)]

/// Error taxonomy (§6 of the design) returned by every fallible,
/// non-precondition operation in this crate.
pub mod error;
/// CR-TLS: per-thread coroutine/service pointers, the crate's only
/// process-wide global state.
pub mod tls;

/// CR: the stackful, symmetric coroutine primitive.
pub mod coroutine;

/// LF: lock-free containers (forward list, stack, queue) and the
/// epoch-based deferred deleter backing their memory reclamation.
pub mod lf;

/// TQ: the process-wide time-task queue used by timers and I/O timeouts.
pub mod timer_queue;

/// The epoll-backed reactor (Linux only for now; see `DESIGN.md` Open
/// Question 3 for the IOCP gap).
#[cfg(unix)]
pub mod reactor;

/// SV: the thread pool, ready queue, and descriptor registry.
#[cfg(unix)]
pub mod service;

/// DS: `BasicDescriptor` and `execute_io`.
#[cfg(unix)]
pub mod descriptor;

/// Shared suspend/resume plumbing used by [`sync`] and [`timer`].
#[cfg(unix)]
mod blocking;

/// DS synchronization primitives: `Mutex`, `SharedMutex`, `Semaphore`,
/// `Event`, and (re-exported) `Timer`.
#[cfg(unix)]
pub mod sync;

/// `Timer`, the sync primitive built on [`timer_queue`].
#[cfg(unix)]
pub mod timer;

/// Thin IPv4 socket facade (address conversion, raw `socket`/`bind`/
/// `listen`/`connect`/`accept`/`sendto`/`recvfrom`), out of the core's
/// scope but needed by [`tcp`]/[`udp`].
#[cfg(unix)]
pub mod inet;

/// TCP listener/stream built on [`descriptor`] and [`inet`].
#[cfg(unix)]
pub mod tcp;

/// UDP socket built on [`descriptor`] and [`inet`].
#[cfg(unix)]
pub mod udp;

#[cfg(unix)]
pub use service::{go, yield_coro, Config, Service};
#[cfg(unix)]
pub use tls::in_coroutine;

/// Returns a pointer identifying the coroutine currently running on this
/// thread, or `None` if this thread is not inside any coroutine (main or
/// otherwise). Intended for logging/diagnostics; the pointer is only
/// meaningful as an identity, never for dereferencing outside this crate.
#[cfg(unix)]
pub fn current_coro_id() -> Option<usize> {
    tls::current_coroutine().map(|p| p as usize)
}
