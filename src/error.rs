//! Error taxonomy for the runtime core.
//!
//! Every fallible, non-precondition operation in this crate returns
//! `Result<T, Error>`. Precondition violations (wrong thread, empty task,
//! `Coroutine::main()` called twice) are programmer errors and panic instead,
//! matching the "preconditions are raised as programmer-error exceptions,
//! never as recoverable codes" split the original C++ source makes between
//! its throwing and value-returning APIs.

use std::fmt;
use std::io;

/// The kind of a runtime [`Error`].
///
/// Mirrors the taxonomy: `Success` is never constructed in Rust (use
/// `Result::Ok` instead); the rest map directly onto the original's
/// `err_code_t` constants.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// Unclassified platform error; see the wrapped `io::Error` for detail.
    Unknown,
    /// Attempted to convert a coroutine into itself, or call `Coroutine::main()`
    /// twice on one thread, or from inside an existing coroutine.
    CoroToCoro,
    /// Attempted a coroutine-only operation (`switch_to` a coroutine) from a
    /// thread's main coroutine context where that is not meaningful.
    FromThreadToCoro,
    /// `go`/`yield_now`/`execute_io` called from outside any service coroutine.
    NotInsideSrvCoro,
    /// An operation that requires being outside a service coroutine was
    /// called from inside one.
    InsideSrvCoro,
    /// `BasicDescriptor::open` called on an already-open descriptor.
    AlreadyOpen,
    /// An operation was attempted on a descriptor that was never opened.
    NotOpen,
    /// The descriptor was closed while the operation was in flight.
    WasClosed,
    /// The owning `Service` is stopping or stopped.
    SrvStop,
    /// `restart` was called while the previous run had not fully stopped.
    InvalidState,
    /// The operation was cancelled by `cancel`, `close`, or a timeout.
    OperationAborted,
    /// The timer has already fired.
    TimerExpired,
    /// `Timer::expires_after` was called while a previous deadline is still
    /// pending.
    TimerNotExpired,
    /// An operation bound to a timeout did not complete before it elapsed.
    TimeoutExpired,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            ErrorKind::Unknown => "unknown error",
            ErrorKind::CoroToCoro => "invalid coroutine-to-coroutine transition",
            ErrorKind::FromThreadToCoro => "invalid thread-to-coroutine transition",
            ErrorKind::NotInsideSrvCoro => "not inside a service coroutine",
            ErrorKind::InsideSrvCoro => "unexpectedly inside a service coroutine",
            ErrorKind::AlreadyOpen => "descriptor already open",
            ErrorKind::NotOpen => "descriptor not open",
            ErrorKind::WasClosed => "descriptor was closed",
            ErrorKind::SrvStop => "service is stopping",
            ErrorKind::InvalidState => "service is not in a state that allows this operation",
            ErrorKind::OperationAborted => "operation aborted",
            ErrorKind::TimerExpired => "timer already expired",
            ErrorKind::TimerNotExpired => "timer not yet expired",
            ErrorKind::TimeoutExpired => "operation timed out",
        };
        f.write_str(s)
    }
}

/// A `{kind, message}` pair describing a recoverable runtime failure.
///
/// Carries the originating `io::Error` when the failure passed through a
/// syscall, so callers that want the raw errno/`GetLastError` can still get
/// at it via [`Error::source_io`].
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    io: Option<io::Error>,
}

impl Error {
    /// Construct an `Error` carrying only a `kind`.
    pub fn new(kind: ErrorKind) -> Self {
        Error { kind, io: None }
    }

    /// Construct an `Error` wrapping a platform errno.
    pub fn from_io(io: io::Error) -> Self {
        Error {
            kind: ErrorKind::Unknown,
            io: Some(io),
        }
    }

    /// Construct an `Error` of a specific `kind`, with a platform errno
    /// attached for diagnostics.
    pub fn with_io(kind: ErrorKind, io: io::Error) -> Self {
        Error {
            kind,
            io: Some(io),
        }
    }

    /// The classified error kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The platform error this was derived from, if any.
    pub fn source_io(&self) -> Option<&io::Error> {
        self.io.as_ref()
    }

    /// `true` for `OperationAborted` — a cancellation is a normal completion,
    /// not a failure the caller necessarily needs to treat specially.
    pub fn is_aborted(&self) -> bool {
        self.kind == ErrorKind::OperationAborted
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.io {
            Some(io) => write!(f, "{}: {}", self.kind, io),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.io.as_ref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl From<io::Error> for Error {
    fn from(io: io::Error) -> Self {
        Error::from_io(io)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
