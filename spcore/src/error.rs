use std::io;
use thiserror::Error;

/// The error taxonomy shared by every layer of the stack. Providers never panic on I/O
///  failures; they finish the pending operation with one of these values, and callers
///  translate into their own return model.
///
/// The numeric codes (see [`SpError::code`]) are stable across releases and bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum SpError {
    #[error("object closed")]
    Closed,
    #[error("operation timed out")]
    TimedOut,
    #[error("operation canceled")]
    Canceled,
    #[error("object stopped")]
    Stopped,
    #[error("out of memory")]
    NoMemory,
    #[error("invalid address")]
    InvalidAddress,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("resource busy")]
    Busy,
    #[error("not supported")]
    NotSupported,
    #[error("protocol error")]
    ProtocolError,
    #[error("connection shut down")]
    ConnShutdown,
    #[error("connection refused")]
    ConnRefused,
    #[error("message too big")]
    MsgTooBig,
    #[error("permission denied")]
    PermissionDenied,
    #[error("address already in use")]
    AddrInUse,
    #[error("too many open files")]
    NoFiles,
}

impl SpError {
    /// Stable numeric code for this error, identical across language bindings.
    pub fn code(self) -> u32 {
        match self {
            SpError::Closed => 1,
            SpError::TimedOut => 2,
            SpError::Canceled => 3,
            SpError::Stopped => 4,
            SpError::NoMemory => 5,
            SpError::InvalidAddress => 6,
            SpError::InvalidArgument => 7,
            SpError::Busy => 8,
            SpError::NotSupported => 9,
            SpError::ProtocolError => 10,
            SpError::ConnShutdown => 11,
            SpError::ConnRefused => 12,
            SpError::MsgTooBig => 13,
            SpError::PermissionDenied => 14,
            SpError::AddrInUse => 15,
            SpError::NoFiles => 16,
        }
    }

    /// Transient errors are surfaced to the pending operation and the endpoint re-arms
    ///  (a dialer reconnects, a listener goes back to accepting).
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            SpError::TimedOut | SpError::Canceled | SpError::ConnShutdown | SpError::ConnRefused
        )
    }

    /// Lifecycle errors reported to pending operations during teardown.
    pub fn is_lifecycle(self) -> bool {
        matches!(self, SpError::Closed | SpError::Stopped)
    }

    pub fn from_io(e: &io::Error) -> SpError {
        match e.kind() {
            io::ErrorKind::ConnectionRefused => SpError::ConnRefused,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => SpError::ConnShutdown,
            io::ErrorKind::AddrInUse => SpError::AddrInUse,
            io::ErrorKind::AddrNotAvailable => SpError::InvalidAddress,
            io::ErrorKind::PermissionDenied => SpError::PermissionDenied,
            io::ErrorKind::TimedOut => SpError::TimedOut,
            io::ErrorKind::InvalidInput => SpError::InvalidArgument,
            io::ErrorKind::OutOfMemory => SpError::NoMemory,
            io::ErrorKind::NotFound => SpError::InvalidAddress,
            _ => {
                if e.raw_os_error() == Some(libc_emfile()) {
                    SpError::NoFiles
                } else {
                    SpError::ConnShutdown
                }
            }
        }
    }
}

#[cfg(unix)]
fn libc_emfile() -> i32 {
    24 // EMFILE
}

#[cfg(not(unix))]
fn libc_emfile() -> i32 {
    -1
}

pub type SpResult<T> = Result<T, SpError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(SpError::Closed, 1)]
    #[case(SpError::TimedOut, 2)]
    #[case(SpError::Stopped, 4)]
    #[case(SpError::MsgTooBig, 13)]
    #[case(SpError::NoFiles, 16)]
    fn test_stable_codes(#[case] err: SpError, #[case] code: u32) {
        assert_eq!(err.code(), code);
    }

    #[rstest]
    #[case(io::ErrorKind::ConnectionRefused, SpError::ConnRefused)]
    #[case(io::ErrorKind::ConnectionReset, SpError::ConnShutdown)]
    #[case(io::ErrorKind::AddrInUse, SpError::AddrInUse)]
    #[case(io::ErrorKind::PermissionDenied, SpError::PermissionDenied)]
    fn test_from_io(#[case] kind: io::ErrorKind, #[case] expected: SpError) {
        assert_eq!(SpError::from_io(&io::Error::from(kind)), expected);
    }

    #[test]
    fn test_classification() {
        assert!(SpError::TimedOut.is_transient());
        assert!(SpError::ConnShutdown.is_transient());
        assert!(!SpError::ProtocolError.is_transient());
        assert!(SpError::Closed.is_lifecycle());
        assert!(!SpError::Busy.is_lifecycle());
    }
}
