use std::io;

use thiserror::Error;

/// Error returned to the guest by socket operations.
///
/// The named variants are the conditions the socket layer produces or
/// inspects itself; everything else the host reports is carried as a raw
/// errno.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SysError {
    #[error("operation would block")]
    WouldBlock,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("protocol option not available")]
    ProtocolOptionNotAvailable,
    #[error("interrupted")]
    Interrupted,
    #[error("timed out")]
    Timeout,
    #[error("address family not supported")]
    AddressFamilyNotSupported,
    #[error("operation not supported")]
    NotSupported,
    #[error("host error (errno {0})")]
    Host(i32),
}

pub type SysResult<T> = Result<T, SysError>;

impl SysError {
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            e if e == libc::EAGAIN || e == libc::EWOULDBLOCK => SysError::WouldBlock,
            libc::EINVAL => SysError::InvalidArgument,
            libc::ENOPROTOOPT => SysError::ProtocolOptionNotAvailable,
            libc::EINTR => SysError::Interrupted,
            libc::ETIMEDOUT => SysError::Timeout,
            libc::EAFNOSUPPORT => SysError::AddressFamilyNotSupported,
            libc::EOPNOTSUPP => SysError::NotSupported,
            other => SysError::Host(other),
        }
    }

    pub fn errno(self) -> i32 {
        match self {
            SysError::WouldBlock => libc::EAGAIN,
            SysError::InvalidArgument => libc::EINVAL,
            SysError::ProtocolOptionNotAvailable => libc::ENOPROTOOPT,
            SysError::Interrupted => libc::EINTR,
            SysError::Timeout => libc::ETIMEDOUT,
            SysError::AddressFamilyNotSupported => libc::EAFNOSUPPORT,
            SysError::NotSupported => libc::EOPNOTSUPP,
            SysError::Host(errno) => errno,
        }
    }

    /// Reads `errno` left behind by the last raw libc call.
    pub(crate) fn last_os_error() -> Self {
        SysError::from(io::Error::last_os_error())
    }
}

impl From<io::Error> for SysError {
    fn from(err: io::Error) -> Self {
        if let Some(errno) = err.raw_os_error() {
            return SysError::from_errno(errno);
        }
        match err.kind() {
            io::ErrorKind::WouldBlock => SysError::WouldBlock,
            io::ErrorKind::InvalidInput => SysError::InvalidArgument,
            io::ErrorKind::Interrupted => SysError::Interrupted,
            io::ErrorKind::TimedOut => SysError::Timeout,
            io::ErrorKind::Unsupported => SysError::NotSupported,
            _ => SysError::Host(libc::EIO),
        }
    }
}

impl From<SysError> for io::Error {
    fn from(err: SysError) -> Self {
        io::Error::from_raw_os_error(err.errno())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eagain_and_ewouldblock_are_would_block() {
        assert_eq!(SysError::from_errno(libc::EAGAIN), SysError::WouldBlock);
        assert_eq!(SysError::from_errno(libc::EWOULDBLOCK), SysError::WouldBlock);
    }

    #[test]
    fn named_variants_round_trip_through_errno() {
        for err in [
            SysError::WouldBlock,
            SysError::InvalidArgument,
            SysError::ProtocolOptionNotAvailable,
            SysError::Interrupted,
            SysError::Timeout,
            SysError::AddressFamilyNotSupported,
            SysError::NotSupported,
        ] {
            assert_eq!(SysError::from_errno(err.errno()), err);
        }
    }

    #[test]
    fn unknown_errno_is_kept() {
        let err = SysError::from_errno(libc::ECONNREFUSED);
        assert_eq!(err, SysError::Host(libc::ECONNREFUSED));
        assert_eq!(err.errno(), libc::ECONNREFUSED);
    }

    #[test]
    fn io_errors_convert_by_errno_first() {
        let err = io::Error::from_raw_os_error(libc::EINPROGRESS);
        assert_eq!(SysError::from(err), SysError::Host(libc::EINPROGRESS));
        let err = io::Error::new(io::ErrorKind::WouldBlock, "later");
        assert_eq!(SysError::from(err), SysError::WouldBlock);
    }
}
