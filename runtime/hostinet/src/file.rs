//! The guest file contract sockets plug into.

use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::time::{Duration, Instant};

use crate::async_rt::task::Task;
use crate::async_rt::waiter::Waitable;
use crate::error::{SysError, SysResult};
use crate::net::iovec::IoSequence;

/// Status flags of an open file description.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileFlags {
    pub read: bool,
    pub write: bool,
    pub non_blocking: bool,
}

/// Per-descriptor flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FdFlags {
    pub close_on_exec: bool,
}

/// Operations of an open guest file. Defaults are those of a file that is
/// neither seekable, a directory nor mappable.
pub trait FileOperations: Waitable + Send + Sync {
    fn read(&self, task: &dyn Task, dst: &dyn IoSequence) -> SysResult<usize>;

    fn write(&self, task: &dyn Task, src: &dyn IoSequence) -> SysResult<usize>;

    /// Called once when the last reference to the file goes away.
    fn release(self: Box<Self>) {}

    fn seek(&self, _task: &dyn Task, _offset: i64, _whence: i32) -> SysResult<i64> {
        Err(SysError::Host(libc::ESPIPE))
    }

    fn readdir(&self, _task: &dyn Task) -> SysResult<()> {
        Err(SysError::Host(libc::ENOTDIR))
    }

    fn flush(&self, _task: &dyn Task) -> SysResult<()> {
        Ok(())
    }

    fn fsync(&self, _task: &dyn Task) -> SysResult<()> {
        Err(SysError::InvalidArgument)
    }

    fn mmap(&self, _task: &dyn Task) -> SysResult<()> {
        Err(SysError::Host(libc::ENODEV))
    }
}

/// Opaque ancillary data. Host passthrough sockets neither send nor
/// receive it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlMessages {
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecvMsg {
    pub len: usize,
    /// Source address, present when requested. Empty for connected stream
    /// sockets.
    pub sender: Option<Vec<u8>>,
    pub msg_flags: i32,
    pub control: ControlMessages,
}

/// A connection returned by `accept`.
pub struct Accepted {
    pub file: SocketFile,
    pub peer: Option<Vec<u8>>,
    /// Peer address length reported by the host.
    pub peer_len: u32,
    pub fd_flags: FdFlags,
}

/// Receive timeout in nanoseconds; zero means none.
#[derive(Debug, Default)]
pub struct ReceiveTimeout {
    nanos: AtomicI64,
}

impl ReceiveTimeout {
    pub fn set(&self, nanos: i64) {
        self.nanos.store(nanos.max(0), AtomicOrdering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.nanos.load(AtomicOrdering::Relaxed)
    }

    /// Deadline for a receive starting at `now`, if a timeout is set.
    pub fn deadline_from(&self, now: Instant) -> Option<Instant> {
        match self.get() {
            0 => None,
            nanos => now.checked_add(Duration::from_nanos(nanos as u64)),
        }
    }
}

/// Socket operations on top of the file contract.
///
/// Address arguments are raw `sockaddr` bytes. Longer addresses than the
/// host supports are truncated before use.
pub trait Socket: FileOperations {
    fn connect(&self, task: &dyn Task, addr: &[u8], blocking: bool) -> SysResult<()>;

    /// `flags` takes `SOCK_NONBLOCK` and `SOCK_CLOEXEC` for the new file.
    fn accept(
        &self,
        task: &dyn Task,
        peer_requested: bool,
        flags: i32,
        blocking: bool,
    ) -> SysResult<Accepted>;

    fn bind(&self, task: &dyn Task, addr: &[u8]) -> SysResult<()>;

    fn listen(&self, task: &dyn Task, backlog: i32) -> SysResult<()>;

    fn shutdown(&self, task: &dyn Task, how: i32) -> SysResult<()>;

    fn get_sock_opt(&self, task: &dyn Task, level: i32, name: i32, out_len: i32)
    -> SysResult<Vec<u8>>;

    fn set_sock_opt(&self, task: &dyn Task, level: i32, name: i32, value: &[u8]) -> SysResult<()>;

    fn recv_msg(
        &self,
        task: &dyn Task,
        dst: &dyn IoSequence,
        flags: i32,
        deadline: Option<Instant>,
        sender_requested: bool,
    ) -> SysResult<RecvMsg>;

    fn send_msg(
        &self,
        task: &dyn Task,
        src: &dyn IoSequence,
        to: &[u8],
        flags: i32,
        control: &ControlMessages,
    ) -> SysResult<usize>;

    /// The guest's `SO_RCVTIMEO`. Callers of `recv_msg` that have no
    /// explicit deadline derive one with [`ReceiveTimeout::deadline_from`].
    fn receive_timeout(&self) -> &ReceiveTimeout;
}

/// An open socket file: the socket plus its file status flags.
pub struct SocketFile {
    ops: Box<dyn Socket>,
    flags: FileFlags,
}

impl SocketFile {
    pub fn new(ops: Box<dyn Socket>, flags: FileFlags) -> Self {
        Self { ops, flags }
    }

    pub fn flags(&self) -> FileFlags {
        self.flags
    }

    pub fn ops(&self) -> &dyn Socket {
        self.ops.as_ref()
    }

    /// Drops the file, releasing the underlying socket.
    pub fn release(self) {
        self.ops.release();
    }
}

impl std::fmt::Debug for SocketFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketFile")
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receive_timeout_zero_means_none() {
        let timeout = ReceiveTimeout::default();
        let now = Instant::now();
        assert_eq!(timeout.deadline_from(now), None);
        timeout.set(5_000_000);
        assert_eq!(timeout.get(), 5_000_000);
        assert_eq!(
            timeout.deadline_from(now),
            Some(now + Duration::from_millis(5))
        );
        timeout.set(-3);
        assert_eq!(timeout.get(), 0);
    }
}
