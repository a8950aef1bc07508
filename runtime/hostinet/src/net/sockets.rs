//! Guest sockets backed directly by host sockets.
//!
//! Every host fd is non-blocking and close-on-exec. Blocking guest calls
//! are built from non-blocking host calls plus readiness waits, so a
//! parked guest thread never pins a host thread inside a syscall.

use std::net::Shutdown;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Instant;

use socket2::SockRef;

use crate::abi::{
    EVENT_IN, EVENT_OUT, EventMask, RECV_FLAGS_ALLOWED, SEND_FLAGS_ALLOWED, truncate_sockaddr,
};
use crate::async_rt::blocking::{Attempt, Registration, block_until_ready, suspend};
use crate::async_rt::io_poller::ReadinessNotifier;
use crate::async_rt::task::Task;
use crate::async_rt::waiter::{WaitEntry, WaiterQueue, Waitable};
use crate::error::{SysError, SysResult};
use crate::file::{
    Accepted, ControlMessages, FdFlags, FileFlags, FileOperations, ReceiveTimeout, RecvMsg,
    Socket, SocketFile,
};
use crate::net::iovec::{self, IoSequence, SockAddrBuf};
use crate::net::sockopt;

pub struct HostSocket {
    fd: OwnedFd,
    queue: Arc<WaiterQueue>,
    notifier: Arc<ReadinessNotifier>,
    recv_timeout: ReceiveTimeout,
    trace: bool,
}

impl HostSocket {
    /// Wraps a non-blocking host socket and registers it with `notifier`.
    /// On failure the fd is closed.
    pub fn new(fd: OwnedFd, notifier: Arc<ReadinessNotifier>) -> SysResult<Self> {
        let queue = Arc::new(WaiterQueue::default());
        notifier.add(fd.as_raw_fd(), Arc::clone(&queue))?;
        Ok(Self {
            fd,
            queue,
            notifier,
            recv_timeout: ReceiveTimeout::default(),
            trace: false,
        })
    }

    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    /// Number of entries currently waiting on this socket.
    pub fn waiter_count(&self) -> usize {
        self.queue.len()
    }

    fn raw(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    fn take_error(&self) -> SysResult<()> {
        match SockRef::from(&self.fd).take_error() {
            Ok(None) => Ok(()),
            Ok(Some(err)) => Err(err.into()),
            Err(err) => Err(err.into()),
        }
    }
}

impl Drop for HostSocket {
    fn drop(&mut self) {
        self.notifier.remove(self.fd.as_raw_fd());
    }
}

impl AsFd for HostSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for HostSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Waitable for HostSocket {
    fn readiness(&self, mask: EventMask) -> EventMask {
        self.notifier.poll_now(self.raw(), mask)
    }

    fn event_register(&self, entry: &WaitEntry, mask: EventMask) {
        self.queue.event_register(entry, mask);
        if let Err(err) = self.notifier.update(self.raw()) {
            log::warn!("hostinet: fd={} interest update failed: {err}", self.raw());
        }
    }

    fn event_unregister(&self, entry: &WaitEntry) {
        self.queue.event_unregister(entry);
        if let Err(err) = self.notifier.update(self.raw()) {
            log::warn!("hostinet: fd={} interest update failed: {err}", self.raw());
        }
    }

    fn check_blocking(&self) -> SysResult<()> {
        if self.notifier.is_running() {
            return Ok(());
        }
        Err(SysError::Host(libc::ESHUTDOWN))
    }
}

impl FileOperations for HostSocket {
    fn read(&self, _task: &dyn Task, dst: &dyn IoSequence) -> SysResult<usize> {
        iovec::read(self.raw(), dst)
    }

    fn write(&self, _task: &dyn Task, src: &dyn IoSequence) -> SysResult<usize> {
        iovec::write(self.raw(), src)
    }
}

impl Socket for HostSocket {
    fn connect(&self, task: &dyn Task, addr: &[u8], blocking: bool) -> SysResult<()> {
        let addr = truncate_sockaddr(addr);
        let rc = unsafe {
            libc::connect(
                self.raw(),
                addr.as_ptr().cast(),
                addr.len() as libc::socklen_t,
            )
        };
        if rc == 0 {
            return Ok(());
        }
        let err = SysError::last_os_error();
        if err != SysError::Host(libc::EINPROGRESS) || !blocking {
            return Err(err);
        }
        {
            let registration = Registration::new(self, EVENT_OUT);
            self.check_blocking()?;
            if self.readiness(EVENT_OUT) & EVENT_OUT == 0 {
                suspend(task, registration.entry(), None)?;
            }
        }
        let result = self.take_error();
        if self.trace {
            log::debug!("hostinet: connect fd={} completed: {result:?}", self.raw());
        }
        result
    }

    fn accept(
        &self,
        task: &dyn Task,
        peer_requested: bool,
        flags: i32,
        blocking: bool,
    ) -> SysResult<Accepted> {
        let mut peer = SockAddrBuf::new();
        let mut attempt = || {
            let (addr, addr_len) = if peer_requested {
                peer.reset();
                peer.raw_parts()
            } else {
                (std::ptr::null_mut(), std::ptr::null_mut())
            };
            let fd = unsafe {
                libc::accept4(
                    self.raw(),
                    addr,
                    addr_len,
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if fd < 0 {
                return Attempt::new(0, Err(SysError::last_os_error()));
            }
            Attempt::new(0, Ok(unsafe { OwnedFd::from_raw_fd(fd) }))
        };
        let fd = if blocking {
            block_until_ready(task, self, EVENT_IN, None, attempt)?
        } else {
            attempt().result?
        };
        let socket = HostSocket::new(fd, Arc::clone(&self.notifier))?.with_trace(self.trace);
        if self.trace {
            log::debug!("hostinet: accept fd={} -> fd={}", self.raw(), socket.raw());
        }
        let file = SocketFile::new(
            Box::new(socket),
            FileFlags {
                read: true,
                write: true,
                non_blocking: flags & libc::SOCK_NONBLOCK != 0,
            },
        );
        let (peer, peer_len) = if peer_requested {
            (Some(peer.to_vec()), peer.host_len())
        } else {
            (None, 0)
        };
        Ok(Accepted {
            file,
            peer,
            peer_len,
            fd_flags: FdFlags {
                close_on_exec: flags & libc::SOCK_CLOEXEC != 0,
            },
        })
    }

    fn bind(&self, _task: &dyn Task, addr: &[u8]) -> SysResult<()> {
        let addr = truncate_sockaddr(addr);
        let rc = unsafe {
            libc::bind(
                self.raw(),
                addr.as_ptr().cast(),
                addr.len() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(SysError::last_os_error());
        }
        Ok(())
    }

    fn listen(&self, _task: &dyn Task, backlog: i32) -> SysResult<()> {
        SockRef::from(&self.fd).listen(backlog)?;
        Ok(())
    }

    fn shutdown(&self, _task: &dyn Task, how: i32) -> SysResult<()> {
        let how = match how {
            libc::SHUT_RD => Shutdown::Read,
            libc::SHUT_WR => Shutdown::Write,
            libc::SHUT_RDWR => Shutdown::Both,
            _ => return Err(SysError::InvalidArgument),
        };
        SockRef::from(&self.fd).shutdown(how)?;
        Ok(())
    }

    fn get_sock_opt(
        &self,
        _task: &dyn Task,
        level: i32,
        name: i32,
        out_len: i32,
    ) -> SysResult<Vec<u8>> {
        sockopt::get_option(self.raw(), level, name, out_len)
    }

    fn set_sock_opt(&self, _task: &dyn Task, level: i32, name: i32, value: &[u8]) -> SysResult<()> {
        sockopt::set_option(self.raw(), level, name, value)
    }

    fn recv_msg(
        &self,
        task: &dyn Task,
        dst: &dyn IoSequence,
        flags: i32,
        deadline: Option<Instant>,
        sender_requested: bool,
    ) -> SysResult<RecvMsg> {
        if flags & !RECV_FLAGS_ALLOWED != 0 {
            return Err(SysError::InvalidArgument);
        }
        let mut sender = sender_requested.then(SockAddrBuf::new);
        let host_flags = flags | libc::MSG_DONTWAIT;
        let mut attempt = || {
            let result = iovec::recv(self.raw(), dst, host_flags, sender.as_mut());
            let transferred = result.as_ref().map_or(0, |(n, _)| *n);
            Attempt::new(transferred, result)
        };
        let result = if flags & libc::MSG_DONTWAIT == 0 {
            block_until_ready(task, self, EVENT_IN, deadline, attempt)
        } else {
            attempt().result
        };
        let (len, msg_flags) = result?;
        if self.trace {
            log::debug!("hostinet: recv fd={} len={len} flags={flags:#x}", self.raw());
        }
        Ok(RecvMsg {
            len,
            sender: sender.map(|buf| buf.to_vec()),
            msg_flags,
            control: ControlMessages::default(),
        })
    }

    fn send_msg(
        &self,
        task: &dyn Task,
        src: &dyn IoSequence,
        to: &[u8],
        flags: i32,
        _control: &ControlMessages,
    ) -> SysResult<usize> {
        if flags & !SEND_FLAGS_ALLOWED != 0 {
            return Err(SysError::InvalidArgument);
        }
        let to = truncate_sockaddr(to);
        let host_flags = flags | libc::MSG_DONTWAIT;
        let attempt = || Attempt::from_io(iovec::send(self.raw(), src, host_flags, to));
        let sent = if flags & libc::MSG_DONTWAIT == 0 {
            block_until_ready(task, self, EVENT_OUT, None, attempt)?
        } else {
            attempt().result?
        };
        if self.trace {
            log::debug!("hostinet: send fd={} len={sent} flags={flags:#x}", self.raw());
        }
        Ok(sent)
    }

    fn receive_timeout(&self) -> &ReceiveTimeout {
        &self.recv_timeout
    }
}
