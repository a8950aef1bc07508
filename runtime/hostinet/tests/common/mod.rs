#![allow(dead_code)]

use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use hostinet::async_rt::{Interrupter, Task, ThreadTask, WaitEntry, Wake};
use hostinet::net::{HostSocket, HostStack};
use hostinet::{BackendKind, HostNetConfig};
use socket2::{Domain, SockAddr, SockRef, Type};

/// Thread task that counts how often it was parked.
pub struct CountingTask {
    inner: ThreadTask,
    suspends: AtomicUsize,
}

impl CountingTask {
    pub fn new() -> Self {
        Self::with_backend(Some(BackendKind::HostPassthrough))
    }

    pub fn with_backend(backend: Option<BackendKind>) -> Self {
        Self {
            inner: ThreadTask::new(backend),
            suspends: AtomicUsize::new(0),
        }
    }

    pub fn suspends(&self) -> usize {
        self.suspends.load(Ordering::SeqCst)
    }

    pub fn interrupter(&self) -> Interrupter {
        self.inner.interrupter()
    }
}

impl Task for CountingTask {
    fn suspend(&self, entry: &WaitEntry, deadline: Option<Instant>) -> Wake {
        self.suspends.fetch_add(1, Ordering::SeqCst);
        self.inner.suspend(entry, deadline)
    }

    fn network_backend(&self) -> Option<BackendKind> {
        self.inner.network_backend()
    }
}

pub fn test_config() -> HostNetConfig {
    HostNetConfig {
        poll_interval: Duration::from_millis(20),
        ..HostNetConfig::default()
    }
}

pub fn stack() -> Arc<HostStack> {
    HostStack::new(&test_config()).expect("host stack")
}

pub fn host_socket(stack: &HostStack, domain: Domain, ty: Type) -> HostSocket {
    let socket = socket2::Socket::new(domain, ty.nonblocking(), None).expect("host socket");
    HostSocket::new(OwnedFd::from(socket), Arc::clone(stack.notifier())).expect("register socket")
}

pub fn sockaddr_bytes(addr: SocketAddr) -> Vec<u8> {
    let addr = SockAddr::from(addr);
    let raw = unsafe { std::slice::from_raw_parts(addr.as_ptr().cast::<u8>(), addr.len() as usize) };
    raw.to_vec()
}

pub fn local_addr(socket: &HostSocket) -> SocketAddr {
    SockRef::from(socket)
        .local_addr()
        .expect("getsockname")
        .as_socket()
        .expect("inet address")
}

pub fn loopback_any_port() -> SocketAddr {
    "127.0.0.1:0".parse().expect("loopback")
}
