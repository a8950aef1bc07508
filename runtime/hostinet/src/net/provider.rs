//! Socket providers and the per-family registry.

use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use socket2::{Domain, Type};

use crate::abi::SOCK_TYPE_MASK;
use crate::async_rt::io_poller::ReadinessNotifier;
use crate::async_rt::task::Task;
use crate::config::{BackendKind, HostNetConfig};
use crate::error::{SysError, SysResult};
use crate::file::{FileFlags, SocketFile};
use crate::net::sockets::HostSocket;
use crate::state::metrics;

/// Creates sockets for one address family. `None` means "not mine", so
/// the registry can try the next provider.
pub trait Provider: Send + Sync {
    fn socket(&self, task: &dyn Task, stype: i32, protocol: i32) -> SysResult<Option<SocketFile>>;

    fn pair(
        &self,
        task: &dyn Task,
        stype: i32,
        protocol: i32,
    ) -> SysResult<Option<(SocketFile, SocketFile)>>;
}

/// Shared state of the host passthrough stack.
pub struct HostStack {
    notifier: Arc<ReadinessNotifier>,
    trace_socket: bool,
    registered: AtomicBool,
}

impl HostStack {
    pub fn new(config: &HostNetConfig) -> SysResult<Arc<Self>> {
        metrics::init_profiling(config.profile);
        let notifier = ReadinessNotifier::new(config)?;
        Ok(Arc::new(Self {
            notifier,
            trace_socket: config.trace_socket,
            registered: AtomicBool::new(false),
        }))
    }

    pub fn notifier(&self) -> &Arc<ReadinessNotifier> {
        &self.notifier
    }

    /// Adds host providers for IPv4 and IPv6. Only the first call has an
    /// effect.
    pub fn register_providers(self: &Arc<Self>, mut builder: RegistryBuilder) -> RegistryBuilder {
        if self.registered.swap(true, AtomicOrdering::SeqCst) {
            log::warn!("hostinet: providers already registered");
            return builder;
        }
        for family in [libc::AF_INET, libc::AF_INET6] {
            builder = builder.register(family, Arc::new(HostProvider::new(family, Arc::clone(self))));
        }
        builder
    }

    pub fn shutdown(&self) {
        self.notifier.shutdown();
    }
}

impl Drop for HostStack {
    fn drop(&mut self) {
        self.notifier.shutdown();
    }
}

/// Provider handing out host sockets of one family.
pub struct HostProvider {
    family: i32,
    stack: Arc<HostStack>,
}

impl HostProvider {
    pub fn new(family: i32, stack: Arc<HostStack>) -> Self {
        Self { family, stack }
    }
}

fn supported(base: i32, protocol: i32) -> bool {
    matches!(
        (base, protocol),
        (libc::SOCK_STREAM, 0 | libc::IPPROTO_TCP) | (libc::SOCK_DGRAM, 0 | libc::IPPROTO_UDP)
    )
}

impl Provider for HostProvider {
    fn socket(&self, task: &dyn Task, stype: i32, protocol: i32) -> SysResult<Option<SocketFile>> {
        if task.network_backend() != Some(BackendKind::HostPassthrough) {
            return Ok(None);
        }
        let base = stype & SOCK_TYPE_MASK;
        if !supported(base, protocol) {
            return Ok(None);
        }
        // socket2 sets close-on-exec; the protocol is left for the host to
        // pick so raw protocol numbers are never forwarded.
        let socket = socket2::Socket::new(Domain::from(self.family), Type::from(base).nonblocking(), None)?;
        let handle = HostSocket::new(OwnedFd::from(socket), Arc::clone(&self.stack.notifier))?
            .with_trace(self.stack.trace_socket);
        if self.stack.trace_socket {
            log::debug!(
                "hostinet: socket family={} type={base} fd={}",
                self.family,
                std::os::fd::AsRawFd::as_raw_fd(&handle)
            );
        }
        Ok(Some(SocketFile::new(
            Box::new(handle),
            FileFlags {
                read: true,
                write: true,
                non_blocking: stype & libc::SOCK_NONBLOCK != 0,
            },
        )))
    }

    fn pair(
        &self,
        _task: &dyn Task,
        _stype: i32,
        _protocol: i32,
    ) -> SysResult<Option<(SocketFile, SocketFile)>> {
        Ok(None)
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    providers: HashMap<i32, Vec<Arc<dyn Provider>>>,
}

impl RegistryBuilder {
    pub fn register(mut self, family: i32, provider: Arc<dyn Provider>) -> Self {
        self.providers.entry(family).or_default().push(provider);
        self
    }

    pub fn build(self) -> ProviderRegistry {
        ProviderRegistry {
            providers: self.providers,
        }
    }
}

/// Immutable map from address family to providers, tried in registration
/// order.
pub struct ProviderRegistry {
    providers: HashMap<i32, Vec<Arc<dyn Provider>>>,
}

impl ProviderRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn socket(
        &self,
        task: &dyn Task,
        family: i32,
        stype: i32,
        protocol: i32,
    ) -> SysResult<SocketFile> {
        for provider in self.providers.get(&family).into_iter().flatten() {
            if let Some(file) = provider.socket(task, stype, protocol)? {
                return Ok(file);
            }
        }
        Err(SysError::AddressFamilyNotSupported)
    }

    pub fn pair(
        &self,
        task: &dyn Task,
        family: i32,
        stype: i32,
        protocol: i32,
    ) -> SysResult<(SocketFile, SocketFile)> {
        for provider in self.providers.get(&family).into_iter().flatten() {
            if let Some(files) = provider.pair(task, stype, protocol)? {
                return Ok(files);
            }
        }
        Err(SysError::NotSupported)
    }

    pub fn families(&self) -> Vec<i32> {
        let mut families: Vec<i32> = self.providers.keys().copied().collect();
        families.sort_unstable();
        families
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supported_combinations() {
        assert!(supported(libc::SOCK_STREAM, 0));
        assert!(supported(libc::SOCK_STREAM, libc::IPPROTO_TCP));
        assert!(supported(libc::SOCK_DGRAM, 0));
        assert!(supported(libc::SOCK_DGRAM, libc::IPPROTO_UDP));
        assert!(!supported(libc::SOCK_STREAM, libc::IPPROTO_UDP));
        assert!(!supported(libc::SOCK_DGRAM, libc::IPPROTO_TCP));
        assert!(!supported(libc::SOCK_RAW, 0));
        assert!(!supported(libc::SOCK_SEQPACKET, 0));
    }

    #[test]
    fn empty_registry_rejects_everything() {
        let registry = ProviderRegistry::builder().build();
        let task = crate::async_rt::task::ThreadTask::new(Some(BackendKind::HostPassthrough));
        assert_eq!(
            registry.socket(&task, libc::AF_INET, libc::SOCK_STREAM, 0).err(),
            Some(SysError::AddressFamilyNotSupported)
        );
        assert_eq!(
            registry.pair(&task, libc::AF_INET, libc::SOCK_STREAM, 0).err(),
            Some(SysError::NotSupported)
        );
        assert!(registry.families().is_empty());
    }
}
