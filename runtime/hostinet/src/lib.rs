//! Host network passthrough for a sandboxed guest kernel.
//!
//! Guest sockets are thin wrappers over non-blocking host sockets. Blocking
//! guest calls wait on host readiness delivered by a
//! [`ReadinessNotifier`](async_rt::ReadinessNotifier) worker, so guest
//! threads park in the sandbox rather than inside host syscalls.

#[cfg(not(target_os = "linux"))]
compile_error!("hostinet requires a Linux host");

pub mod abi;
pub mod async_rt;
pub mod config;
pub mod error;
pub mod file;
pub mod net;
pub mod state;

pub use config::{BackendKind, HostNetConfig};
pub use error::{SysError, SysResult};
pub use file::{Accepted, FileOperations, RecvMsg, Socket, SocketFile};
pub use state::metrics::{MetricsSnapshot, snapshot as metrics_snapshot};
