pub mod iovec;
pub mod provider;
pub mod sockets;
pub mod sockopt;

pub use iovec::{Block, GuestRegions, IoSequence};
pub use provider::{HostProvider, HostStack, Provider, ProviderRegistry, RegistryBuilder};
pub use sockets::HostSocket;
