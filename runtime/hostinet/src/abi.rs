//! Host ABI constants shared by the socket layer.

use std::mem::size_of;

/// Readiness bits, numerically equal to the Linux `poll(2)` flags.
pub type EventMask = u32;

pub const EVENT_IN: EventMask = libc::POLLIN as EventMask;
pub const EVENT_PRI: EventMask = libc::POLLPRI as EventMask;
pub const EVENT_OUT: EventMask = libc::POLLOUT as EventMask;
pub const EVENT_ERR: EventMask = libc::POLLERR as EventMask;
pub const EVENT_HUP: EventMask = libc::POLLHUP as EventMask;

pub const SIZEOF_INT32: usize = size_of::<i32>();

/// Largest socket address exchanged with the host (an IPv6 address).
pub const SIZEOF_SOCKADDR: usize = size_of::<libc::sockaddr_in6>();
pub const SIZEOF_SOCKADDR_IN: usize = size_of::<libc::sockaddr_in>();

/// Low bits of the `socket(2)` type argument that carry the base type.
pub const SOCK_TYPE_MASK: i32 = 0xf;

/// Flags a guest may pass to `recvmsg`.
pub const RECV_FLAGS_ALLOWED: i32 = libc::MSG_DONTWAIT | libc::MSG_PEEK | libc::MSG_TRUNC;

/// Flags a guest may pass to `sendmsg`.
pub const SEND_FLAGS_ALLOWED: i32 = libc::MSG_DONTWAIT
    | libc::MSG_EOR
    | libc::MSG_FASTOPEN
    | libc::MSG_MORE
    | libc::MSG_NOSIGNAL;

/// Clamps a guest supplied socket address to the host bound.
pub fn truncate_sockaddr(addr: &[u8]) -> &[u8] {
    &addr[..addr.len().min(SIZEOF_SOCKADDR)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sockaddr_bound_is_ipv6_size() {
        assert_eq!(SIZEOF_SOCKADDR, 28);
        assert_eq!(SIZEOF_SOCKADDR_IN, 16);
    }

    #[test]
    fn event_bits_match_poll() {
        assert_eq!(EVENT_IN, 0x1);
        assert_eq!(EVENT_PRI, 0x2);
        assert_eq!(EVENT_OUT, 0x4);
        assert_eq!(EVENT_ERR, 0x8);
        assert_eq!(EVENT_HUP, 0x10);
    }

    #[test]
    fn truncate_keeps_short_addresses() {
        let short = [7u8; 16];
        assert_eq!(truncate_sockaddr(&short).len(), 16);
        let long = [7u8; 120];
        assert_eq!(truncate_sockaddr(&long).len(), SIZEOF_SOCKADDR);
        assert!(truncate_sockaddr(&[]).is_empty());
    }
}
