//! Socket option passthrough.
//!
//! Only options listed in [`OPTIONS`] reach the host. Unknown options are
//! rejected on get and silently accepted on set, which keeps applications
//! that tune options the host does not expose working.

use std::mem::size_of;
use std::os::fd::RawFd;

use crate::abi::SIZEOF_INT32;
use crate::error::{SysError, SysResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionDescriptor {
    pub level: i32,
    pub name: i32,
    /// Size of the option value in bytes.
    pub len: usize,
    /// Whether guests may change the option on the host.
    pub settable: bool,
}

const fn opt(level: i32, name: i32, len: usize, settable: bool) -> OptionDescriptor {
    OptionDescriptor {
        level,
        name,
        len,
        settable,
    }
}

pub const OPTIONS: &[OptionDescriptor] = &[
    opt(libc::SOL_SOCKET, libc::SO_ERROR, SIZEOF_INT32, false),
    opt(libc::SOL_SOCKET, libc::SO_KEEPALIVE, SIZEOF_INT32, false),
    opt(libc::SOL_SOCKET, libc::SO_SNDBUF, SIZEOF_INT32, true),
    opt(libc::SOL_SOCKET, libc::SO_RCVBUF, SIZEOF_INT32, true),
    opt(libc::SOL_SOCKET, libc::SO_REUSEADDR, SIZEOF_INT32, true),
    opt(libc::SOL_SOCKET, libc::SO_TYPE, SIZEOF_INT32, false),
    opt(libc::SOL_SOCKET, libc::SO_LINGER, size_of::<libc::linger>(), false),
    opt(libc::SOL_IPV6, libc::IPV6_V6ONLY, SIZEOF_INT32, true),
    opt(libc::SOL_TCP, libc::TCP_NODELAY, SIZEOF_INT32, true),
    opt(libc::SOL_TCP, libc::TCP_INFO, size_of::<libc::tcp_info>(), false),
];

pub fn lookup(level: i32, name: i32) -> Option<&'static OptionDescriptor> {
    OPTIONS
        .iter()
        .find(|desc| desc.level == level && desc.name == name)
}

/// Reads a whitelisted option. `out_len` is the guest buffer size.
pub(crate) fn get_option(fd: RawFd, level: i32, name: i32, out_len: i32) -> SysResult<Vec<u8>> {
    if out_len < 0 {
        return Err(SysError::InvalidArgument);
    }
    let desc = lookup(level, name).ok_or(SysError::ProtocolOptionNotAvailable)?;
    if (out_len as usize) < desc.len {
        return Err(SysError::InvalidArgument);
    }
    let mut value = vec![0u8; desc.len];
    let mut len = desc.len as libc::socklen_t;
    let rc = unsafe { libc::getsockopt(fd, level, name, value.as_mut_ptr().cast(), &mut len) };
    if rc < 0 {
        return Err(SysError::last_os_error());
    }
    value.truncate(len as usize);
    Ok(value)
}

/// Writes a settable option. Anything else succeeds without touching the
/// host.
pub(crate) fn set_option(fd: RawFd, level: i32, name: i32, value: &[u8]) -> SysResult<()> {
    let Some(desc) = lookup(level, name).filter(|desc| desc.settable) else {
        log::trace!("hostinet: ignoring setsockopt level={level} name={name}");
        return Ok(());
    };
    if value.len() < desc.len {
        return Err(SysError::InvalidArgument);
    }
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            value.as_ptr().cast(),
            desc.len as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(SysError::last_os_error());
    }
    Ok(())
}
