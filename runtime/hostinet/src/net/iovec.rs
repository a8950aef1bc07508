//! Guest buffers as sequences of host memory blocks, and the scatter/gather
//! engine that moves them through host syscalls.

use std::marker::PhantomData;
use std::os::fd::RawFd;

use crate::abi::SIZEOF_SOCKADDR;
use crate::error::{SysError, SysResult};

/// A contiguous range of host memory backing part of a guest buffer.
#[derive(Debug, Clone, Copy)]
pub struct Block {
    addr: *mut u8,
    len: usize,
}

impl Block {
    /// # Safety
    ///
    /// `addr` must be valid for reads and writes of `len` bytes for as long
    /// as the block is handed to host syscalls.
    pub unsafe fn new(addr: *mut u8, len: usize) -> Self {
        Self { addr, len }
    }

    pub fn addr(&self) -> *mut u8 {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A guest buffer mapped lazily into host blocks.
///
/// `num_bytes` is the length the guest declared. When part of the guest
/// range cannot be mapped the blocks cover less than that and the transfer
/// is refused.
///
/// # Safety
///
/// Every block passed to `visit` must satisfy the contract of
/// [`Block::new`] while `self` is borrowed.
pub unsafe trait IoSequence {
    fn num_bytes(&self) -> usize;
    fn visit_blocks(&self, visit: &mut dyn FnMut(Block));
}

/// Guest memory backed by host byte slices.
pub struct GuestRegions<'a> {
    blocks: Vec<Block>,
    declared: usize,
    _regions: PhantomData<&'a mut [u8]>,
}

impl<'a> GuestRegions<'a> {
    pub fn new(regions: Vec<&'a mut [u8]>) -> Self {
        let blocks: Vec<Block> = regions
            .into_iter()
            .map(|region| Block {
                addr: region.as_mut_ptr(),
                len: region.len(),
            })
            .collect();
        let declared = blocks.iter().map(Block::len).sum();
        Self {
            blocks,
            declared,
            _regions: PhantomData,
        }
    }

    pub fn single(region: &'a mut [u8]) -> Self {
        Self::new(vec![region])
    }

    /// Overrides the length the guest claims the buffer has.
    pub fn with_declared_len(mut self, declared: usize) -> Self {
        self.declared = declared;
        self
    }
}

unsafe impl IoSequence for GuestRegions<'_> {
    fn num_bytes(&self) -> usize {
        self.declared
    }

    fn visit_blocks(&self, visit: &mut dyn FnMut(Block)) {
        for block in &self.blocks {
            visit(*block);
        }
    }
}

/// How a sequence reaches the host: one scalar buffer or an iovec array.
pub(crate) enum Transfer<'a> {
    Single(Block),
    Vectored(&'a mut [libc::iovec]),
}

/// Validates `seq` and hands it to `op` in the cheapest form.
///
/// Empty blocks are skipped. A sequence whose blocks do not add up to its
/// declared length, or that holds no bytes, transfers nothing and `op` is
/// never called. A single block is passed as-is without building an iovec
/// array.
pub(crate) fn transfer<S, F>(seq: &S, op: F) -> SysResult<usize>
where
    S: IoSequence + ?Sized,
    F: FnOnce(Transfer<'_>) -> SysResult<usize>,
{
    let mut total = 0usize;
    let mut count = 0usize;
    let mut first = None;
    seq.visit_blocks(&mut |block| {
        if block.is_empty() {
            return;
        }
        total += block.len;
        if first.is_none() {
            first = Some(block);
        }
        count += 1;
    });
    if total != seq.num_bytes() {
        return Ok(0);
    }
    match (count, first) {
        (1, Some(block)) => op(Transfer::Single(block)),
        (0, _) | (_, None) => Ok(0),
        _ => {
            let mut iovs: Vec<libc::iovec> = Vec::with_capacity(count);
            seq.visit_blocks(&mut |block| {
                if !block.is_empty() {
                    iovs.push(libc::iovec {
                        iov_base: block.addr.cast(),
                        iov_len: block.len,
                    });
                }
            });
            op(Transfer::Vectored(&mut iovs))
        }
    }
}

fn check_len(rc: isize) -> SysResult<usize> {
    if rc < 0 {
        return Err(SysError::last_os_error());
    }
    Ok(rc as usize)
}

/// Source address filled in by a receive.
pub(crate) struct SockAddrBuf {
    bytes: [u8; SIZEOF_SOCKADDR],
    len: libc::socklen_t,
}

impl SockAddrBuf {
    pub(crate) fn new() -> Self {
        Self {
            bytes: [0; SIZEOF_SOCKADDR],
            len: SIZEOF_SOCKADDR as libc::socklen_t,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.len = SIZEOF_SOCKADDR as libc::socklen_t;
    }

    /// Address and length pointers for a host call that fills the buffer.
    pub(crate) fn raw_parts(&mut self) -> (*mut libc::sockaddr, *mut libc::socklen_t) {
        (self.bytes.as_mut_ptr().cast(), &mut self.len as *mut libc::socklen_t)
    }

    /// Length the host reported, which may exceed the buffer.
    pub(crate) fn host_len(&self) -> u32 {
        self.len
    }

    pub(crate) fn to_vec(&self) -> Vec<u8> {
        let len = (self.len as usize).min(SIZEOF_SOCKADDR);
        self.bytes[..len].to_vec()
    }
}

pub(crate) fn read<S: IoSequence + ?Sized>(fd: RawFd, dst: &S) -> SysResult<usize> {
    transfer(dst, |how| match how {
        Transfer::Single(block) => {
            check_len(unsafe { libc::read(fd, block.addr.cast(), block.len) })
        }
        Transfer::Vectored(iovs) => check_len(unsafe {
            libc::readv(fd, iovs.as_ptr(), iovs.len() as libc::c_int)
        }),
    })
}

pub(crate) fn write<S: IoSequence + ?Sized>(fd: RawFd, src: &S) -> SysResult<usize> {
    transfer(src, |how| match how {
        Transfer::Single(block) => {
            check_len(unsafe { libc::write(fd, block.addr.cast_const().cast(), block.len) })
        }
        Transfer::Vectored(iovs) => check_len(unsafe {
            libc::writev(fd, iovs.as_ptr(), iovs.len() as libc::c_int)
        }),
    })
}

/// Receives into `dst`. Returns the byte count and the host message flags
/// (always zero on the scalar path).
pub(crate) fn recv<S: IoSequence + ?Sized>(
    fd: RawFd,
    dst: &S,
    flags: i32,
    mut sender: Option<&mut SockAddrBuf>,
) -> SysResult<(usize, i32)> {
    let mut msg_flags = 0;
    let n = transfer(dst, |how| {
        let (addr, addr_len) = match sender.as_deref_mut() {
            Some(buf) => {
                buf.reset();
                buf.raw_parts()
            }
            None => (std::ptr::null_mut(), std::ptr::null_mut()),
        };
        match how {
            Transfer::Single(block) => check_len(unsafe {
                libc::recvfrom(fd, block.addr.cast(), block.len, flags, addr, addr_len)
            }),
            Transfer::Vectored(iovs) => {
                let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
                msg.msg_iov = iovs.as_mut_ptr();
                msg.msg_iovlen = iovs.len() as _;
                if !addr.is_null() {
                    msg.msg_name = addr.cast();
                    msg.msg_namelen = SIZEOF_SOCKADDR as libc::socklen_t;
                }
                let n = check_len(unsafe { libc::recvmsg(fd, &mut msg, flags) })?;
                if !addr_len.is_null() {
                    unsafe { *addr_len = msg.msg_namelen };
                }
                msg_flags = msg.msg_flags;
                Ok(n)
            }
        }
    })?;
    Ok((n, msg_flags))
}

pub(crate) fn send<S: IoSequence + ?Sized>(
    fd: RawFd,
    src: &S,
    flags: i32,
    to: &[u8],
) -> SysResult<usize> {
    let (addr, addr_len) = if to.is_empty() {
        (std::ptr::null(), 0)
    } else {
        (
            to.as_ptr().cast::<libc::sockaddr>(),
            to.len() as libc::socklen_t,
        )
    };
    transfer(src, |how| match how {
        Transfer::Single(block) => check_len(unsafe {
            libc::sendto(fd, block.addr.cast_const().cast(), block.len, flags, addr, addr_len)
        }),
        Transfer::Vectored(iovs) => {
            let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
            msg.msg_iov = iovs.as_mut_ptr();
            msg.msg_iovlen = iovs.len() as _;
            msg.msg_name = addr.cast_mut().cast();
            msg.msg_namelen = addr_len;
            check_len(unsafe { libc::sendmsg(fd, &msg, flags) })
        }
    })
}
