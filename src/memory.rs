//! Stand-in for the page-table / virtual-memory allocator, which §1 lists
//! as an external collaborator (`uvminit`, `uvmcopy`, `kalloc`, `kvmmap`,
//! `copyout`). The core never inspects page contents or page-table layout;
//! it only needs an owning handle with "how big is it", "copy it
//! independently", and "write these bytes at this user address" — exactly
//! the operations `fork`/`wait` call through §6.
//!
//! [`HostUserMemory`] is the smallest thing that satisfies that contract on
//! a host with no MMU: a plain growable byte buffer standing in for a user
//! address space.

use crate::error::KernelError;
use crate::param::MAX_USER_MEM;

/// An address in the (simulated) user address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct UserAddr(pub usize);

impl UserAddr {
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// A process's user memory image. Stands in for a page table plus the
/// physical pages it maps.
#[derive(Debug, Default)]
pub struct HostUserMemory {
    bytes: Vec<u8>,
}

impl HostUserMemory {
    /// `uvminit`: creates a fresh address space and loads `init_code` at
    /// address 0.
    pub fn new(init_code: &[u8]) -> Self {
        Self {
            bytes: init_code.to_vec(),
        }
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// `uvmcopy`: deep-copies this address space for a child process. The
    /// result shares no storage with `self` (P7: fork isolation). Fails if
    /// the image is too large to duplicate, mirroring `uvmcopy` giving up
    /// partway through when `kalloc` has no more physical pages to hand the
    /// new address space.
    pub fn copy(&self) -> Result<Self, KernelError> {
        if self.bytes.len() > MAX_USER_MEM {
            return Err(KernelError::OutOfMemory);
        }
        Ok(Self {
            bytes: self.bytes.clone(),
        })
    }

    /// `copyout`: writes `data` at user address `addr`, growing the backing
    /// store as needed. Fails (mirroring a real page fault on an
    /// unmapped/invalid address) if `addr` overflows `usize`.
    pub fn copy_out(&mut self, addr: UserAddr, data: &[u8]) -> Result<(), KernelError> {
        let end = addr.0.checked_add(data.len()).ok_or(KernelError::CopyOutFailed)?;
        if self.bytes.len() < end {
            self.bytes.resize(end, 0);
        }
        self.bytes[addr.0..end].copy_from_slice(data);
        Ok(())
    }

    pub fn copy_in(&self, addr: UserAddr, len: usize) -> Result<&[u8], KernelError> {
        let end = addr.0.checked_add(len).ok_or(KernelError::CopyOutFailed)?;
        self.bytes.get(addr.0..end).ok_or(KernelError::CopyOutFailed)
    }

    /// `uvmfree`: tears down the address space. A no-op here since `Vec`'s
    /// `Drop` already frees the backing storage; kept as an explicit call
    /// site so `freeproc` reads the same as the spec's §4.1.
    pub fn free(self) {}
}
