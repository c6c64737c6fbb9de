// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Validation of memory ranges passed across the trust boundary.

use crate::{partition::IsolationLevel, status::Error};
use arrayvec::ArrayVec;
use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The maximum number of entries in the static region table.
pub const MAX_REGIONS: usize = 8;

bitflags! {
    /// The accesses allowed to a memory region.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct AccessPermissions: u8 {
        const PRIV_READ = 1 << 0;
        const PRIV_WRITE = 1 << 1;
        const UNPRIV_READ = 1 << 2;
        const UNPRIV_WRITE = 1 << 3;

        const READ_ONLY = Self::PRIV_READ.bits() | Self::UNPRIV_READ.bits();
        const PRIV_READ_WRITE = Self::PRIV_READ.bits() | Self::PRIV_WRITE.bits();
        const READ_WRITE = Self::PRIV_READ_WRITE.bits()
            | Self::UNPRIV_READ.bits()
            | Self::UNPRIV_WRITE.bits();
    }
}

impl AccessPermissions {
    /// Returns the permissions needed for the given kind of access.
    pub fn required(access: MemoryAccess, privileged: bool) -> Self {
        match (access, privileged) {
            (MemoryAccess::ReadOnly, true) => Self::PRIV_READ,
            (MemoryAccess::ReadWrite, true) => Self::PRIV_READ | Self::PRIV_WRITE,
            (MemoryAccess::ReadOnly, false) => Self::UNPRIV_READ,
            (MemoryAccess::ReadWrite, false) => Self::UNPRIV_READ | Self::UNPRIV_WRITE,
        }
    }
}

/// The kind of access requested to a buffer.
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum MemoryAccess {
    ReadOnly = 1,
    ReadWrite = 2,
}

/// Who a buffer named in a request is checked for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CallerMode {
    NonSecure,
    /// A secure partition running unprivileged.
    Unprivileged,
    Privileged,
}

/// Which trust domain a memory region belongs to, as reported by the security attribution unit.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TrustDomain {
    Secure,
    /// Secure memory set aside to marshal data between partitions.
    Scratch,
    NonSecureCode,
    NonSecureData,
    /// The attribution unit reports the region as invalid.
    Invalid,
}

impl TrustDomain {
    pub fn is_secure(self) -> bool {
        matches!(self, Self::Secure | Self::Scratch)
    }
}

/// A region of the static memory map. `limit` is the address of its last byte.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MemoryRegion {
    pub base: usize,
    pub limit: usize,
    pub access: AccessPermissions,
    pub domain: TrustDomain,
}

impl MemoryRegion {
    pub const fn new(
        base: usize,
        limit: usize,
        access: AccessPermissions,
        domain: TrustDomain,
    ) -> Self {
        Self {
            base,
            limit,
            access,
            domain,
        }
    }

    /// Returns whether the region covers every byte from `start` to `end` inclusive.
    pub fn covers(&self, start: usize, end: usize) -> bool {
        start >= self.base && end <= self.limit
    }
}

/// A window of memory bounded by `base` and the inclusive `limit`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct AddressWindow {
    pub base: usize,
    pub limit: usize,
}

impl AddressWindow {
    pub const fn new(base: usize, limit: usize) -> Self {
        Self { base, limit }
    }

    fn covers(&self, start: usize, end: usize) -> bool {
        start >= self.base && end <= self.limit
    }
}

/// Returns the address of the last byte of the `size` bytes at `ptr`, or `None` if the range is
/// empty or wraps around the end of the address space.
fn last_byte(ptr: usize, size: usize) -> Option<usize> {
    if size == 0 {
        return None;
    }
    ptr.checked_add(size).map(|end| end - 1)
}

/// The static memory map together with the secure windows buffers may live in.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MemoryMap {
    regions: ArrayVec<MemoryRegion, MAX_REGIONS>,
    /// All secure data, usable for buffers when services run privileged.
    secure_data: AddressWindow,
    /// The only secure memory usable for buffers when partitions are isolated from each other.
    scratch: AddressWindow,
}

impl MemoryMap {
    pub fn new(
        regions: &[MemoryRegion],
        secure_data: AddressWindow,
        scratch: AddressWindow,
    ) -> Result<Self, Error> {
        let regions = regions
            .try_into()
            .map_err(|_| Error::InvalidParameter)?;
        Ok(Self {
            regions,
            secure_data,
            scratch,
        })
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    pub fn scratch(&self) -> AddressWindow {
        self.scratch
    }

    /// Returns the region covering all of the range from `ptr` to `end` inclusive, if any.
    fn covering_region(&self, ptr: usize, end: usize) -> Option<&MemoryRegion> {
        self.regions.iter().find(|region| region.covers(ptr, end))
    }

    /// Checks whether the running service may access the `size` bytes at `ptr`.
    ///
    /// `privileged` tells whether the service may use privileged access rights.
    pub fn check_access(
        &self,
        ptr: usize,
        size: usize,
        access: MemoryAccess,
        privileged: bool,
        isolation: IsolationLevel,
    ) -> Result<(), Error> {
        let end = last_byte(ptr, size).ok_or(Error::InvalidParameter)?;
        let region = self
            .covering_region(ptr, end)
            .ok_or(Error::InvalidParameter)?;
        if !region
            .access
            .contains(AccessPermissions::required(access, privileged))
        {
            return Err(Error::InvalidParameter);
        }

        match region.domain {
            TrustDomain::Secure | TrustDomain::Scratch => {
                let window = if isolation.per_partition_stacks() {
                    self.scratch
                } else {
                    self.secure_data
                };
                if window.covers(ptr, end) {
                    Ok(())
                } else {
                    Err(Error::InvalidParameter)
                }
            }
            TrustDomain::NonSecureCode => match access {
                MemoryAccess::ReadOnly => Ok(()),
                MemoryAccess::ReadWrite => Err(Error::InvalidParameter),
            },
            TrustDomain::NonSecureData => Ok(()),
            TrustDomain::Invalid => Err(Error::InvalidParameter),
        }
    }

    /// Checks a buffer named by a client in an IPC request.
    ///
    /// Non-secure clients may only name non-secure memory which they could access themselves, and
    /// unprivileged partitions only memory open to unprivileged code. Empty buffers are always
    /// accepted, as nothing will be accessed through them.
    pub fn check_client_buffer(
        &self,
        ptr: usize,
        size: usize,
        mode: CallerMode,
        access: MemoryAccess,
    ) -> Result<(), Error> {
        if size == 0 {
            return Ok(());
        }
        let end = last_byte(ptr, size).ok_or(Error::InvalidParameter)?;
        let region = self
            .covering_region(ptr, end)
            .ok_or(Error::InvalidParameter)?;
        let privileged = mode == CallerMode::Privileged;
        if !region
            .access
            .contains(AccessPermissions::required(access, privileged))
        {
            return Err(Error::InvalidParameter);
        }

        match (region.domain, access) {
            (TrustDomain::Invalid, _) | (TrustDomain::NonSecureCode, MemoryAccess::ReadWrite) => {
                Err(Error::InvalidParameter)
            }
            (domain, _) if mode == CallerMode::NonSecure && domain.is_secure() => {
                Err(Error::InvalidParameter)
            }
            _ => Ok(()),
        }
    }

    /// Returns whether the `size` bytes at `ptr` all lie in one secure region.
    pub fn is_secure(&self, ptr: usize, size: usize) -> bool {
        last_byte(ptr, size)
            .and_then(|end| self.covering_region(ptr, end))
            .is_some_and(|region| region.domain.is_secure())
    }

    /// Removes all write permissions from the region with the given index.
    ///
    /// This is used once a region loaded at boot must no longer change. Doing it again has no
    /// further effect.
    pub fn make_read_only(&mut self, index: usize) -> Result<(), Error> {
        let region = self
            .regions
            .get_mut(index)
            .ok_or(Error::InvalidParameter)?;
        region
            .access
            .remove(AccessPermissions::PRIV_WRITE | AccessPermissions::UNPRIV_WRITE);
        Ok(())
    }
}
