//! Logical units and their storage hooks
//!
//! A [`LogicalUnit`] is what the host addresses; the actual medium sits
//! behind the [`StorageTarget`] capability hooks. [`CachedUnit`] is the
//! default target, binding the hooks to the external-memory page cache so
//! that 512-byte host blocks coexist with the 4 KiB flash erase granule.

use crate::mem::{Memory, SectorDevice, CACHE_INVALID, CACHE_SIZE};
use bitflags::bitflags;

const SECTOR_MASK: u32 = (CACHE_SIZE as u32) - 1;

bitflags! {
    /// What diagnostic traffic a unit accepts
    pub struct Permissions: u32 {
        /// READ BUFFER allowed
        const READ_BUFFER = 1 << 28;
        /// WRITE BUFFER allowed
        const WRITE_BUFFER = 1 << 29;
    }
}

/// Failure reported by a storage target, mapped to a medium error upstream
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TargetError {
    /// The medium did not deliver or accept the bytes
    Medium,
    /// The address lies outside the medium
    OutOfRange,
}

/// Capability hooks of one logical unit
///
/// `write_preload` and `write_complete` bracket the per-command write
/// iteration; targets that stage writes use them to pull a sector in and
/// push it back out.
pub trait StorageTarget {
    /// Reads `buf.len()` bytes from byte address `addr`.
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), TargetError>;

    /// Writes `data` at byte address `addr`.
    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), TargetError>;

    /// Called once before the first block of a WRITE command lands.
    fn write_preload(&mut self, _addr: u32) -> Result<(), TargetError> {
        Ok(())
    }

    /// Called after the last block of a WRITE command was accepted.
    fn write_complete(&mut self) -> Result<(), TargetError> {
        Ok(())
    }

    /// Vendor-specific CDB hook. `None` means not supported; `Some(Err(()))`
    /// fails the command with the sense the target stamped elsewhere.
    fn vendor(&mut self, _cb: &[u8]) -> Option<Result<(), ()>> {
        None
    }
}

/// One entry of the logical-unit table
pub struct LogicalUnit<'t> {
    present: bool,
    /// Capacity in 512-byte blocks
    capacity: u32,
    writable: bool,
    perm: Permissions,
    target: Option<&'t mut dyn StorageTarget>,
}

impl<'t> LogicalUnit<'t> {
    /// A unit with medium present
    pub fn new(
        capacity: u32,
        writable: bool,
        perm: Permissions,
        target: &'t mut dyn StorageTarget,
    ) -> Self {
        LogicalUnit {
            present: true,
            capacity,
            writable,
            perm,
            target: Some(target),
        }
    }

    /// A unit whose medium is not present. Only INQUIRY, REQUEST SENSE and
    /// TEST UNIT READY get a meaningful answer.
    pub fn absent() -> Self {
        LogicalUnit {
            present: false,
            capacity: 0,
            writable: false,
            perm: Permissions::empty(),
            target: None,
        }
    }

    pub fn is_present(&self) -> bool {
        self.present
    }

    /// Capacity in 512-byte blocks
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn permits(&self, perm: Permissions) -> bool {
        self.perm.contains(perm)
    }

    pub(crate) fn target(&mut self) -> Option<&mut dyn StorageTarget> {
        match self.target.as_mut() {
            Some(t) => Some(&mut **t),
            None => None,
        }
    }
}

/// Default storage target: a memory node accessed through its page cache
///
/// Reads pass through to the medium. Writes land in the cached sector and
/// are written back when the iteration crosses a sector boundary and once
/// more from `write_complete`, so a finished command is always on flash.
pub struct CachedUnit<'m, D, const N: usize> {
    mem: &'m mut Memory<D, N>,
    nid: usize,
    dirty: bool,
}

impl<'m, D: SectorDevice, const N: usize> CachedUnit<'m, D, N> {
    pub fn new(mem: &'m mut Memory<D, N>, nid: usize) -> Self {
        CachedUnit {
            mem,
            nid,
            dirty: false,
        }
    }

    /// Capacity of the backing node in 512-byte blocks
    pub fn blocks(&self) -> u32 {
        self.mem.capacity(self.nid) / 512
    }

    fn cache_addr(&self) -> u32 {
        self.mem
            .node(self.nid)
            .map(|n| n.cache_addr())
            .unwrap_or(CACHE_INVALID)
    }

    fn load_sector(&mut self, sector: u32) -> Result<(), TargetError> {
        if self.mem.read_cached(self.nid, sector, CACHE_SIZE) == 0 {
            return Err(TargetError::Medium);
        }
        Ok(())
    }

    fn flush_dirty(&mut self) -> Result<(), TargetError> {
        if !self.dirty {
            return Ok(());
        }
        if self.mem.flush(self.nid) != CACHE_SIZE {
            return Err(TargetError::Medium);
        }
        self.dirty = false;
        Ok(())
    }
}

impl<'m, D: SectorDevice, const N: usize> StorageTarget for CachedUnit<'m, D, N> {
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), TargetError> {
        if self.mem.read(self.nid, addr, buf) != buf.len() {
            return Err(TargetError::OutOfRange);
        }
        Ok(())
    }

    fn write(&mut self, mut addr: u32, mut data: &[u8]) -> Result<(), TargetError> {
        while !data.is_empty() {
            let sector = addr & !SECTOR_MASK;
            if self.cache_addr() != sector {
                self.flush_dirty()?;
                self.load_sector(sector)?;
            }
            let offset = (addr & SECTOR_MASK) as usize;
            let count = data.len().min(CACHE_SIZE - offset);
            let cache = self.mem.cache_mut(self.nid).ok_or(TargetError::Medium)?;
            cache[offset..offset + count].copy_from_slice(&data[..count]);
            self.dirty = true;
            addr += count as u32;
            data = &data[count..];
        }
        Ok(())
    }

    fn write_preload(&mut self, addr: u32) -> Result<(), TargetError> {
        self.load_sector(addr & !SECTOR_MASK)
    }

    fn write_complete(&mut self) -> Result<(), TargetError> {
        self.flush_dirty()
    }
}
