//! # Register Window
//!
//! Barrier-fenced access to device-visible memory.
//!
//! ## Ordering Rules
//!
//! ```text
//! read:   barrier ─► volatile load ─► rmb
//! write:  barrier ─► volatile store ─► wmb ─► barrier
//! ```
//!
//! TXT records security-relevant transitions (locality opens, secrets flag,
//! reset requests) on register writes, so both the compiler and the CPU must
//! keep these accesses in program order relative to the surrounding code.
//!
//! Physical ranges are reached through a [`PhysMapper`] supplied by the
//! platform. Every mapping is an [`IoMapping`] that unmaps itself on drop,
//! so a window is only mapped for as long as it is in use.

use core::ptr::NonNull;
use core::sync::atomic::{compiler_fence, Ordering};

use crate::error::{Result, SlaunchError};
use crate::{LOG_TARGET, PAGE_SIZE};

// ============================================================================
// BARRIERS
// ============================================================================

/// Compiler-only ordering barrier
#[inline(always)]
pub fn barrier() {
    compiler_fence(Ordering::SeqCst);
}

/// Load ordering barrier
#[inline(always)]
pub fn rmb() {
    #[cfg(target_arch = "x86_64")]
    {
        // SAFETY: lfence has no memory-safety preconditions; SSE2 is baseline on x86_64
        unsafe { core::arch::x86_64::_mm_lfence() }
    }
    #[cfg(not(target_arch = "x86_64"))]
    core::sync::atomic::fence(Ordering::Acquire);
}

/// Store ordering barrier
#[inline(always)]
pub fn wmb() {
    #[cfg(target_arch = "x86_64")]
    {
        // SAFETY: sfence has no memory-safety preconditions; SSE2 is baseline on x86_64
        unsafe { core::arch::x86_64::_mm_sfence() }
    }
    #[cfg(not(target_arch = "x86_64"))]
    core::sync::atomic::fence(Ordering::Release);
}

// ============================================================================
// PHYSICAL MAPPER
// ============================================================================

/// Maps physical address ranges for bounded periods.
///
/// # Safety
///
/// A pointer returned by [`PhysMapper::map`] must be valid for reads and
/// writes of `len` bytes until it is passed back to [`PhysMapper::unmap`].
pub unsafe trait PhysMapper {
    /// Map `len` bytes starting at `phys`; `None` if the range cannot be mapped
    fn map(&self, phys: u64, len: usize) -> Option<NonNull<u8>>;

    /// Release a mapping previously returned by `map`
    fn unmap(&self, virt: NonNull<u8>, len: usize);
}

/// A live mapping of a physical range, unmapped on drop
pub struct IoMapping<'m, M: PhysMapper + ?Sized> {
    mapper: &'m M,
    virt: NonNull<u8>,
    phys: u64,
    len: usize,
}

// SAFETY: the mapping is plain memory owned by the platform; shared access is
// read-only through &self, mutation needs &mut self
unsafe impl<M: PhysMapper + Sync + ?Sized> Send for IoMapping<'_, M> {}
unsafe impl<M: PhysMapper + Sync + ?Sized> Sync for IoMapping<'_, M> {}

impl<'m, M: PhysMapper + ?Sized> IoMapping<'m, M> {
    /// Map `len` bytes at `phys`
    pub fn new(mapper: &'m M, phys: u64, len: usize) -> Option<Self> {
        let virt = mapper.map(phys, len)?;
        Some(Self {
            mapper,
            virt,
            phys,
            len,
        })
    }

    /// Physical address of the first mapped byte
    #[inline]
    pub fn phys(&self) -> u64 {
        self.phys
    }

    /// Mapped length in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read an 8-byte device register
    pub fn read64(&self, offset: usize) -> u64 {
        assert!(offset % 8 == 0 && offset + 8 <= self.len);
        barrier();
        // SAFETY: in bounds and 8-byte aligned (mapping bases are page aligned)
        let val = unsafe { core::ptr::read_volatile(self.virt.as_ptr().add(offset) as *const u64) };
        rmb();
        val
    }

    /// Write an 8-byte device register
    pub fn write64(&self, offset: usize, val: u64) {
        assert!(offset % 8 == 0 && offset + 8 <= self.len);
        barrier();
        // SAFETY: in bounds and 8-byte aligned (mapping bases are page aligned)
        unsafe { core::ptr::write_volatile(self.virt.as_ptr().add(offset) as *mut u64, val) };
        wmb();
        barrier();
    }

    /// Byte-wise volatile copy out of the mapping (memcpy_fromio)
    pub fn copy_from_io(&self, offset: usize, dst: &mut [u8]) {
        assert!(offset + dst.len() <= self.len);
        barrier();
        for (i, byte) in dst.iter_mut().enumerate() {
            // SAFETY: bounds checked above
            *byte = unsafe { core::ptr::read_volatile(self.virt.as_ptr().add(offset + i)) };
        }
        rmb();
    }

    /// Little-endian u64 field at any alignment
    pub fn read_u64(&self, offset: usize) -> u64 {
        let mut raw = [0u8; 8];
        self.copy_from_io(offset, &mut raw);
        u64::from_le_bytes(raw)
    }

    /// Little-endian u32 field at any alignment
    pub fn read_u32(&self, offset: usize) -> u32 {
        let mut raw = [0u8; 4];
        self.copy_from_io(offset, &mut raw);
        u32::from_le_bytes(raw)
    }

    /// Plain-memory view, used for hashing RAM-backed regions
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: PhysMapper contract; the slice borrows self so it cannot
        // outlive the mapping
        unsafe { core::slice::from_raw_parts(self.virt.as_ptr(), self.len) }
    }

    /// Mutable plain-memory view
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as for bytes(); &mut self guarantees exclusivity
        unsafe { core::slice::from_raw_parts_mut(self.virt.as_ptr(), self.len) }
    }
}

impl<M: PhysMapper + ?Sized> Drop for IoMapping<'_, M> {
    fn drop(&mut self) {
        self.mapper.unmap(self.virt, self.len);
    }
}

// ============================================================================
// REGISTER BANKS
// ============================================================================

pub(crate) mod sealed {
    pub trait Sealed {}
}

/// 8-byte register access, implemented once per hardware vendor variant
pub trait RegisterBank: sealed::Sealed {
    /// Read the register at `reg`
    fn read64(&self, reg: u32) -> u64;

    /// Write `val` to the register at `reg`
    fn write64(&self, reg: u32, val: u64);
}

/// TXT private configuration register offsets
pub mod txt_reg {
    /// Private configuration space base
    pub const TXT_PRIV_CONFIG_REGS_BASE: u64 = 0xfed2_0000;
    /// Public configuration space base (end of private space)
    pub const TXT_PUB_CONFIG_REGS_BASE: u64 = 0xfed3_0000;
    /// Pages in the private configuration space
    pub const TXT_NR_CONFIG_PAGES: usize =
        ((TXT_PUB_CONFIG_REGS_BASE - TXT_PRIV_CONFIG_REGS_BASE) as usize) / crate::PAGE_SIZE;

    pub const TXTCR_ERRORCODE: u32 = 0x0030;
    pub const TXTCR_CMD_RESET: u32 = 0x0038;
    pub const TXTCR_DIDVID: u32 = 0x0110;
    pub const TXTCR_CMD_UNLOCK_MEM_CONFIG: u32 = 0x0218;
    pub const TXTCR_HEAP_BASE: u32 = 0x0300;
    pub const TXTCR_HEAP_SIZE: u32 = 0x0308;
    pub const TXTCR_CMD_OPEN_LOCALITY1: u32 = 0x0380;
    pub const TXTCR_CMD_SECRETS: u32 = 0x08e0;
    pub const TXTCR_E2STS: u32 = 0x08f0;

    /// Intel vendor id reported in DIDVID[15:0]
    pub const TXT_INTEL_VID: u16 = 0x8086;
}

/// The TXT private configuration space, mapped for the lifetime of this value
pub struct TxtConfigRegs<'m, M: PhysMapper + ?Sized> {
    io: IoMapping<'m, M>,
}

impl<'m, M: PhysMapper + ?Sized> TxtConfigRegs<'m, M> {
    /// Map the private configuration space
    pub fn map(mapper: &'m M) -> Result<Self> {
        let io = IoMapping::new(
            mapper,
            txt_reg::TXT_PRIV_CONFIG_REGS_BASE,
            txt_reg::TXT_NR_CONFIG_PAGES * PAGE_SIZE,
        )
        .ok_or_else(|| {
            log::error!(target: LOG_TARGET, "error mapping TXT configuration registers");
            SlaunchError::RegsMap
        })?;
        Ok(Self { io })
    }
}

impl<M: PhysMapper + ?Sized> sealed::Sealed for TxtConfigRegs<'_, M> {}

impl<M: PhysMapper + ?Sized> RegisterBank for TxtConfigRegs<'_, M> {
    fn read64(&self, reg: u32) -> u64 {
        self.io.read64(reg as usize)
    }

    fn write64(&self, reg: u32, val: u64) {
        self.io.write64(reg as usize, val)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakePhysMem;
    use txt_reg::*;

    #[test]
    fn test_config_space_size() {
        assert_eq!(TXT_NR_CONFIG_PAGES, 16);
    }

    #[test]
    fn test_register_read_write() {
        let mem = FakePhysMem::with_txt();
        let regs = TxtConfigRegs::map(&mem).unwrap();

        regs.write64(TXTCR_ERRORCODE, 0xc000_8006);
        assert_eq!(regs.read64(TXTCR_ERRORCODE), 0xc000_8006);
        assert_eq!(mem.read_u64(TXT_PRIV_CONFIG_REGS_BASE + TXTCR_ERRORCODE as u64), 0xc000_8006);
    }

    #[test]
    fn test_mapping_released_on_drop() {
        let mem = FakePhysMem::with_txt();
        {
            let _regs = TxtConfigRegs::map(&mem).unwrap();
            assert_eq!(mem.live_mappings(), 1);
        }
        assert_eq!(mem.live_mappings(), 0);
    }

    #[test]
    fn test_map_failure_is_error() {
        let mem = FakePhysMem::with_txt();
        mem.fail_map_at(TXT_PRIV_CONFIG_REGS_BASE);
        assert_eq!(TxtConfigRegs::map(&mem).err(), Some(SlaunchError::RegsMap));
    }

    #[test]
    fn test_unaligned_field_reads() {
        let mut mem = FakePhysMem::new();
        mem.add_region(0x1000, PAGE_SIZE);
        mem.write_bytes(0x1003, &0x1122_3344_5566_7788u64.to_le_bytes());
        let io = IoMapping::new(&mem, 0x1000, 64).unwrap();
        assert_eq!(io.read_u64(3), 0x1122_3344_5566_7788);
        assert_eq!(io.read_u32(3), 0x5566_7788);
    }
}
