//! # AMD Device Exclusion Vector
//!
//! DEV is a page-granular DMA filter on AMD northbridges. Each protection
//! domain has a bitmap in memory; bit *n* set means device accesses to
//! page frame *n* are blocked.
//!
//! ## Register Access
//!
//! DEV registers sit behind an indirect pair in the capability block of
//! PCI function 0:18.3:
//!
//! ```text
//! OP   (0xF4) ◄─ (function << 8) | index
//! DATA (0xF8) ◄─► register value
//! ```
//!
//! | Function  | Index  | Contents                                   |
//! |-----------|--------|--------------------------------------------|
//! | BASE_LO   | domain | bitmap address[31:12], size[6:2], valid[0] |
//! | BASE_HI   | domain | bitmap address[63:32]                      |
//! | CAP       | 0      | maps[23:16], domains[15:8]                 |
//! | CR        | 0      | enable, IO space, SL DEV, invalidate cache |
//!
//! After a bitmap changes the DEV cache must be invalidated, and the bitmap
//! is only authoritative once hardware clears INV_CACHE again.

use core::ops::Range;

use thiserror::Error;

use crate::mmio::{barrier, rmb, sealed, wmb, IoMapping, PhysMapper, RegisterBank};
use crate::platform::Vendor;
use crate::{LOG_TARGET, PAGE_SIZE};

// ============================================================================
// DEV CONSTANTS
// ============================================================================

/// PCI location of the DEV capability
pub mod dev_pci {
    pub const BUS: u8 = 0x0;
    pub const DEVICE: u8 = 0x18;
    pub const FUNCTION: u8 = 0x3;
    pub const HDR: u8 = 0xf0;
    pub const OP: u8 = 0xf4;
    pub const DATA: u8 = 0xf8;

    /// Capability id of the DEV block
    pub const PCI_CAPABILITIES_ID_DEV: u32 = 0x0f;
}

/// DEV functions and register bits
pub mod dev_reg {
    pub const DEV_BASE_LO: u32 = 0;
    pub const DEV_BASE_HI: u32 = 1;
    pub const DEV_MAP: u32 = 2;
    pub const DEV_CAP: u32 = 3;
    pub const DEV_CR: u32 = 4;
    pub const DEV_ERR_STATUS: u32 = 5;
    pub const DEV_ERR_ADDR_LO: u32 = 6;
    pub const DEV_ERR_ADDR_HI: u32 = 7;

    pub const DEV_CR_ENABLE: u32 = 1 << 0;
    pub const DEV_CR_MEM_CLR: u32 = 1 << 1;
    pub const DEV_CR_IOSP_EN: u32 = 1 << 2;
    pub const DEV_CR_MCE_EN: u32 = 1 << 3;
    pub const DEV_CR_INV_CACHE: u32 = 1 << 4;
    pub const DEV_CR_SL_DEV_EN: u32 = 1 << 5;
    pub const DEV_CR_WALK_PROBE: u32 = 1 << 6;

    pub const DEV_BASE_LO_VALID: u32 = 1 << 0;
    pub const DEV_BASE_LO_PROTECTED: u32 = 1 << 1;
    pub const DEV_BASE_LO_SIZE_MASK: u32 = 0x7c;
    pub const DEV_BASE_LO_ADDR_MASK: u32 = 0xffff_f000;
}

use dev_reg::*;

/// Bytes in one domain bitmap: one bit per page of the 4 GiB space
pub const DEV_BITMAP_BYTES: usize = (1usize << 32) / PAGE_SIZE / 8;

/// CR reads before a cache flush is declared stuck
pub const DEV_FLUSH_POLL_LIMIT: u32 = 100_000;

/// DEV failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DevError {
    /// Domain index beyond the capability count
    #[error("invalid DEV domain {domain}")]
    InvalidDomain { domain: u8 },
    /// No bitmap loaded for the domain
    #[error("no DEV bitmap loaded for domain {domain}")]
    NoMap { domain: u8 },
    /// INV_CACHE never cleared
    #[error("DEV cache invalidation timed out")]
    FlushTimeout,
    /// Range reaches past the end of the bitmap
    #[error("page frame {frame:#x} outside the DEV bitmap")]
    OutOfRange { frame: u64 },
    /// Bitmap memory could not be mapped
    #[error("failed to map DEV bitmap at {phys:#x}")]
    MapFailed { phys: u64 },
}

// ============================================================================
// REGISTER WINDOW
// ============================================================================

/// PCI configuration space access
pub trait PciConfig {
    fn read_config32(&self, bus: u8, device: u8, function: u8, offset: u8) -> u32;
    fn write_config32(&self, bus: u8, device: u8, function: u8, offset: u8, val: u32);
}

/// DEV registers through the OP/DATA pair; `reg` is `(function << 8) | index`
pub struct DevWindow<'p, P: PciConfig + ?Sized> {
    pci: &'p P,
}

impl<P: PciConfig + ?Sized> sealed::Sealed for DevWindow<'_, P> {}

impl<P: PciConfig + ?Sized> RegisterBank for DevWindow<'_, P> {
    fn read64(&self, reg: u32) -> u64 {
        barrier();
        self.pci
            .write_config32(dev_pci::BUS, dev_pci::DEVICE, dev_pci::FUNCTION, dev_pci::OP, reg);
        let val = self
            .pci
            .read_config32(dev_pci::BUS, dev_pci::DEVICE, dev_pci::FUNCTION, dev_pci::DATA);
        rmb();
        val as u64
    }

    fn write64(&self, reg: u32, val: u64) {
        barrier();
        self.pci
            .write_config32(dev_pci::BUS, dev_pci::DEVICE, dev_pci::FUNCTION, dev_pci::OP, reg);
        self.pci.write_config32(
            dev_pci::BUS,
            dev_pci::DEVICE,
            dev_pci::FUNCTION,
            dev_pci::DATA,
            val as u32,
        );
        wmb();
        barrier();
    }
}

impl<P: PciConfig + ?Sized> DevWindow<'_, P> {
    fn dev_read(&self, func: u32, index: u8) -> u32 {
        self.read64((func << 8) | index as u32) as u32
    }

    fn dev_write(&self, func: u32, index: u8, val: u32) {
        self.write64((func << 8) | index as u32, val as u64)
    }
}

// ============================================================================
// DEV DEVICE
// ============================================================================

/// State of one protection domain as the hardware reports it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtectionDomain {
    pub index: u8,
    pub bitmap_base: u32,
    pub size_class: u8,
    pub valid: bool,
    pub enabled: bool,
}

/// A located DEV capability
pub struct AmdDev<'p, P: PciConfig + ?Sized> {
    window: DevWindow<'p, P>,
    cap_hdr: u32,
}

impl<'p, P: PciConfig + ?Sized> AmdDev<'p, P> {
    /// Find the DEV capability header; `None` if this northbridge has none
    pub fn locate(pci: &'p P) -> Option<Self> {
        let cap_hdr = pci.read_config32(dev_pci::BUS, dev_pci::DEVICE, dev_pci::FUNCTION, dev_pci::HDR);
        if cap_hdr & 0xff != dev_pci::PCI_CAPABILITIES_ID_DEV {
            log::debug!(target: LOG_TARGET, "no DEV capability (header {:#x})", cap_hdr);
            return None;
        }
        Some(Self {
            window: DevWindow { pci },
            cap_hdr,
        })
    }

    /// Raw capability header
    pub fn cap_header(&self) -> u32 {
        self.cap_hdr
    }

    /// Number of bitmap slots
    pub fn map_count(&self) -> u8 {
        (self.window.dev_read(DEV_CAP, 0) >> 16) as u8
    }

    /// Number of protection domains
    pub fn domain_count(&self) -> u8 {
        (self.window.dev_read(DEV_CAP, 0) >> 8) as u8
    }

    fn check_domain(&self, domain: u8) -> Result<(), DevError> {
        if domain >= self.domain_count() {
            log::error!(target: LOG_TARGET, "DEV domain {} out of range", domain);
            return Err(DevError::InvalidDomain { domain });
        }
        Ok(())
    }

    /// Point `domain` at the bitmap at `paddr` with size class `size`
    pub fn load_map(&self, domain: u8, size: u8, paddr: u32) -> Result<(), DevError> {
        self.check_domain(domain)?;

        let fields = (((size as u32) << 2) & DEV_BASE_LO_SIZE_MASK) | DEV_BASE_LO_VALID;
        let base_lo = (paddr & DEV_BASE_LO_ADDR_MASK) | fields;

        self.window.dev_write(DEV_BASE_HI, domain, 0);
        self.window.dev_write(DEV_BASE_LO, domain, base_lo);
        Ok(())
    }

    /// Bitmap address loaded for `domain`, 0 if none
    pub fn fetch_map(&self, domain: u8) -> u32 {
        let _hi = self.window.dev_read(DEV_BASE_HI, domain);
        self.window.dev_read(DEV_BASE_LO, domain) & DEV_BASE_LO_ADDR_MASK
    }

    /// What the hardware holds for `domain`
    pub fn domain(&self, domain: u8) -> Result<ProtectionDomain, DevError> {
        self.check_domain(domain)?;
        let lo = self.window.dev_read(DEV_BASE_LO, domain);
        let cr = self.window.dev_read(DEV_CR, 0);
        let valid = lo & DEV_BASE_LO_VALID != 0;
        Ok(ProtectionDomain {
            index: domain,
            bitmap_base: lo & DEV_BASE_LO_ADDR_MASK,
            size_class: ((lo & DEV_BASE_LO_SIZE_MASK) >> 2) as u8,
            valid,
            enabled: valid && cr & DEV_CR_ENABLE != 0,
        })
    }

    /// Turn protection on; `domain` must have a bitmap loaded
    pub fn enable(&self, domain: u8) -> Result<(), DevError> {
        self.check_domain(domain)?;
        if self.fetch_map(domain) == 0 {
            log::error!(target: LOG_TARGET, "DEV enable with no bitmap for domain {}", domain);
            return Err(DevError::NoMap { domain });
        }

        self.window
            .dev_write(DEV_CR, 0, DEV_CR_ENABLE | DEV_CR_IOSP_EN | DEV_CR_SL_DEV_EN);
        log::info!(target: LOG_TARGET, "DEV protection enabled (domain {})", domain);
        Ok(())
    }

    /// Turn protection off
    pub fn disable(&self) {
        let cr = self.window.dev_read(DEV_CR, 0);
        self.window
            .dev_write(DEV_CR, 0, cr & !(DEV_CR_ENABLE | DEV_CR_SL_DEV_EN));
    }

    /// Invalidate the DEV cache and wait for hardware to finish
    pub fn flush_cache(&self) -> Result<(), DevError> {
        let cr = self.window.dev_read(DEV_CR, 0);
        self.window
            .dev_write(DEV_CR, 0, cr | DEV_CR_INV_CACHE | DEV_CR_ENABLE);

        for _ in 0..DEV_FLUSH_POLL_LIMIT {
            if self.window.dev_read(DEV_CR, 0) & DEV_CR_INV_CACHE == 0 {
                return Ok(());
            }
            core::hint::spin_loop();
        }
        log::error!(target: LOG_TARGET, "DEV cache invalidation did not complete");
        Err(DevError::FlushTimeout)
    }

    /// Block device access to `[start, start + size)` in `domain`'s bitmap.
    ///
    /// `map` overrides the bitmap address loaded in hardware. Does nothing
    /// unless the platform is AMD.
    pub fn protect_pages<M: PhysMapper + ?Sized>(
        &self,
        vendor: Vendor,
        mapper: &M,
        domain: u8,
        start: u32,
        size: u32,
        map: Option<u32>,
    ) -> Result<Range<u64>, DevError> {
        if vendor != Vendor::Amd {
            return Ok(0..0);
        }

        self.check_domain(domain)?;
        let dev_map = match map {
            Some(paddr) => paddr,
            None => self.fetch_map(domain),
        };
        if dev_map == 0 {
            return Err(DevError::NoMap { domain });
        }

        let mut bitmap = IoMapping::new(mapper, dev_map as u64, DEV_BITMAP_BYTES).ok_or_else(|| {
            log::error!(target: LOG_TARGET, "error mapping DEV bitmap at {:#x}", dev_map);
            DevError::MapFailed { phys: dev_map as u64 }
        })?;
        set_protection_bits(bitmap.bytes_mut(), start as u64, size as u64)
    }
}

// ============================================================================
// BITMAP
// ============================================================================

/// Set the bit of every page frame touched by `[start, start + len)`.
///
/// Returns the frame range that was set. Nothing is written if the range
/// does not fit in `bitmap`.
pub fn set_protection_bits(bitmap: &mut [u8], start: u64, len: u64) -> Result<Range<u64>, DevError> {
    let page = PAGE_SIZE as u64;
    let first = start / page;
    if len == 0 {
        return Ok(first..first);
    }
    let end = start
        .checked_add(len)
        .map(|e| e.div_ceil(page))
        .ok_or(DevError::OutOfRange { frame: u64::MAX })?;

    let frames = (bitmap.len() as u64) * 8;
    if end > frames {
        log::error!(target: LOG_TARGET, "DEV range ends at frame {:#x} past bitmap end {:#x}", end, frames);
        return Err(DevError::OutOfRange { frame: end - 1 });
    }

    for frame in first..end {
        bitmap[(frame / 8) as usize] |= 1 << (frame % 8);
    }
    Ok(first..end)
}

// ============================================================================
// TESTS
// ============================================================================
