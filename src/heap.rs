//! # TXT Heap Table Walker
//!
//! The TXT heap is a chain of variable-length tables written by the BIOS,
//! the OS loader and SINIT:
//!
//! ```text
//! HEAP_BASE
//!   ├─ u64 size₀ │ BiosData      (0)
//!   ├─ u64 size₁ │ OsMleData     (1)
//!   ├─ u64 size₂ │ OsSinitData   (2)
//!   └─ u64 size₃ │ SinitMleData  (3)
//! ```
//!
//! Each size field counts its own 8 bytes, so table *k* begins at
//! `HEAP_BASE + size₀ + … + sizeₖ₋₁ + 8`. The heap is too large to map in one
//! go during early boot, so the walk maps one size field at a time.

use crate::error::{Result, SlaunchError};
use crate::mmio::{txt_reg, IoMapping, PhysMapper, RegisterBank, TxtConfigRegs};
use crate::LOG_TARGET;

// ============================================================================
// HEAP TABLES
// ============================================================================

/// Tables in the TXT heap, in chain order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TxtHeapTable {
    /// Written by the BIOS
    BiosData = 0,
    /// Written by the OS loader, consumed by the MLE
    OsMleData = 1,
    /// Written by the OS loader, consumed by SINIT
    OsSinitData = 2,
    /// Written by SINIT, consumed by the MLE
    SinitMleData = 3,
}

/// Last valid table index
pub const TXT_MAX_HEAP_TABLE: u32 = TxtHeapTable::SinitMleData as u32;

/// Hardware marker for an unprogrammed heap register
const INVALID_REG: u64 = !0;

/// Size of the length header in front of every table
pub const HEAP_TABLE_HEADER: u64 = 8;

/// OS-MLE data layout (offsets past the size header)
pub mod os_mle {
    pub const SAVED_MISC_ENABLE_MSR: usize = 28;
    pub const SAVED_BSP_MTRRS: usize = 36;
    /// Variable MTRR slots reserved in the saved state
    pub const TXT_MAX_VARIABLE_MTRRS: usize = 32;
    /// default_type (u64) + vcnt (u64) + pairs
    pub const SAVED_BSP_MTRRS_SIZE: usize = 16 + TXT_MAX_VARIABLE_MTRRS * 16;
    pub const AP_WAKE_EBP: usize = SAVED_BSP_MTRRS + SAVED_BSP_MTRRS_SIZE;
    pub const EVENT_LOG_SIZE: usize = AP_WAKE_EBP + 8;
    /// First byte of the TPM event log buffer; measurements stop here
    pub const EVENT_LOG_BUFFER: usize = EVENT_LOG_SIZE + 4;
    /// Largest event log the loader may reserve
    pub const TXT_MAX_EVENT_LOG_SIZE: usize = 5 * crate::PAGE_SIZE;
}

/// SINIT-MLE data layout (offsets past the size header)
pub mod sinit_mle {
    pub const SINIT_VTD_DMAR_TABLE_SIZE: usize = 136;
    /// Counted from the start of the table including its size header
    pub const SINIT_VTD_DMAR_TABLE_OFFSET: usize = 140;
}

// ============================================================================
// HEAP WALK
// ============================================================================

/// Read HEAP_BASE and HEAP_SIZE, rejecting the all-ones sentinel
fn read_heap_bounds<B: RegisterBank>(regs: &B) -> Result<(u64, u64)> {
    let base = regs.read64(txt_reg::TXTCR_HEAP_BASE);
    if base == INVALID_REG {
        log::error!(target: LOG_TARGET, "invalid TXT heap base");
        return Err(SlaunchError::HeapInvalidBase);
    }

    let size = regs.read64(txt_reg::TXTCR_HEAP_SIZE);
    if size == INVALID_REG {
        log::error!(target: LOG_TARGET, "invalid TXT heap size");
        return Err(SlaunchError::HeapInvalidSize);
    }

    Ok((base, size))
}

/// Map `bytes` of heap table `table`, starting after its size header.
///
/// The TXT register window is mapped only long enough to read the heap
/// bounds; each size field along the chain is mapped and unmapped on its own.
pub fn txt_early_get_heap_table<'m, M: PhysMapper + ?Sized>(
    mapper: &'m M,
    table: u32,
    bytes: usize,
) -> Result<IoMapping<'m, M>> {
    if table > TXT_MAX_HEAP_TABLE {
        log::error!(target: LOG_TARGET, "invalid type {} for early heap walk", table);
        return Err(SlaunchError::HeapTableIndex { index: table });
    }

    let (heap_base, heap_size) = {
        let regs = TxtConfigRegs::map(mapper)?;
        read_heap_bounds(&regs)?
    };
    let heap_end = heap_base.checked_add(heap_size).ok_or(SlaunchError::HeapInvalidSize)?;

    let mut base = heap_base;
    for i in 0..table {
        let field = IoMapping::new(mapper, base, HEAP_TABLE_HEADER as usize).ok_or_else(|| {
            log::error!(target: LOG_TARGET, "error mapping heap size field at {:#x}", base);
            SlaunchError::HeapMap { phys: base }
        })?;
        let offset = field.read_u64(0);
        drop(field);

        log::debug!(target: LOG_TARGET, "heap table {} at {:#x}, size {:#x}", i, base, offset);
        base = match base.checked_add(offset) {
            Some(next)
                if offset >= HEAP_TABLE_HEADER
                    && next.checked_add(HEAP_TABLE_HEADER).is_some_and(|e| e <= heap_end) =>
            {
                next
            }
            _ => {
                log::error!(target: LOG_TARGET, "heap table {} size {:#x} runs off the heap", i, offset);
                return Err(SlaunchError::HeapOverrun { phys: base });
            }
        };
    }

    // Skip the size field at the head of the table
    base += HEAP_TABLE_HEADER;
    if base.saturating_add(bytes as u64) > heap_end {
        log::error!(target: LOG_TARGET, "heap table {} request of {} bytes runs off the heap", table, bytes);
        return Err(SlaunchError::HeapOverrun { phys: base });
    }

    IoMapping::new(mapper, base, bytes).ok_or_else(|| {
        log::error!(target: LOG_TARGET, "error mapping heap table {} at {:#x}", table, base);
        SlaunchError::HeapMap { phys: base }
    })
}

// ============================================================================
// TESTS
// ============================================================================
