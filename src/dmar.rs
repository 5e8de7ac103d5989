//! # DMAR Table Copy
//!
//! SINIT hands the OS a verified copy of the ACPI DMAR table inside the
//! SINIT-MLE heap table. The heap stays writable by firmware and DMA until
//! the IOMMU is up, so the table is copied once into a fixed buffer owned by
//! the kernel and the IOMMU code reads that copy instead.
//!
//! A table larger than the buffer is dropped, never truncated. Any failure
//! leaves the copy absent and the IOMMU code falls back to the table it
//! found itself.

use crate::heap::{sinit_mle, txt_early_get_heap_table, TxtHeapTable, HEAP_TABLE_HEADER};
use crate::mmio::PhysMapper;
use crate::{LOG_TARGET, PAGE_SIZE};

/// Largest DMAR table that is kept
pub const DMAR_COPY_CAPACITY: usize = PAGE_SIZE;

/// ACPI signature of the DMAR table
pub const DMAR_SIGNATURE: &[u8; 4] = b"DMAR";

/// Bytes of SINIT-MLE data needed to read the DMAR size and offset
const SINIT_DMAR_FIELDS: usize = sinit_mle::SINIT_VTD_DMAR_TABLE_OFFSET + 4;

/// Trusted copy of the SINIT DMAR table
pub struct DmarCopy {
    buf: [u8; DMAR_COPY_CAPACITY],
    len: usize,
}

impl DmarCopy {
    /// A copy holding nothing
    pub const fn absent() -> Self {
        Self {
            buf: [0; DMAR_COPY_CAPACITY],
            len: 0,
        }
    }

    /// Copy the DMAR table out of the SINIT-MLE heap table
    pub fn capture<M: PhysMapper + ?Sized>(mapper: &M) -> Self {
        let mut copy = Self::absent();
        if let Some(len) = copy.fill(mapper) {
            copy.len = len;
            log::info!(target: LOG_TARGET, "DMAR table copied ({} bytes)", len);
        }
        copy
    }

    fn fill<M: PhysMapper + ?Sized>(&mut self, mapper: &M) -> Option<usize> {
        let (size, offset) = {
            let fields = txt_early_get_heap_table(mapper, TxtHeapTable::SinitMleData as u32, SINIT_DMAR_FIELDS)
                .map_err(|e| log::error!(target: LOG_TARGET, "cannot read SINIT-MLE data: {}", e))
                .ok()?;
            (
                fields.read_u32(sinit_mle::SINIT_VTD_DMAR_TABLE_SIZE) as usize,
                fields.read_u32(sinit_mle::SINIT_VTD_DMAR_TABLE_OFFSET) as usize,
            )
        };

        if size == 0 || size > DMAR_COPY_CAPACITY {
            log::error!(target: LOG_TARGET, "DMAR table size {} does not fit {} byte buffer", size, DMAR_COPY_CAPACITY);
            return None;
        }
        // The offset counts the table's own size header
        let Some(start) = offset.checked_sub(HEAP_TABLE_HEADER as usize) else {
            log::error!(target: LOG_TARGET, "DMAR table offset {:#x} inside heap header", offset);
            return None;
        };

        let table = txt_early_get_heap_table(mapper, TxtHeapTable::SinitMleData as u32, start + size)
            .map_err(|e| log::error!(target: LOG_TARGET, "cannot map DMAR table: {}", e))
            .ok()?;
        table.copy_from_io(start, &mut self.buf[..size]);
        Some(size)
    }

    /// Whether a table was copied
    pub fn is_present(&self) -> bool {
        self.len != 0
    }

    /// The copied bytes, if any
    pub fn bytes(&self) -> Option<&[u8]> {
        self.is_present().then(|| &self.buf[..self.len])
    }

    /// The trusted copy if it carries the DMAR signature, else `fallback`
    pub fn table<'a>(&'a self, fallback: &'a [u8]) -> &'a [u8] {
        match self.bytes() {
            Some(copy) if copy.starts_with(DMAR_SIGNATURE) => copy,
            _ => fallback,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
