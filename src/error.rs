//! # Secure Launch Errors
//!
//! Every failure on the early measurement path maps to a numeric code that
//! the TXT reset path writes into the ERRORCODE register, so that a post-mortem
//! read of that register tells which check broke.
//!
//! | Category          | Variants                                        |
//! |-------------------|-------------------------------------------------|
//! | hardware window   | `RegsMap`, `HeapInvalidBase`, `HeapInvalidSize`, `HeapMap` |
//! | table walk        | `HeapTableIndex`, `HeapOverrun`                 |
//! | co-processor      | `TpmInit`, `TpmLocality`, `TpmExtend`           |
//! | state integrity   | `MtrrVcnt`, `MtrrDefType`, `MtrrBase`, `MtrrMask`, `MiscEnable` |
//! | vendor detection  | `InvalidTxtVendor`                              |

use thiserror::Error;

/// Secure launch error codes (TXT ERRORCODE values)
pub mod codes {
    pub const SL_ERROR_GENERIC: u32 = 0xc000_8001;
    pub const SL_ERROR_TPM_INIT: u32 = 0xc000_8002;
    pub const SL_ERROR_TPM_EXTEND: u32 = 0xc000_8006;
    pub const SL_ERROR_MTRR_INV_VCNT: u32 = 0xc000_8007;
    pub const SL_ERROR_MTRR_INV_DEF_TYPE: u32 = 0xc000_8008;
    pub const SL_ERROR_MTRR_INV_BASE: u32 = 0xc000_8009;
    pub const SL_ERROR_MTRR_INV_MASK: u32 = 0xc000_800a;
    pub const SL_ERROR_MSR_INV_MISC_EN: u32 = 0xc000_800b;
    pub const SL_ERROR_HEAP_WALK: u32 = 0xc000_800e;
    pub const SL_ERROR_HEAP_MAP: u32 = 0xc000_800f;
    pub const SL_ERROR_TPM_GET_LOC: u32 = 0xc000_8010;
    pub const SL_ERROR_HEAP_INVALID: u32 = 0xc000_8011;
    pub const SL_ERROR_REGS_MAP: u32 = 0xc000_8012;
}

use codes::*;

/// Errors raised by the secure launch core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SlaunchError {
    /// The TXT private configuration space could not be mapped
    #[error("failed to map TXT configuration registers")]
    RegsMap,
    /// HEAP_BASE reads back as the all-ones sentinel
    #[error("invalid TXT heap base")]
    HeapInvalidBase,
    /// HEAP_SIZE reads back as the all-ones sentinel
    #[error("invalid TXT heap size")]
    HeapInvalidSize,
    /// Requested heap table is past the last known table
    #[error("invalid heap table index {index}")]
    HeapTableIndex { index: u32 },
    /// A heap offset field or table could not be mapped
    #[error("failed to map TXT heap at {phys:#x}")]
    HeapMap { phys: u64 },
    /// The size chain leads outside the heap
    #[error("TXT heap walk overran the heap at {phys:#x}")]
    HeapOverrun { phys: u64 },
    /// A boot input region could not be mapped
    #[error("failed to map boot input at {phys:#x} ({len} bytes)")]
    RegionMap { phys: u64, len: usize },
    /// No TPM available
    #[error("TPM initialisation failed")]
    TpmInit,
    /// Locality could not be acquired
    #[error("failed to acquire TPM locality {locality}")]
    TpmLocality { locality: u8 },
    /// PCR extend rejected by the TPM
    #[error("failed to extend PCR {pcr}")]
    TpmExtend { pcr: u8 },
    /// Saved variable MTRR count is larger than the CPU or architecture allows
    #[error("saved variable MTRR count {saved} invalid (cpu supports {live})")]
    MtrrVcnt { saved: u64, live: u64 },
    /// MTRRdefType changed since launch
    #[error("MTRR default type changed")]
    MtrrDefType,
    /// A variable MTRR base changed since launch
    #[error("MTRR physbase {index} changed")]
    MtrrBase { index: u32 },
    /// A variable MTRR mask changed since launch
    #[error("MTRR physmask {index} changed")]
    MtrrMask { index: u32 },
    /// IA32_MISC_ENABLE changed since launch
    #[error("IA32_MISC_ENABLE changed")]
    MiscEnable,
    /// TXT DIDVID does not carry the Intel vendor id
    #[error("invalid TXT vendor id {vid:#06x}")]
    InvalidTxtVendor { vid: u16 },
}

impl SlaunchError {
    /// Numeric code reported through the platform reset path
    pub const fn code(&self) -> u32 {
        match self {
            SlaunchError::RegsMap => SL_ERROR_REGS_MAP,
            SlaunchError::HeapInvalidBase | SlaunchError::HeapInvalidSize => SL_ERROR_HEAP_INVALID,
            SlaunchError::HeapTableIndex { .. } | SlaunchError::HeapOverrun { .. } => {
                SL_ERROR_HEAP_WALK
            }
            SlaunchError::HeapMap { .. } | SlaunchError::RegionMap { .. } => SL_ERROR_HEAP_MAP,
            SlaunchError::TpmInit => SL_ERROR_TPM_INIT,
            SlaunchError::TpmLocality { .. } => SL_ERROR_TPM_GET_LOC,
            SlaunchError::TpmExtend { .. } => SL_ERROR_TPM_EXTEND,
            SlaunchError::MtrrVcnt { .. } => SL_ERROR_MTRR_INV_VCNT,
            SlaunchError::MtrrDefType => SL_ERROR_MTRR_INV_DEF_TYPE,
            SlaunchError::MtrrBase { .. } => SL_ERROR_MTRR_INV_BASE,
            SlaunchError::MtrrMask { .. } => SL_ERROR_MTRR_INV_MASK,
            SlaunchError::MiscEnable => SL_ERROR_MSR_INV_MISC_EN,
            SlaunchError::InvalidTxtVendor { .. } => SL_ERROR_GENERIC,
        }
    }
}

/// Result type for secure launch operations
pub type Result<T> = core::result::Result<T, SlaunchError>;
