//! # Secure Launch: DRTM Chain of Trust
//!
//! This library establishes a hardware-rooted chain of trust on x86 platforms
//! that entered the kernel through a measured launch (Intel TXT `GETSEC[SENTER]`
//! or AMD `SKINIT`).
//!
//! ## Components
//!
//! - **Register window** ([`mmio`]): barrier-fenced access to the TXT private
//!   configuration space and the AMD DEV indirect PCI registers
//! - **Heap table walker** ([`heap`]): locates one table in the TXT heap
//! - **Pre-launch state validator** ([`mtrr`]): re-checks MTRRs and
//!   `IA32_MISC_ENABLE` against the snapshot SINIT measured
//! - **Co-processor session** ([`tpm`]): locality-scoped TPM access
//! - **Measurement pipeline** ([`measure`]): hashes boot inputs into PCR 17/18
//! - **Table copy-out guard** ([`dmar`]): trusted copy of the SINIT DMAR table
//! - **Measurement log exposer** ([`evtlog`]): read-only view of the event log
//! - **Memory protection bitmap** ([`dev`]): AMD Device Exclusion Vector
//!
//! ## Launch Flow
//!
//! ```text
//! slaunch_setup ──► vendor = TXT | SKINIT
//!        │
//!        ▼
//! sl_main: open TPM @ locality 2
//!        ├─ PCR 18 ◄─ H(zero page)
//!        ├─ PCR 18 ◄─ H(command line)
//!        ├─ PCR 17 ◄─ H(initrd)                 (if present)
//!        ├─ PCR 18 ◄─ H(OS-MLE data, no log)    (TXT only)
//!        ├─ validate MTRRs / MISC_ENABLE        (TXT only)
//!        └─ close session
//!
//! any failure ──► platform reset (never returns)
//! ```
//!
//! Late initialisation ([`slaunch_late_init`]) later copies the DMAR table and
//! publishes the event log under `slaunch/log`.

#![cfg_attr(not(test), no_std)]
#![allow(clippy::new_without_default)]

pub mod error;
pub mod mmio;
pub mod heap;
pub mod mtrr;
pub mod tpm;
pub mod pcr;
pub mod measure;
pub mod reset;
pub mod platform;
pub mod dmar;
pub mod evtlog;
pub mod dev;

#[cfg(test)]
pub(crate) mod testutil;

// Re-exports
pub use error::{SlaunchError, Result};
pub use mmio::{IoMapping, PhysMapper, RegisterBank, TxtConfigRegs};
pub use heap::{txt_early_get_heap_table, TxtHeapTable};
pub use mtrr::{MsrReader, PreLaunchSnapshot};
pub use tpm::{TpmDriver, TpmError, TpmSession};
pub use pcr::PcrBank;
pub use measure::{measure_launch, sl_main, BootParams};
pub use platform::{slaunch_get_flags, slaunch_setup, SlaunchFlags, SlaunchPlatform, Vendor};
pub use dmar::DmarCopy;
pub use evtlog::{slaunch_late_init, EventLog, LateInit, SecurityFs};
pub use dev::{AmdDev, DevError, PciConfig};

use digest::Digest;

// ============================================================================
// CORE CONSTANTS
// ============================================================================

/// Page size used for every mapping and for the zero page measurement
pub const PAGE_SIZE: usize = 4096;

/// log target shared by every component
pub(crate) const LOG_TARGET: &str = "slaunch";

// ============================================================================
// HASH ALGORITHMS
// ============================================================================

/// TPM 2.0 algorithm identifiers
pub mod alg {
    pub const TPM_ALG_SHA1: u16 = 0x0004;
    pub const TPM_ALG_SHA256: u16 = 0x000B;
    pub const TPM_ALG_SHA384: u16 = 0x000C;
}

/// A streaming digest usable for DRTM measurements.
///
/// Ties a RustCrypto [`Digest`] to the TPM algorithm identifier that is sent
/// alongside the digest in every PCR extend.
pub trait DrtmHash: Digest + Clone {
    /// TPM_ALG_ID for this digest
    const TPM_ALG_ID: u16;
}

impl DrtmHash for sha1::Sha1 {
    const TPM_ALG_ID: u16 = alg::TPM_ALG_SHA1;
}

impl DrtmHash for sha2::Sha256 {
    const TPM_ALG_ID: u16 = alg::TPM_ALG_SHA256;
}

impl DrtmHash for sha2::Sha384 {
    const TPM_ALG_ID: u16 = alg::TPM_ALG_SHA384;
}

/// Hash a single region with a fresh digest state.
///
/// init → update → finalize/extract; no state is carried between regions.
pub fn measure_region<H: DrtmHash>(data: &[u8]) -> digest::Output<H> {
    let mut hasher = H::new();
    hasher.update(data);
    hasher.finalize()
}

// ============================================================================
// TESTS
// ============================================================================
