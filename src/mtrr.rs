//! # Pre-Launch State Validation
//!
//! Before `GETSEC[SENTER]` the OS loader saves the BSP's variable MTRRs and
//! `IA32_MISC_ENABLE` into the OS-MLE heap table, which SINIT then measures.
//! SINIT is free to reprogram those MSRs for the launch itself, and the MLE
//! must restore them. Comparing the saved record against the live CPU after
//! the OS-MLE table has been measured catches any change made between the
//! hardware measurement and hand-off.
//!
//! ## Check Order
//!
//! 1. saved vcnt ≤ MTRRcap.VCNT and ≤ 32
//! 2. MTRRdefType
//! 3. PHYSBASEn / PHYSMASKn for each saved range
//! 4. IA32_MISC_ENABLE
//!
//! The first mismatch wins; later checks are not run.

use crate::error::{Result, SlaunchError};
use crate::heap::os_mle;
use crate::LOG_TARGET;

// ============================================================================
// MSR DEFINITIONS
// ============================================================================

/// Model specific register numbers
pub mod msr {
    pub const MSR_MTRR_CAP: u32 = 0x0000_00fe;
    pub const MSR_MTRR_DEF_TYPE: u32 = 0x0000_02ff;
    pub const MSR_IA32_MISC_ENABLE: u32 = 0x0000_01a0;

    /// VCNT field of MTRRcap
    pub const CAPS_VARIABLE_MTRR_COUNT_MASK: u64 = 0xff;

    /// IA32_MTRR_PHYSBASEn
    #[inline]
    pub const fn mtrr_phys_base(n: u32) -> u32 {
        0x200 + 2 * n
    }

    /// IA32_MTRR_PHYSMASKn
    #[inline]
    pub const fn mtrr_phys_mask(n: u32) -> u32 {
        0x201 + 2 * n
    }
}

/// Architectural maximum of variable MTRRs the saved state can hold
pub const TXT_MAX_VARIABLE_MTRRS: usize = os_mle::TXT_MAX_VARIABLE_MTRRS;

/// Reads model specific registers on the boot CPU
pub trait MsrReader {
    fn rdmsr(&self, reg: u32) -> u64;
}

/// `rdmsr` on the executing CPU
#[cfg(target_arch = "x86_64")]
pub struct NativeMsr {
    _priv: (),
}

#[cfg(target_arch = "x86_64")]
impl NativeMsr {
    /// # Safety
    /// Must only be used at CPL 0, and only for MSRs the CPU implements.
    pub const unsafe fn new() -> Self {
        Self { _priv: () }
    }
}

#[cfg(target_arch = "x86_64")]
impl MsrReader for NativeMsr {
    fn rdmsr(&self, reg: u32) -> u64 {
        let (lo, hi): (u32, u32);
        // SAFETY: NativeMsr::new's contract
        unsafe {
            core::arch::asm!(
                "rdmsr",
                in("ecx") reg,
                out("eax") lo,
                out("edx") hi,
                options(nomem, nostack, preserves_flags)
            );
        }
        ((hi as u64) << 32) | lo as u64
    }
}

// ============================================================================
// SAVED STATE
// ============================================================================

/// One saved variable range
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MtrrPair {
    pub phys_base: u64,
    pub phys_mask: u64,
}

/// CPU configuration captured before the measured launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreLaunchSnapshot {
    /// Saved MTRRdefType
    pub default_type: u64,
    /// Number of saved variable ranges
    pub vcnt: u64,
    /// Saved PHYSBASE/PHYSMASK pairs (first `vcnt` are live)
    pub pairs: [MtrrPair; TXT_MAX_VARIABLE_MTRRS],
    /// Saved IA32_MISC_ENABLE
    pub misc_enable: u64,
}

fn le_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}

impl PreLaunchSnapshot {
    /// Parse the saved state out of the OS-MLE table body.
    ///
    /// Returns `None` if `os_mle_data` is too short to hold it.
    pub fn from_os_mle(os_mle_data: &[u8]) -> Option<Self> {
        if os_mle_data.len() < os_mle::AP_WAKE_EBP {
            return None;
        }

        let mtrrs = os_mle::SAVED_BSP_MTRRS;
        let mut pairs = [MtrrPair::default(); TXT_MAX_VARIABLE_MTRRS];
        for (i, pair) in pairs.iter_mut().enumerate() {
            let at = mtrrs + 16 + i * 16;
            pair.phys_base = le_u64(os_mle_data, at);
            pair.phys_mask = le_u64(os_mle_data, at + 8);
        }

        Some(Self {
            default_type: le_u64(os_mle_data, mtrrs),
            vcnt: le_u64(os_mle_data, mtrrs + 8),
            pairs,
            misc_enable: le_u64(os_mle_data, os_mle::SAVED_MISC_ENABLE_MSR),
        })
    }

    /// Live variable ranges
    pub fn ranges(&self) -> &[MtrrPair] {
        let n = core::cmp::min(self.vcnt, TXT_MAX_VARIABLE_MTRRS as u64) as usize;
        &self.pairs[..n]
    }
}

// ============================================================================
// VALIDATION
// ============================================================================

/// Compare the saved pre-launch state against the live CPU.
///
/// Each check has its own error so a reset code identifies which one failed.
pub fn validate_msrs<R: MsrReader + ?Sized>(saved: &PreLaunchSnapshot, cpu: &R) -> Result<()> {
    let caps = cpu.rdmsr(msr::MSR_MTRR_CAP);
    let vcnt = caps & msr::CAPS_VARIABLE_MTRR_COUNT_MASK;

    if saved.vcnt > vcnt || saved.vcnt > TXT_MAX_VARIABLE_MTRRS as u64 {
        log::error!(target: LOG_TARGET, "saved MTRR count {} exceeds {}", saved.vcnt, vcnt);
        return Err(SlaunchError::MtrrVcnt {
            saved: saved.vcnt,
            live: vcnt,
        });
    }

    if cpu.rdmsr(msr::MSR_MTRR_DEF_TYPE) != saved.default_type {
        log::error!(target: LOG_TARGET, "MTRRdefType does not match saved value");
        return Err(SlaunchError::MtrrDefType);
    }

    for (i, pair) in saved.ranges().iter().enumerate() {
        let index = i as u32;
        if cpu.rdmsr(msr::mtrr_phys_base(index)) != pair.phys_base {
            log::error!(target: LOG_TARGET, "MTRR physbase {} does not match saved value", index);
            return Err(SlaunchError::MtrrBase { index });
        }
        if cpu.rdmsr(msr::mtrr_phys_mask(index)) != pair.phys_mask {
            log::error!(target: LOG_TARGET, "MTRR physmask {} does not match saved value", index);
            return Err(SlaunchError::MtrrMask { index });
        }
    }

    if cpu.rdmsr(msr::MSR_IA32_MISC_ENABLE) != saved.misc_enable {
        log::error!(target: LOG_TARGET, "IA32_MISC_ENABLE does not match saved value");
        return Err(SlaunchError::MiscEnable);
    }

    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
