//! # Platform Reset Path
//!
//! Terminal action for any failure on the measurement path. Nothing here
//! returns.
//!
//! ## Intel TXT
//!
//! ```text
//! ERRORCODE ◄─ code
//! read E2STS
//! CMD_UNLOCK_MEM_CONFIG ◄─ 1
//! read E2STS
//! CMD_RESET ◄─ 1
//! pause forever
//! ```
//!
//! The error code survives the reset in ERRORCODE for post-mortem reads.
//!
//! ## AMD SKINIT
//!
//! There is no defined error register or reset command on this path yet.
//! [`skinit_reset`] traps with an invalid opcode; platform owners still have
//! to define what a clean SKINIT abort looks like.

use crate::error::SlaunchError;
use crate::mmio::{txt_reg, PhysMapper, RegisterBank, TxtConfigRegs};
use crate::platform::Vendor;
use crate::LOG_TARGET;

/// Write `code` and request a TXT reset, without waiting for it
pub fn txt_reset_sequence<B: RegisterBank + ?Sized>(regs: &B, code: u32) {
    regs.write64(txt_reg::TXTCR_ERRORCODE, code as u64);
    let _ = regs.read64(txt_reg::TXTCR_E2STS);
    regs.write64(txt_reg::TXTCR_CMD_UNLOCK_MEM_CONFIG, 1);
    let _ = regs.read64(txt_reg::TXTCR_E2STS);
    regs.write64(txt_reg::TXTCR_CMD_RESET, 1);
}

/// Spin until the platform goes away
pub fn halt() -> ! {
    loop {
        core::hint::spin_loop();
    }
}

/// Reset through the TXT register window with `code` in ERRORCODE
pub fn txt_reset<M: PhysMapper + ?Sized>(mapper: &M, code: u32) -> ! {
    match TxtConfigRegs::map(mapper) {
        Ok(regs) => txt_reset_sequence(&regs, code),
        Err(_) => log::error!(target: LOG_TARGET, "no TXT registers for reset, halting"),
    }
    halt()
}

#[cfg(target_arch = "x86_64")]
fn invalid_opcode() -> ! {
    // SAFETY: ud2 faults unconditionally and never returns
    unsafe { core::arch::asm!("ud2", options(noreturn, nomem, nostack)) }
}

#[cfg(not(target_arch = "x86_64"))]
fn invalid_opcode() -> ! {
    halt()
}

/// Unimplemented SKINIT abort: raise #UD
pub fn skinit_reset() -> ! {
    log::error!(target: LOG_TARGET, "SKINIT reset is not implemented, trapping");
    invalid_opcode()
}

/// Vendor specific fail-secure reset for `err`
pub fn platform_reset<M: PhysMapper + ?Sized>(vendor: Vendor, mapper: &M, err: SlaunchError) -> ! {
    match vendor {
        Vendor::Intel => txt_reset(mapper, err.code()),
        Vendor::Amd => skinit_reset(),
    }
}

// ============================================================================
// TESTS
// ============================================================================
