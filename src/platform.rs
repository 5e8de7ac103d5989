//! # Platform Setup
//!
//! Decides once, early, whether this boot came through a measured launch and
//! which mechanism performed it. The answer is a [`SlaunchPlatform`] that is
//! installed process-wide and never changes afterwards.
//!
//! | CPUID vendor   | Mechanism | Flags                  |
//! |----------------|-----------|------------------------|
//! | `GenuineIntel` | TXT       | `ACTIVE \| ARCH_TXT`    |
//! | `AuthenticAMD` | SKINIT    | `ACTIVE \| ARCH_SKINIT` |
//! | anything else  | -         | empty                  |
//!
//! On TXT the private configuration space must report the Intel vendor id;
//! setup then sets the secrets flag and opens locality 1. A failure here is
//! not fatal: the platform is simply reported as not launched.

use bitflags::bitflags;
use spin::Once;

use crate::error::{Result, SlaunchError};
use crate::mmio::{txt_reg, PhysMapper, RegisterBank, TxtConfigRegs};
use crate::LOG_TARGET;

bitflags! {
    /// Secure launch state seen by the rest of the boot
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SlaunchFlags: u32 {
        const ACTIVE = 0x0000_0001;
        const ARCH_SKINIT = 0x0000_0002;
        const ARCH_TXT = 0x0000_0004;
    }
}

/// CPUID leaf 0 vendor words
pub mod cpuid_vendor {
    /// "Genu" "ntel" "ineI"
    pub const INTEL: (u32, u32, u32) = (0x756e_6547, 0x6c65_746e, 0x4965_6e69);
    /// "Auth" "cAMD" "enti"
    pub const AMD: (u32, u32, u32) = (0x6874_7541, 0x444d_4163, 0x6974_6e65);
}

/// Measured launch mechanism
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vendor {
    /// Intel TXT, GETSEC[SENTER]
    Intel,
    /// AMD SKINIT
    Amd,
}

/// CPUID leaf 0 vendor signature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuidSignature {
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

impl CpuidSignature {
    /// Read leaf 0 on the executing CPU
    #[cfg(target_arch = "x86_64")]
    pub fn native() -> Self {
        #[allow(unused_unsafe)]
        // SAFETY: cpuid is available on every x86_64 CPU
        let leaf = unsafe { core::arch::x86_64::__cpuid(0) };
        Self {
            ebx: leaf.ebx,
            ecx: leaf.ecx,
            edx: leaf.edx,
        }
    }

    fn words(&self) -> (u32, u32, u32) {
        (self.ebx, self.ecx, self.edx)
    }
}

impl Vendor {
    /// Map a CPUID vendor signature to a launch mechanism
    pub fn from_cpuid(sig: &CpuidSignature) -> Option<Self> {
        match sig.words() {
            cpuid_vendor::INTEL => Some(Vendor::Intel),
            cpuid_vendor::AMD => Some(Vendor::Amd),
            _ => None,
        }
    }

    /// Flags describing an active launch on this vendor
    pub fn flags(self) -> SlaunchFlags {
        match self {
            Vendor::Intel => SlaunchFlags::ACTIVE | SlaunchFlags::ARCH_TXT,
            Vendor::Amd => SlaunchFlags::ACTIVE | SlaunchFlags::ARCH_SKINIT,
        }
    }
}

/// Outcome of platform setup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlaunchPlatform {
    flags: SlaunchFlags,
    vendor: Option<Vendor>,
}

impl SlaunchPlatform {
    /// No measured launch
    pub const fn inactive() -> Self {
        Self {
            flags: SlaunchFlags::empty(),
            vendor: None,
        }
    }

    /// Active launch through `vendor`
    pub fn active(vendor: Vendor) -> Self {
        Self {
            flags: vendor.flags(),
            vendor: Some(vendor),
        }
    }

    pub fn flags(&self) -> SlaunchFlags {
        self.flags
    }

    /// Launch mechanism, if a launch is active
    pub fn vendor(&self) -> Option<Vendor> {
        self.vendor
    }

    pub fn is_active(&self) -> bool {
        self.flags.contains(SlaunchFlags::ACTIVE)
    }
}

// ============================================================================
// SETUP
// ============================================================================

/// TXT side of setup: check the vendor id, set secrets, open locality 1
fn txt_setup<M: PhysMapper + ?Sized>(mapper: &M) -> Result<()> {
    let regs = TxtConfigRegs::map(mapper)?;

    let vid = (regs.read64(txt_reg::TXTCR_DIDVID) & 0xffff) as u16;
    if vid != txt_reg::TXT_INTEL_VID {
        log::error!(target: LOG_TARGET, "invalid TXT vendor id {:#06x}", vid);
        return Err(SlaunchError::InvalidTxtVendor { vid });
    }

    // TPM localities are handled through TXT on Intel
    regs.write64(txt_reg::TXTCR_CMD_SECRETS, 1);
    let _ = regs.read64(txt_reg::TXTCR_E2STS);
    regs.write64(txt_reg::TXTCR_CMD_OPEN_LOCALITY1, 1);
    let _ = regs.read64(txt_reg::TXTCR_E2STS);

    Ok(())
}

/// Detect the launch mechanism and prepare its hardware
pub fn slaunch_setup<M: PhysMapper + ?Sized>(sig: &CpuidSignature, mapper: &M) -> SlaunchPlatform {
    let vendor = match Vendor::from_cpuid(sig) {
        Some(vendor) => vendor,
        None => {
            log::error!(target: LOG_TARGET, "invalid platform: not Intel or AMD");
            return SlaunchPlatform::inactive();
        }
    };

    if vendor == Vendor::Intel {
        if let Err(e) = txt_setup(mapper) {
            log::error!(target: LOG_TARGET, "TXT setup failed: {}", e);
            return SlaunchPlatform::inactive();
        }
    }

    log::info!(target: LOG_TARGET, "secure launch active via {:?}", vendor);
    SlaunchPlatform::active(vendor)
}

// ============================================================================
// PROCESS-WIDE STATE
// ============================================================================

static PLATFORM: Once<SlaunchPlatform> = Once::new();

/// Publish the setup result; later calls keep the first value
pub fn install(platform: SlaunchPlatform) -> &'static SlaunchPlatform {
    PLATFORM.call_once(|| platform)
}

/// The installed platform, if setup has run
pub fn installed() -> Option<&'static SlaunchPlatform> {
    PLATFORM.get()
}

/// Current flags; empty until setup has been installed
pub fn slaunch_get_flags() -> SlaunchFlags {
    installed().map(SlaunchPlatform::flags).unwrap_or(SlaunchFlags::empty())
}

// ============================================================================
// TESTS
// ============================================================================
