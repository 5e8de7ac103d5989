//! # Measurement Pipeline
//!
//! Runs once on the boot CPU, straight after the dynamic launch, and extends
//! every boot input into the DRTM PCRs before any of it is trusted:
//!
//! | Step | Region                              | PCR |
//! |------|-------------------------------------|-----|
//! | 1    | zero page (one page)                | 18  |
//! | 2    | kernel command line                 | 18  |
//! | 3    | initrd, if one was loaded           | 17  |
//! | 4    | OS-MLE data up to the event log     | 18  |
//! | 5    | MTRR / MISC_ENABLE re-validation    | -   |
//!
//! Steps 4 and 5 only run on Intel TXT. The command line pointer is read out
//! of the zero page only after the zero page has been measured.
//!
//! Every region is hashed with a fresh digest state and only the digest is
//! extended. Any failure is fatal: [`sl_main`] hands it to the platform reset
//! path, which never returns.

use sha2::Sha256;

use crate::error::{Result, SlaunchError};
use crate::heap::{os_mle, txt_early_get_heap_table, TxtHeapTable};
use crate::mmio::{IoMapping, PhysMapper};
use crate::mtrr::{validate_msrs, MsrReader, PreLaunchSnapshot};
use crate::pcr::{PCR_DRTM_CONFIG, PCR_DRTM_RAMDISK};
use crate::platform::Vendor;
use crate::reset::platform_reset;
use crate::tpm::{TpmDriver, TpmSession, SL_LOCALITY};
use crate::{DrtmHash, LOG_TARGET, PAGE_SIZE};

// ============================================================================
// BOOT PARAMETERS
// ============================================================================

/// Zero page field offsets
pub mod zero_page {
    pub const EXT_RAMDISK_IMAGE: usize = 0x0c0;
    pub const EXT_RAMDISK_SIZE: usize = 0x0c4;
    pub const EXT_CMD_LINE_PTR: usize = 0x0c8;
    pub const RAMDISK_IMAGE: usize = 0x218;
    pub const RAMDISK_SIZE: usize = 0x21c;
    pub const CMD_LINE_PTR: usize = 0x228;
    pub const CMDLINE_SIZE: usize = 0x238;
}

/// Read-only view of a measured zero page
#[derive(Clone, Copy)]
pub struct BootParams<'a> {
    raw: &'a [u8],
}

impl<'a> BootParams<'a> {
    /// Wrap a zero page; `None` if shorter than a page
    pub fn new(raw: &'a [u8]) -> Option<Self> {
        (raw.len() >= PAGE_SIZE).then_some(Self { raw })
    }

    fn u32_at(&self, offset: usize) -> u32 {
        let mut field = [0u8; 4];
        field.copy_from_slice(&self.raw[offset..offset + 4]);
        u32::from_le_bytes(field)
    }

    fn wide(&self, lo: usize, hi: usize) -> u64 {
        ((self.u32_at(hi) as u64) << 32) | self.u32_at(lo) as u64
    }

    /// Physical address of the command line
    pub fn cmd_line_ptr(&self) -> u64 {
        self.wide(zero_page::CMD_LINE_PTR, zero_page::EXT_CMD_LINE_PTR)
    }

    /// Command line length in bytes
    pub fn cmdline_size(&self) -> u32 {
        self.u32_at(zero_page::CMDLINE_SIZE)
    }

    /// Physical address of the initrd, 0 if none
    pub fn ramdisk_image(&self) -> u64 {
        self.wide(zero_page::RAMDISK_IMAGE, zero_page::EXT_RAMDISK_IMAGE)
    }

    /// Initrd length in bytes, 0 if none
    pub fn ramdisk_size(&self) -> u64 {
        self.wide(zero_page::RAMDISK_SIZE, zero_page::EXT_RAMDISK_SIZE)
    }
}

// ============================================================================
// PIPELINE
// ============================================================================

fn map_region<M: PhysMapper + ?Sized>(mapper: &M, phys: u64, len: usize) -> Result<IoMapping<'_, M>> {
    IoMapping::new(mapper, phys, len).ok_or_else(|| {
        log::error!(target: LOG_TARGET, "error mapping {} bytes at {:#x}", len, phys);
        SlaunchError::RegionMap { phys, len }
    })
}

/// Hash `len` bytes of physical memory at `phys` into `pcr`
fn measure_phys<H, M, T>(
    session: &mut TpmSession<'_, T>,
    mapper: &M,
    pcr: u8,
    phys: u64,
    len: usize,
) -> Result<()>
where
    H: DrtmHash,
    M: PhysMapper + ?Sized,
    T: TpmDriver + ?Sized,
{
    if len == 0 {
        session.measure::<H>(pcr, &[])?;
        return Ok(());
    }
    let region = map_region(mapper, phys, len)?;
    session.measure::<H>(pcr, region.bytes())?;
    Ok(())
}

/// Measure the boot inputs and, on TXT, re-validate the pre-launch state.
///
/// `bootparams` is the physical address of the zero page. The TPM session is
/// closed only when every step succeeds; on error the locality is left held
/// for the reset path.
pub fn measure_launch<H, M, T, R>(
    vendor: Vendor,
    mapper: &M,
    tpm: &mut T,
    msrs: &R,
    bootparams: u64,
) -> Result<()>
where
    H: DrtmHash,
    M: PhysMapper + ?Sized,
    T: TpmDriver + ?Sized,
    R: MsrReader + ?Sized,
{
    let mut session = TpmSession::open(tpm, SL_LOCALITY)?;

    match measure_inputs::<H, M, T, R>(&mut session, vendor, mapper, msrs, bootparams) {
        Ok(()) => {
            session.close();
            log::info!(target: LOG_TARGET, "launch measurements complete");
            Ok(())
        }
        Err(err) => {
            core::mem::forget(session);
            Err(err)
        }
    }
}

fn measure_inputs<H, M, T, R>(
    session: &mut TpmSession<'_, T>,
    vendor: Vendor,
    mapper: &M,
    msrs: &R,
    bootparams: u64,
) -> Result<()>
where
    H: DrtmHash,
    M: PhysMapper + ?Sized,
    T: TpmDriver + ?Sized,
    R: MsrReader + ?Sized,
{
    // The zero page is only trusted once it is in the PCR
    let zero_page = map_region(mapper, bootparams, PAGE_SIZE)?;
    session.measure::<H>(PCR_DRTM_CONFIG, zero_page.bytes())?;
    let bp = BootParams::new(zero_page.bytes()).ok_or(SlaunchError::RegionMap {
        phys: bootparams,
        len: PAGE_SIZE,
    })?;

    measure_phys::<H, _, _>(
        session,
        mapper,
        PCR_DRTM_CONFIG,
        bp.cmd_line_ptr(),
        bp.cmdline_size() as usize,
    )?;

    let (initrd, initrd_size) = (bp.ramdisk_image(), bp.ramdisk_size());
    drop(zero_page);
    if initrd != 0 && initrd_size != 0 {
        measure_phys::<H, _, _>(session, mapper, PCR_DRTM_RAMDISK, initrd, initrd_size as usize)?;
    } else {
        log::debug!(target: LOG_TARGET, "no initrd to measure");
    }

    if vendor == Vendor::Intel {
        // OS-MLE data up to, not including, the event log buffer
        let os_mle_data = txt_early_get_heap_table(
            mapper,
            TxtHeapTable::OsMleData as u32,
            os_mle::EVENT_LOG_BUFFER,
        )?;
        session.measure::<H>(PCR_DRTM_CONFIG, os_mle_data.bytes())?;

        let saved = PreLaunchSnapshot::from_os_mle(os_mle_data.bytes()).ok_or(SlaunchError::HeapMap {
            phys: os_mle_data.phys(),
        })?;
        drop(os_mle_data);
        validate_msrs(&saved, msrs)?;
    }

    Ok(())
}

/// Entry point of the measured launch stub.
///
/// Measures with the SHA-256 bank. Returns only if every measurement and
/// check succeeded; otherwise the platform is reset.
pub fn sl_main<M, T, R>(vendor: Vendor, mapper: &M, tpm: &mut T, msrs: &R, bootparams: u64)
where
    M: PhysMapper + ?Sized,
    T: TpmDriver + ?Sized,
    R: MsrReader + ?Sized,
{
    if let Err(err) = measure_launch::<Sha256, M, T, R>(vendor, mapper, tpm, msrs, bootparams) {
        log::error!(target: LOG_TARGET, "secure launch failed: {} ({:#x})", err, err.code());
        platform_reset(vendor, mapper, err);
    }
}

// ============================================================================
// TESTS
// ============================================================================
