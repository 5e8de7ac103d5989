//! # DRTM PCR Bank
//!
//! ## PCR Allocation for a Measured Launch
//!
//! | PCR | Usage                                   | Extended By  |
//! |-----|-----------------------------------------|--------------|
//! | 17  | DRTM: SINIT/SKINIT, then the initrd     | CPU, MLE     |
//! | 18  | DRTM: zero page, command line, OS-MLE   | MLE          |
//! | 19-22 | Reserved for DRTM                     | -            |
//!
//! PCRs 17-22 reset only on a dynamic launch and are extendable from
//! locality 2 upward.
//!
//! [`PcrBank`] is a software model of one hash bank that speaks the
//! [`TpmDriver`] contract, so the measurement pipeline can be replayed off
//! target: `PCR_new = H(PCR_old || digest)`, with an ordered record of every
//! extend.

use crate::tpm::{TpmDriver, TpmError, TPM_MAX_LOCALITY, TPM_RC_FAILURE};
use crate::DrtmHash;

// ============================================================================
// PCR CONSTANTS
// ============================================================================

/// Total number of PCRs in TPM 2.0
pub const PCR_COUNT: usize = 24;

/// Maximum valid PCR index
pub const MAX_PCR_INDEX: u8 = 23;

/// Initrd measurement
pub const PCR_DRTM_RAMDISK: u8 = 17;

/// Zero page, command line and OS-MLE data
pub const PCR_DRTM_CONFIG: u8 = 18;

/// First DRTM PCR
pub const PCR_DRTM_FIRST: u8 = 17;

/// Lowest locality allowed to extend the DRTM PCRs
pub const PCR_DRTM_MIN_LOCALITY: u8 = 2;

/// Extends recorded by one bank
pub const MAX_EVENTS: usize = 32;

// ============================================================================
// PCR BANK
// ============================================================================

/// One recorded extend
#[derive(Clone, Debug)]
pub struct PcrEvent<H: DrtmHash> {
    pub pcr: u8,
    pub digest: digest::Output<H>,
}

/// Software PCR bank for one hash algorithm
#[derive(Clone)]
pub struct PcrBank<H: DrtmHash> {
    values: [digest::Output<H>; PCR_COUNT],
    extend_count: [u32; PCR_COUNT],
    events: [PcrEvent<H>; MAX_EVENTS],
    event_count: usize,
    open: bool,
    locality: Option<u8>,
}

impl<H: DrtmHash> PcrBank<H> {
    /// Bank in the state a dynamic launch leaves it: every PCR zero
    pub fn new() -> Self {
        Self {
            values: core::array::from_fn(|_| Default::default()),
            extend_count: [0; PCR_COUNT],
            events: core::array::from_fn(|_| PcrEvent {
                pcr: 0,
                digest: Default::default(),
            }),
            event_count: 0,
            open: false,
            locality: None,
        }
    }

    /// Read a PCR value
    #[inline]
    pub fn read(&self, index: u8) -> Option<&digest::Output<H>> {
        self.values.get(index as usize)
    }

    /// Get extension count for a PCR
    #[inline]
    pub fn extend_count(&self, index: u8) -> Option<u32> {
        self.extend_count.get(index as usize).copied()
    }

    /// Every extend so far, oldest first
    pub fn events(&self) -> &[PcrEvent<H>] {
        &self.events[..self.event_count]
    }

    /// Digests extended into `pcr`, oldest first
    pub fn events_for(&self, pcr: u8) -> impl Iterator<Item = &digest::Output<H>> {
        self.events().iter().filter(move |e| e.pcr == pcr).map(|e| &e.digest)
    }

    /// Whether the driver handle is open
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Locality currently held
    pub fn active_locality(&self) -> Option<u8> {
        self.locality
    }

    /// PCR_new = H(PCR_old || digest)
    fn fold(&mut self, index: usize, digest: &[u8]) {
        let mut hasher = H::new();
        hasher.update(&self.values[index]);
        hasher.update(digest);
        self.values[index] = hasher.finalize();
    }
}

impl<H: DrtmHash> Default for PcrBank<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: DrtmHash> TpmDriver for PcrBank<H> {
    fn open(&mut self) -> Result<(), TpmError> {
        self.open = true;
        Ok(())
    }

    fn request_locality(&mut self, locality: u8) -> Result<(), TpmError> {
        if !self.open || locality > TPM_MAX_LOCALITY {
            return Err(TpmError::Locality(locality));
        }
        self.locality = Some(locality);
        Ok(())
    }

    fn extend_pcr(&mut self, pcr: u8, alg: u16, digest: &[u8]) -> Result<(), TpmError> {
        let locality = self.locality.ok_or(TpmError::NoLocality)?;
        if pcr > MAX_PCR_INDEX || (pcr >= PCR_DRTM_FIRST && locality < PCR_DRTM_MIN_LOCALITY) {
            return Err(TpmError::BadPcr(pcr));
        }
        if alg != H::TPM_ALG_ID {
            return Err(TpmError::BadAlgorithm(alg));
        }
        if digest.len() != <H as digest::Digest>::output_size() {
            return Err(TpmError::BadDigest(digest.len()));
        }

        let idx = pcr as usize;
        // Check for extend count overflow
        if self.extend_count[idx] == u32::MAX || self.event_count == MAX_EVENTS {
            return Err(TpmError::Response(TPM_RC_FAILURE));
        }

        self.fold(idx, digest);
        self.extend_count[idx] += 1;
        let slot = &mut self.events[self.event_count];
        slot.pcr = pcr;
        slot.digest.copy_from_slice(digest);
        self.event_count += 1;
        Ok(())
    }

    fn relinquish_locality(&mut self) {
        self.locality = None;
    }

    fn close(&mut self) {
        self.open = false;
        self.locality = None;
    }
}

// ============================================================================
// TESTS
// ============================================================================
