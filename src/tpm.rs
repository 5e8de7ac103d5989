//! # Trust Co-processor Session
//!
//! The measurement path never talks to the TPM directly. It drives a
//! [`TpmDriver`] through a [`TpmSession`], which holds one locality for its
//! whole lifetime:
//!
//! ```text
//! open ─► request_locality(2) ─► extend* ─► relinquish_locality ─► close
//! ```
//!
//! The relinquish/close pair runs exactly once, from `Drop`, so every exit
//! path of the caller releases the device. When the caller resets the
//! platform instead of returning, the session simply never closes.

use thiserror::Error;

use crate::error::{Result, SlaunchError};
use crate::{measure_region, DrtmHash, LOG_TARGET};

/// Highest locality defined by the TIS/CRB interfaces
pub const TPM_MAX_LOCALITY: u8 = 4;

/// Locality the DRTM measurements are taken at
pub const SL_LOCALITY: u8 = 2;

/// TPM_RC_FAILURE
pub const TPM_RC_FAILURE: u32 = 0x101;

// ============================================================================
// DRIVER CONTRACT
// ============================================================================

/// Failures reported by a TPM driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TpmError {
    /// No TPM responded
    #[error("no TPM present")]
    NotPresent,
    /// Locality request refused or timed out
    #[error("locality {0} not granted")]
    Locality(u8),
    /// Operation needs a locality that is not held
    #[error("no active locality")]
    NoLocality,
    /// PCR index out of range or not extendable at this locality
    #[error("bad PCR index {0}")]
    BadPcr(u8),
    /// Hash algorithm not supported by an active bank
    #[error("unsupported hash algorithm {0:#06x}")]
    BadAlgorithm(u16),
    /// Digest length does not match the algorithm
    #[error("digest length {0} does not match algorithm")]
    BadDigest(usize),
    /// Device returned an error response code
    #[error("TPM response code {0:#x}")]
    Response(u32),
}

/// Operations the secure launch core needs from a TPM driver
pub trait TpmDriver {
    /// Bring the device up (enable_tpm)
    fn open(&mut self) -> core::result::Result<(), TpmError>;

    /// Acquire `locality`
    fn request_locality(&mut self, locality: u8) -> core::result::Result<(), TpmError>;

    /// Extend `pcr` with a digest produced by algorithm `alg`
    fn extend_pcr(&mut self, pcr: u8, alg: u16, digest: &[u8]) -> core::result::Result<(), TpmError>;

    /// Give up the active locality
    fn relinquish_locality(&mut self);

    /// Release the driver handle
    fn close(&mut self);
}

// ============================================================================
// SESSION
// ============================================================================

/// A TPM opened at a fixed locality, released on drop
pub struct TpmSession<'t, T: TpmDriver + ?Sized> {
    tpm: &'t mut T,
    locality: u8,
}

impl<'t, T: TpmDriver + ?Sized> TpmSession<'t, T> {
    /// Open the device and acquire `locality`.
    ///
    /// If the locality cannot be acquired the device is closed again before
    /// the error is returned.
    pub fn open(tpm: &'t mut T, locality: u8) -> Result<Self> {
        if let Err(e) = tpm.open() {
            log::error!(target: LOG_TARGET, "TPM init failed: {}", e);
            return Err(SlaunchError::TpmInit);
        }

        if let Err(e) = tpm.request_locality(locality) {
            log::error!(target: LOG_TARGET, "TPM locality {} request failed: {}", locality, e);
            tpm.close();
            return Err(SlaunchError::TpmLocality { locality });
        }

        log::info!(target: LOG_TARGET, "TPM session open at locality {}", locality);
        Ok(Self { tpm, locality })
    }

    /// Locality held by this session
    pub fn locality(&self) -> u8 {
        self.locality
    }

    /// Extend `pcr` with an already computed digest
    pub fn extend<H: DrtmHash>(&mut self, pcr: u8, digest: &digest::Output<H>) -> Result<()> {
        self.tpm
            .extend_pcr(pcr, H::TPM_ALG_ID, digest.as_slice())
            .map_err(|e| {
                log::error!(target: LOG_TARGET, "extend of PCR {} failed: {}", pcr, e);
                SlaunchError::TpmExtend { pcr }
            })
    }

    /// Digest `data` with a fresh hash state and extend the result into `pcr`
    pub fn measure<H: DrtmHash>(&mut self, pcr: u8, data: &[u8]) -> Result<digest::Output<H>> {
        let digest = measure_region::<H>(data);
        log::debug!(target: LOG_TARGET, "PCR {} <- {:02x?}", pcr, digest.as_slice());
        self.extend::<H>(pcr, &digest)?;
        Ok(digest)
    }

    /// Release the locality and the device
    pub fn close(self) {}
}

impl<T: TpmDriver + ?Sized> Drop for TpmSession<'_, T> {
    fn drop(&mut self) {
        self.tpm.relinquish_locality();
        self.tpm.close();
        log::info!(target: LOG_TARGET, "TPM session at locality {} closed", self.locality);
    }
}

// ============================================================================
// TESTS
// ============================================================================
