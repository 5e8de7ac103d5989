//! # Event Log Exposer
//!
//! The TPM event log the loader and SINIT appended to lives in the OS-MLE
//! heap table, right after the measured fields. Late in boot it is mapped
//! once and published as a read-only file, `slaunch/log`, for attestation
//! tooling.
//!
//! ```text
//! OS-MLE data
//! ┌───────────────────────┬──────────────┬───────────────────────┐
//! │ measured fields       │ log size u32 │ event log buffer      │
//! └───────────────────────┴──────────────┴───────────────────────┘
//!                                @572          @576 .. 576+size
//! ```
//!
//! ## Concurrency
//!
//! After publication the (mapping, size) pair never changes. Readers keep
//! their own position and buffer, so [`EventLog::read`] takes `&self` and
//! needs no lock.

use thiserror::Error;

use crate::dmar::DmarCopy;
use crate::error::Result;
use crate::heap::{os_mle, txt_early_get_heap_table, TxtHeapTable};
use crate::mmio::{IoMapping, PhysMapper};
use crate::platform::{SlaunchPlatform, Vendor};
use crate::LOG_TARGET;

/// Name of the directory holding the log
pub const SLAUNCH_DIR: &str = "slaunch";

/// Name of the log file
pub const SLAUNCH_LOG_FILE: &str = "log";

/// Owner and group may read, nobody writes
pub const SLAUNCH_LOG_MODE: u16 = 0o440;

/// EFAULT
const EFAULT: i32 = 14;

// ============================================================================
// EVENT LOG
// ============================================================================

/// Failed log read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LogReadError {
    /// Never published, or already torn down
    #[error("event log unavailable")]
    Unavailable,
}

impl LogReadError {
    /// Negative errno handed back to the reader
    pub const fn errno(&self) -> i32 {
        match self {
            LogReadError::Unavailable => -EFAULT,
        }
    }
}

struct Published<'m, M: PhysMapper + ?Sized> {
    mapping: IoMapping<'m, M>,
    size: usize,
}

/// Read-only view of the TPM event log
pub struct EventLog<'m, M: PhysMapper + ?Sized> {
    published: Option<Published<'m, M>>,
}

impl<'m, M: PhysMapper + ?Sized> EventLog<'m, M> {
    /// A log that was never published
    pub const fn unpublished() -> Self {
        Self { published: None }
    }

    /// Map the event log out of the OS-MLE heap table
    pub fn setup(mapper: &'m M) -> Result<Self> {
        let declared = {
            let header = txt_early_get_heap_table(mapper, TxtHeapTable::OsMleData as u32, os_mle::EVENT_LOG_BUFFER)?;
            header.read_u32(os_mle::EVENT_LOG_SIZE) as usize
        };

        let size = if declared > os_mle::TXT_MAX_EVENT_LOG_SIZE {
            log::warn!(
                target: LOG_TARGET,
                "event log size {:#x} clamped to {:#x}",
                declared,
                os_mle::TXT_MAX_EVENT_LOG_SIZE
            );
            os_mle::TXT_MAX_EVENT_LOG_SIZE
        } else {
            declared
        };

        let mapping = txt_early_get_heap_table(
            mapper,
            TxtHeapTable::OsMleData as u32,
            os_mle::EVENT_LOG_BUFFER + size,
        )?;
        log::info!(
            target: LOG_TARGET,
            "event log published at {:#x} ({} bytes)",
            mapping.phys() + os_mle::EVENT_LOG_BUFFER as u64,
            size
        );

        Ok(Self {
            published: Some(Published { mapping, size }),
        })
    }

    pub fn is_published(&self) -> bool {
        self.published.is_some()
    }

    /// Published log size in bytes
    pub fn size(&self) -> Option<usize> {
        self.published.as_ref().map(|p| p.size)
    }

    /// Copy log bytes starting at `*pos` into `buf` and advance `*pos`.
    ///
    /// Returns 0 at or past the end of the log.
    pub fn read(&self, pos: &mut u64, buf: &mut [u8]) -> core::result::Result<usize, LogReadError> {
        let log = self.published.as_ref().ok_or(LogReadError::Unavailable)?;

        let size = log.size as u64;
        if *pos >= size {
            return Ok(0);
        }
        let start = *pos as usize;
        let count = core::cmp::min(buf.len(), log.size - start);

        log.mapping
            .copy_from_io(os_mle::EVENT_LOG_BUFFER + start, &mut buf[..count]);
        *pos += count as u64;
        Ok(count)
    }

    /// Unmap the log; later reads report it unavailable
    pub fn teardown(&mut self) {
        if self.published.take().is_some() {
            log::info!(target: LOG_TARGET, "event log unpublished");
        }
    }
}

// ============================================================================
// LATE INITIALISATION
// ============================================================================

/// The security filesystem the log file is registered on
pub trait SecurityFs {
    type Node;

    fn create_dir(&mut self, name: &'static str) -> Option<Self::Node>;

    fn create_file(&mut self, dir: &Self::Node, name: &'static str, mode: u16) -> Option<Self::Node>;

    fn remove(&mut self, node: Self::Node);
}

/// Everything late initialisation set up
pub struct LateInit<'m, M: PhysMapper + ?Sized, N> {
    dmar: DmarCopy,
    log: EventLog<'m, M>,
    dir: Option<N>,
    file: Option<N>,
}

impl<'m, M: PhysMapper + ?Sized, N> LateInit<'m, M, N> {
    pub fn dmar(&self) -> &DmarCopy {
        &self.dmar
    }

    pub fn event_log(&self) -> &EventLog<'m, M> {
        &self.log
    }

    /// Whether `slaunch/log` exists
    pub fn is_exposed(&self) -> bool {
        self.file.is_some()
    }

    /// Remove the log file, then its directory, then unmap the log
    pub fn teardown<F: SecurityFs<Node = N>>(mut self, fs: &mut F) {
        if let Some(file) = self.file.take() {
            fs.remove(file);
        }
        if let Some(dir) = self.dir.take() {
            fs.remove(dir);
        }
        self.log.teardown();
    }
}

/// Register `slaunch/` and `slaunch/log`; both or neither
fn expose<F: SecurityFs>(fs: &mut F) -> Option<(F::Node, F::Node)> {
    let Some(dir) = fs.create_dir(SLAUNCH_DIR) else {
        log::error!(target: LOG_TARGET, "cannot create securityfs directory {}", SLAUNCH_DIR);
        return None;
    };
    match fs.create_file(&dir, SLAUNCH_LOG_FILE, SLAUNCH_LOG_MODE) {
        Some(file) => Some((dir, file)),
        None => {
            log::error!(target: LOG_TARGET, "cannot create securityfs file {}/{}", SLAUNCH_DIR, SLAUNCH_LOG_FILE);
            fs.remove(dir);
            None
        }
    }
}

/// Second-phase setup: copy the DMAR table and publish the event log.
///
/// Nothing here is fatal. Whatever fails is logged and left absent.
pub fn slaunch_late_init<'m, M, F>(
    platform: &SlaunchPlatform,
    mapper: &'m M,
    fs: &mut F,
) -> LateInit<'m, M, F::Node>
where
    M: PhysMapper + ?Sized,
    F: SecurityFs,
{
    let mut late = LateInit {
        dmar: DmarCopy::absent(),
        log: EventLog::unpublished(),
        dir: None,
        file: None,
    };

    if !platform.is_active() || platform.vendor() != Some(Vendor::Intel) {
        return late;
    }

    late.dmar = DmarCopy::capture(mapper);

    match EventLog::setup(mapper) {
        Ok(log) => late.log = log,
        Err(e) => {
            log::error!(target: LOG_TARGET, "event log setup failed: {}", e);
            return late;
        }
    }

    match expose(fs) {
        Some((dir, file)) => {
            late.dir = Some(dir);
            late.file = Some(file);
        }
        None => late.log.teardown(),
    }
    late
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dmar::DMAR_SIGNATURE;
    use crate::heap::sinit_mle;
    use crate::mmio::txt_reg;
    use crate::testutil::{build_heap, txt_platform_mem, FakePhysMem, FakeSecurityFs, FsNode};
    use proptest::prelude::*;

    fn log_bytes(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7) as u8).collect()
    }

    fn os_mle_with_log(log: &[u8], declared: u32) -> Vec<u8> {
        let mut body = vec![0u8; os_mle::EVENT_LOG_BUFFER + log.len()];
        body[os_mle::EVENT_LOG_SIZE..][..4].copy_from_slice(&declared.to_le_bytes());
        body[os_mle::EVENT_LOG_BUFFER..].copy_from_slice(log);
        body
    }

    fn sinit_with_dmar() -> Vec<u8> {
        let mut body = vec![0u8; 0x140];
        body[sinit_mle::SINIT_VTD_DMAR_TABLE_SIZE..][..4].copy_from_slice(&0x30u32.to_le_bytes());
        body[sinit_mle::SINIT_VTD_DMAR_TABLE_OFFSET..][..4].copy_from_slice(&0x108u32.to_le_bytes());
        body[0x100..0x104].copy_from_slice(DMAR_SIGNATURE);
        body
    }

    fn platform_with_log(log: &[u8]) -> FakePhysMem {
        let mem = txt_platform_mem();
        let os_mle = os_mle_with_log(log, log.len() as u32);
        build_heap(&mem, &[&[0u8; 0x20][..], &os_mle[..], &[0u8; 0x10][..], &sinit_with_dmar()[..]]);
        mem
    }

    fn txt() -> SlaunchPlatform {
        SlaunchPlatform::active(Vendor::Intel)
    }

    #[test]
    fn test_read_round_trip() {
        let data = log_bytes(300);
        let mem = platform_with_log(&data);
        let log = EventLog::setup(&mem).unwrap();
        assert_eq!(log.size(), Some(300));

        let mut pos = 0;
        let mut buf = vec![0u8; 512];
        assert_eq!(log.read(&mut pos, &mut buf), Ok(300));
        assert_eq!(&buf[..300], data.as_slice());
        assert_eq!(pos, 300);

        // At the end
        assert_eq!(log.read(&mut pos, &mut buf), Ok(0));
        assert_eq!(pos, 300);
    }

    #[test]
    fn test_read_clamps_at_end() {
        let data = log_bytes(100);
        let mem = platform_with_log(&data);
        let log = EventLog::setup(&mem).unwrap();

        let mut pos = 90;
        let mut buf = [0u8; 64];
        assert_eq!(log.read(&mut pos, &mut buf), Ok(10));
        assert_eq!(&buf[..10], &data[90..]);

        let mut past = 1000;
        assert_eq!(log.read(&mut past, &mut buf), Ok(0));
    }

    #[test]
    fn test_sequential_reads() {
        let data = log_bytes(100);
        let mem = platform_with_log(&data);
        let log = EventLog::setup(&mem).unwrap();

        let mut pos = 0;
        let mut out = Vec::new();
        let mut chunk = [0u8; 33];
        loop {
            let n = log.read(&mut pos, &mut chunk).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(out, data);
    }

    #[test]
    fn test_oversized_log_is_clamped() {
        let mem = txt_platform_mem();
        let data = log_bytes(os_mle::TXT_MAX_EVENT_LOG_SIZE + 0x100);
        let os_mle = os_mle_with_log(&data, data.len() as u32);
        build_heap(&mem, &[&[0u8; 0x20][..], &os_mle[..]]);

        let log = EventLog::setup(&mem).unwrap();
        assert_eq!(log.size(), Some(os_mle::TXT_MAX_EVENT_LOG_SIZE));
    }

    #[test]
    fn test_teardown_makes_reads_unavailable() {
        let mem = platform_with_log(&log_bytes(16));
        let mut log = EventLog::setup(&mem).unwrap();
        log.teardown();

        let mut pos = 0;
        let err = log.read(&mut pos, &mut [0u8; 8]).unwrap_err();
        assert_eq!(err, LogReadError::Unavailable);
        assert_eq!(err.errno(), -14);
        assert_eq!(mem.live_mappings(), 0);
    }

    #[test]
    fn test_concurrent_readers() {
        let data = log_bytes(4096);
        let mem = platform_with_log(&data);
        let log = EventLog::setup(&mem).unwrap();

        std::thread::scope(|s| {
            for step in [1usize, 17, 512, 4096] {
                let log = &log;
                let data = &data;
                s.spawn(move || {
                    let mut pos = 0;
                    let mut buf = vec![0u8; step];
                    let mut out = Vec::new();
                    while let Ok(n) = log.read(&mut pos, &mut buf) {
                        if n == 0 {
                            break;
                        }
                        out.extend_from_slice(&buf[..n]);
                    }
                    assert_eq!(&out, data);
                });
            }
        });
    }

    #[test]
    fn test_late_init_registers_log() {
        let mem = platform_with_log(&log_bytes(64));
        let mut fs = FakeSecurityFs::new();
        let late = slaunch_late_init(&txt(), &mem, &mut fs);

        assert!(late.is_exposed());
        assert!(late.event_log().is_published());
        assert!(late.dmar().is_present());
        assert_eq!(fs.nodes[0].1, FsNode::Dir("slaunch"));
        assert_eq!(fs.nodes[1].1, FsNode::File("slaunch", "log", 0o440));

        late.teardown(&mut fs);
        // File goes before its directory
        assert_eq!(fs.removed, [fs.nodes[1].0, fs.nodes[0].0]);
        assert_eq!(fs.live(), 0);
        assert_eq!(mem.live_mappings(), 0);
    }

    #[test]
    fn test_late_init_file_failure_leaves_nothing() {
        let mem = platform_with_log(&log_bytes(64));
        let mut fs = FakeSecurityFs::new();
        fs.fail_file = true;
        let late = slaunch_late_init(&txt(), &mem, &mut fs);

        assert!(!late.is_exposed());
        assert!(!late.event_log().is_published());
        assert_eq!(fs.live(), 0);
        // The DMAR copy does not depend on the log
        assert!(late.dmar().is_present());
    }

    #[test]
    fn test_late_init_without_heap() {
        let mem = platform_with_log(&log_bytes(64));
        mem.set_txt_reg(txt_reg::TXTCR_HEAP_SIZE, !0);
        let mut fs = FakeSecurityFs::new();
        let late = slaunch_late_init(&txt(), &mem, &mut fs);

        assert!(!late.is_exposed());
        assert!(!late.dmar().is_present());
        assert!(fs.nodes.is_empty());
        assert_eq!(mem.live_mappings(), 0);
    }

    #[test]
    fn test_late_init_inactive_or_amd() {
        let mem = FakePhysMem::new();
        let mut fs = FakeSecurityFs::new();
        for platform in [SlaunchPlatform::inactive(), SlaunchPlatform::active(Vendor::Amd)] {
            let late = slaunch_late_init(&platform, &mem, &mut fs);
            assert!(!late.is_exposed());
        }
        assert_eq!(mem.total_maps(), 0);
    }

    proptest! {
        #[test]
        fn prop_read_never_exceeds_remaining(
            size in 0usize..600,
            pos in 0u64..700,
            count in 0usize..700,
        ) {
            let data = log_bytes(size);
            let mem = platform_with_log(&data);
            let log = EventLog::setup(&mem).unwrap();

            let mut cursor = pos;
            let mut buf = vec![0u8; count];
            let n = log.read(&mut cursor, &mut buf).unwrap();

            let expected = if pos >= size as u64 { 0 } else { count.min(size - pos as usize) };
            prop_assert_eq!(n, expected);
            prop_assert_eq!(cursor, pos + n as u64);
            if n > 0 {
                prop_assert_eq!(&buf[..n], &data[pos as usize..pos as usize + n]);
            }
        }
    }
}
