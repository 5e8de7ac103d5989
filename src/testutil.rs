//! In-memory stand-ins for the platform collaborators used by unit tests.

use core::cell::{Cell, UnsafeCell};
use core::ptr::NonNull;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::vec::Vec;

use crate::dev::{dev_pci, PciConfig};
use crate::evtlog::SecurityFs;
use crate::mmio::{txt_reg, PhysMapper};
use crate::mtrr::{msr, MsrReader};
use crate::PAGE_SIZE;

// ============================================================================
// PHYSICAL MEMORY
// ============================================================================

struct Region {
    base: u64,
    len: usize,
    // u64 backing keeps every page-aligned address 8-byte aligned
    words: UnsafeCell<Vec<u64>>,
}

/// Sparse physical memory made of independent regions
pub(crate) struct FakePhysMem {
    regions: Vec<Region>,
    live: AtomicUsize,
    total_maps: AtomicUsize,
    fail_at: Mutex<Vec<u64>>,
}

// SAFETY: tests only share the fake across threads for read-only mappings
unsafe impl Sync for FakePhysMem {}

impl FakePhysMem {
    pub fn new() -> Self {
        Self {
            regions: Vec::new(),
            live: AtomicUsize::new(0),
            total_maps: AtomicUsize::new(0),
            fail_at: Mutex::new(Vec::new()),
        }
    }

    /// Memory with the TXT private configuration space populated
    pub fn with_txt() -> Self {
        let mut mem = Self::new();
        mem.add_region(
            txt_reg::TXT_PRIV_CONFIG_REGS_BASE,
            txt_reg::TXT_NR_CONFIG_PAGES * PAGE_SIZE,
        );
        mem
    }

    pub fn add_region(&mut self, base: u64, len: usize) {
        let words = (len + 7) / 8;
        self.regions.push(Region {
            base,
            len,
            words: UnsafeCell::new(vec![0u64; words]),
        });
    }

    fn locate(&self, phys: u64, len: usize) -> Option<*mut u8> {
        self.regions.iter().find_map(|r| {
            let end = r.base + r.len as u64;
            if phys >= r.base && phys.checked_add(len as u64)? <= end {
                // SAFETY: offset checked against the region length
                let base = unsafe { (*r.words.get()).as_mut_ptr() as *mut u8 };
                Some(unsafe { base.add((phys - r.base) as usize) })
            } else {
                None
            }
        })
    }

    pub fn write_bytes(&self, phys: u64, data: &[u8]) {
        let ptr = self.locate(phys, data.len()).expect("write outside fake memory");
        unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len()) };
    }

    pub fn read_bytes(&self, phys: u64, len: usize) -> Vec<u8> {
        let ptr = self.locate(phys, len).expect("read outside fake memory");
        unsafe { core::slice::from_raw_parts(ptr, len).to_vec() }
    }

    pub fn write_u64(&self, phys: u64, val: u64) {
        self.write_bytes(phys, &val.to_le_bytes());
    }

    pub fn write_u32(&self, phys: u64, val: u32) {
        self.write_bytes(phys, &val.to_le_bytes());
    }

    pub fn read_u64(&self, phys: u64) -> u64 {
        let raw = self.read_bytes(phys, 8);
        u64::from_le_bytes(raw.try_into().unwrap())
    }

    /// Write a TXT configuration register
    pub fn set_txt_reg(&self, reg: u32, val: u64) {
        self.write_u64(txt_reg::TXT_PRIV_CONFIG_REGS_BASE + reg as u64, val);
    }

    pub fn txt_reg(&self, reg: u32) -> u64 {
        self.read_u64(txt_reg::TXT_PRIV_CONFIG_REGS_BASE + reg as u64)
    }

    /// Make any later mapping that starts at `phys` fail
    pub fn fail_map_at(&self, phys: u64) {
        self.fail_at.lock().unwrap().push(phys);
    }

    pub fn live_mappings(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn total_maps(&self) -> usize {
        self.total_maps.load(Ordering::SeqCst)
    }
}

unsafe impl PhysMapper for FakePhysMem {
    fn map(&self, phys: u64, len: usize) -> Option<NonNull<u8>> {
        if self.fail_at.lock().unwrap().contains(&phys) {
            return None;
        }
        let ptr = self.locate(phys, len)?;
        self.live.fetch_add(1, Ordering::SeqCst);
        self.total_maps.fetch_add(1, Ordering::SeqCst);
        NonNull::new(ptr)
    }

    fn unmap(&self, _virt: NonNull<u8>, _len: usize) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

// ============================================================================
// TXT HEAP BUILDER
// ============================================================================

/// Physical base of the fake TXT heap
pub(crate) const HEAP_BASE: u64 = 0x8000_0000;
pub(crate) const HEAP_SIZE: usize = 0x10_0000;

/// Lay out heap tables back to back; each entry is the body of one table.
///
/// Returns the physical address of each table's first body byte.
pub(crate) fn build_heap(mem: &FakePhysMem, bodies: &[&[u8]]) -> Vec<u64> {
    mem.set_txt_reg(txt_reg::TXTCR_HEAP_BASE, HEAP_BASE);
    mem.set_txt_reg(txt_reg::TXTCR_HEAP_SIZE, HEAP_SIZE as u64);

    let mut cursor = HEAP_BASE;
    let mut starts = Vec::new();
    for body in bodies {
        let table_size = body.len() as u64 + 8;
        mem.write_u64(cursor, table_size);
        mem.write_bytes(cursor + 8, body);
        starts.push(cursor + 8);
        cursor += table_size;
    }
    starts
}

/// Memory with TXT registers and an empty heap region
pub(crate) fn txt_platform_mem() -> FakePhysMem {
    let mut mem = FakePhysMem::with_txt();
    mem.add_region(HEAP_BASE, HEAP_SIZE);
    mem.set_txt_reg(txt_reg::TXTCR_DIDVID, 0xb002_8086);
    mem
}

// ============================================================================
// MSRS
// ============================================================================

/// Scripted MSR file
pub(crate) struct FakeMsr {
    values: BTreeMap<u32, u64>,
    pub reads: Cell<usize>,
}

impl FakeMsr {
    pub fn new() -> Self {
        Self {
            values: BTreeMap::new(),
            reads: Cell::new(0),
        }
    }

    pub fn set(&mut self, reg: u32, val: u64) {
        self.values.insert(reg, val);
    }

    /// CPU whose live state matches a snapshot with these ranges
    pub fn matching(caps_vcnt: u64, def_type: u64, pairs: &[(u64, u64)], misc: u64) -> Self {
        let mut m = Self::new();
        m.set(msr::MSR_MTRR_CAP, 0x0d00 | caps_vcnt);
        m.set(msr::MSR_MTRR_DEF_TYPE, def_type);
        for (i, (base, mask)) in pairs.iter().enumerate() {
            m.set(msr::mtrr_phys_base(i as u32), *base);
            m.set(msr::mtrr_phys_mask(i as u32), *mask);
        }
        m.set(msr::MSR_IA32_MISC_ENABLE, misc);
        m
    }
}

impl MsrReader for FakeMsr {
    fn rdmsr(&self, reg: u32) -> u64 {
        self.reads.set(self.reads.get() + 1);
        self.values.get(&reg).copied().unwrap_or(0)
    }
}

// ============================================================================
// PCI CONFIG SPACE (DEV)
// ============================================================================

/// Northbridge function 3 with DEV behind the OP/DATA pair
pub(crate) struct FakeDevPci {
    pub cap_hdr: u32,
    op: Cell<u32>,
    pub regs: std::cell::RefCell<BTreeMap<u32, u32>>,
    /// Reads of DEV_CR that still report INV_CACHE before hardware clears it
    pub inv_cache_busy_reads: Cell<u32>,
    /// Never clear INV_CACHE
    pub inv_cache_stuck: Cell<bool>,
}

impl FakeDevPci {
    pub fn new(domains: u8, maps: u8) -> Self {
        let pci = Self {
            cap_hdr: 0x0001_000f,
            op: Cell::new(0),
            regs: std::cell::RefCell::new(BTreeMap::new()),
            inv_cache_busy_reads: Cell::new(0),
            inv_cache_stuck: Cell::new(false),
        };
        let cap = ((maps as u32) << 16) | ((domains as u32) << 8);
        pci.regs.borrow_mut().insert(crate::dev::dev_reg::DEV_CAP << 8, cap);
        pci
    }

    pub fn reg(&self, func: u32, index: u32) -> u32 {
        self.regs.borrow().get(&((func << 8) | index)).copied().unwrap_or(0)
    }
}

impl PciConfig for FakeDevPci {
    fn read_config32(&self, bus: u8, device: u8, function: u8, offset: u8) -> u32 {
        assert_eq!((bus, device, function), (dev_pci::BUS, dev_pci::DEVICE, dev_pci::FUNCTION));
        match offset {
            dev_pci::HDR => self.cap_hdr,
            dev_pci::OP => self.op.get(),
            dev_pci::DATA => {
                let op = self.op.get();
                let mut val = self.regs.borrow().get(&op).copied().unwrap_or(0);
                if op == crate::dev::dev_reg::DEV_CR << 8 && val & crate::dev::dev_reg::DEV_CR_INV_CACHE != 0 {
                    let busy = self.inv_cache_busy_reads.get();
                    if busy == 0 && !self.inv_cache_stuck.get() {
                        val &= !crate::dev::dev_reg::DEV_CR_INV_CACHE;
                        self.regs.borrow_mut().insert(op, val);
                    } else if busy > 0 {
                        self.inv_cache_busy_reads.set(busy - 1);
                    }
                }
                val
            }
            _ => 0,
        }
    }

    fn write_config32(&self, bus: u8, device: u8, function: u8, offset: u8, val: u32) {
        assert_eq!((bus, device, function), (dev_pci::BUS, dev_pci::DEVICE, dev_pci::FUNCTION));
        match offset {
            dev_pci::OP => self.op.set(val),
            dev_pci::DATA => {
                self.regs.borrow_mut().insert(self.op.get(), val);
            }
            _ => {}
        }
    }
}

// ============================================================================
// SECURITY FILESYSTEM
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FsNode {
    Dir(&'static str),
    File(&'static str, &'static str, u16),
}

/// Records created and removed nodes
pub(crate) struct FakeSecurityFs {
    pub nodes: Vec<(u32, FsNode)>,
    pub removed: Vec<u32>,
    pub fail_file: bool,
    next: u32,
}

impl FakeSecurityFs {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            removed: Vec::new(),
            fail_file: false,
            next: 1,
        }
    }

    pub fn live(&self) -> usize {
        self.nodes.iter().filter(|(id, _)| !self.removed.contains(id)).count()
    }
}

impl SecurityFs for FakeSecurityFs {
    type Node = u32;

    fn create_dir(&mut self, name: &'static str) -> Option<u32> {
        let id = self.next;
        self.next += 1;
        self.nodes.push((id, FsNode::Dir(name)));
        Some(id)
    }

    fn create_file(&mut self, dir: &u32, name: &'static str, mode: u16) -> Option<u32> {
        if self.fail_file {
            return None;
        }
        let parent = self
            .nodes
            .iter()
            .find_map(|(id, n)| match n {
                FsNode::Dir(d) if id == dir => Some(*d),
                _ => None,
            })
            .expect("parent directory exists");
        let id = self.next;
        self.next += 1;
        self.nodes.push((id, FsNode::File(parent, name, mode)));
        Some(id)
    }

    fn remove(&mut self, node: u32) {
        self.removed.push(node);
    }
}
