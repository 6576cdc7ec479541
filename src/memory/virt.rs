// memory/virt.rs — Halcyon Virtual Memory Manager.
//
// Features
//  - 4-level paging (PML4/PDPT/PD/PT), 4 KiB and 2 MiB mappings
//  - software table walker over frames owned by the physical allocator,
//    so the same code runs hosted and bare-metal
//  - Map/Unmap single and range; Translate returns VOID on a miss
//  - fixed VOLATILE/ATLAS/AETHER/KERNEL partitioning; persistent and DSM
//    windows carry reservation entries with PRESENT clear, and faults in
//    those ranges route to the owning subsystem
//
// Safety posture: explicit errors; no silent upgrades of permissions.

use core::fmt;
use x86_64::structures::paging::page_table::PageTableEntry;
use x86_64::structures::paging::{PageTable, PageTableFlags as PtF};
use x86_64::PhysAddr;

use crate::memory::layout::{region_of, Region, HUGE_2M, PAGE_SIZE};
use crate::memory::phys::{Frame, PhysMemory};
use crate::void::{VoidLog, VoidReason, VOID_U64};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u64 {
        const PRESENT  = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER     = 1 << 2;
        const NOCACHE  = 1 << 3;
        const HUGE     = 1 << 4;
        const GLOBAL   = 1 << 5;
        const NX       = 1 << 6;
    }
}

impl MapFlags {
    /// Partition defaults: VOLATILE data pages, demand-faulting ATLAS and
    /// AETHER windows, kernel text at the top.
    pub fn region_defaults(region: Region) -> MapFlags {
        match region {
            Region::Volatile => MapFlags::PRESENT | MapFlags::WRITABLE,
            Region::Atlas | Region::Aether => MapFlags::WRITABLE,
            Region::Kernel => MapFlags::PRESENT | MapFlags::GLOBAL | MapFlags::NX,
            Region::Unmapped => MapFlags::empty(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmErr {
    NoMemory,
    Misaligned,
    Overlap,
    NotMapped,
    HugeConflict,
    BadRange,
}

impl fmt::Display for VmErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Where a page fault should be serviced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultRoute {
    Atlas,
    Aether,
    Invalid,
}

pub fn classify_fault(va: u64) -> FaultRoute {
    match region_of(va) {
        Region::Atlas => FaultRoute::Atlas,
        Region::Aether => FaultRoute::Aether,
        _ => FaultRoute::Invalid,
    }
}

// available-to-software bit marking a reservation (mapped, PRESENT clear)
const RESERVED_BIT: PtF = PtF::BIT_9;

fn to_ptf(f: MapFlags) -> PtF {
    let mut r = PtF::empty();
    if f.contains(MapFlags::PRESENT) {
        r |= PtF::PRESENT;
    } else {
        r |= RESERVED_BIT;
    }
    if f.contains(MapFlags::WRITABLE) {
        r |= PtF::WRITABLE;
    }
    if f.contains(MapFlags::USER) {
        r |= PtF::USER_ACCESSIBLE;
    }
    if f.contains(MapFlags::NOCACHE) {
        r |= PtF::NO_CACHE;
    }
    if f.contains(MapFlags::GLOBAL) {
        r |= PtF::GLOBAL;
    }
    if f.contains(MapFlags::NX) {
        r |= PtF::NO_EXECUTE;
    }
    r
}

fn from_ptf(p: PtF) -> MapFlags {
    let mut f = MapFlags::empty();
    if p.contains(PtF::PRESENT) {
        f |= MapFlags::PRESENT;
    }
    if p.contains(PtF::WRITABLE) {
        f |= MapFlags::WRITABLE;
    }
    if p.contains(PtF::USER_ACCESSIBLE) {
        f |= MapFlags::USER;
    }
    if p.contains(PtF::NO_CACHE) {
        f |= MapFlags::NOCACHE;
    }
    if p.contains(PtF::HUGE_PAGE) {
        f |= MapFlags::HUGE;
    }
    if p.contains(PtF::GLOBAL) {
        f |= MapFlags::GLOBAL;
    }
    if p.contains(PtF::NO_EXECUTE) {
        f |= MapFlags::NX;
    }
    f
}

#[inline]
fn l4_idx(va: u64) -> usize {
    ((va >> 39) & 0x1ff) as usize
}
#[inline]
fn l3_idx(va: u64) -> usize {
    ((va >> 30) & 0x1ff) as usize
}
#[inline]
fn l2_idx(va: u64) -> usize {
    ((va >> 21) & 0x1ff) as usize
}
#[inline]
fn l1_idx(va: u64) -> usize {
    ((va >> 12) & 0x1ff) as usize
}

#[inline]
fn is_aligned_4k(a: u64) -> bool {
    a & 0xfff == 0
}
#[inline]
fn is_aligned_2m(a: u64) -> bool {
    a & (HUGE_2M as u64 - 1) == 0
}

/// View a page-table frame through the direct map.
///
/// # Safety
/// The frame must hold a page table owned by this address space, and the
/// caller must hold the kernel lock so no aliasing access exists. The
/// unbounded lifetime lets the walker interleave with frame allocation.
unsafe fn table_at(phys: &PhysMemory, frame: Frame) -> Option<&'static mut PageTable> {
    let ptr = phys.frame_ptr(frame)?;
    Some(&mut *(ptr.as_ptr() as *mut PageTable))
}

/// One 4-level address space rooted in a frame owned by `PhysMemory`.
pub struct AddressSpace {
    root: Frame,
}

impl AddressSpace {
    pub fn new(phys: &mut PhysMemory, log: &VoidLog) -> Result<AddressSpace, VmErr> {
        let root = phys.alloc_page(log).ok_or(VmErr::NoMemory)?;
        phys.zero_frame(root);
        Ok(AddressSpace { root })
    }

    pub fn root_frame(&self) -> Frame {
        self.root
    }

    /// Descend one level, allocating the child table on demand.
    fn child_table(
        &self,
        phys: &mut PhysMemory,
        log: &VoidLog,
        parent: &mut PageTable,
        idx: usize,
        create: bool,
    ) -> Result<Option<&'static mut PageTable>, VmErr> {
        if parent[idx].is_unused() {
            if !create {
                return Ok(None);
            }
            let frame = phys.alloc_page(log).ok_or(VmErr::NoMemory)?;
            phys.zero_frame(frame);
            parent[idx].set_addr(
                PhysAddr::new(frame.0),
                PtF::PRESENT | PtF::WRITABLE | PtF::USER_ACCESSIBLE,
            );
        } else if parent[idx].flags().contains(PtF::HUGE_PAGE) {
            return Err(VmErr::HugeConflict);
        }
        let frame = Frame(parent[idx].addr().as_u64());
        // SAFETY: frame was installed by this walker and is covered by the map
        Ok(unsafe { table_at(phys, frame) })
    }

    /// Map one 4 KiB page (or one 2 MiB page with `MapFlags::HUGE`).
    pub fn map(
        &mut self,
        phys: &mut PhysMemory,
        log: &VoidLog,
        va: u64,
        pa: u64,
        flags: MapFlags,
    ) -> Result<(), VmErr> {
        if flags.contains(MapFlags::HUGE) {
            return self.map_huge(phys, log, va, pa, flags);
        }
        if !is_aligned_4k(va) || !is_aligned_4k(pa) {
            return Err(VmErr::Misaligned);
        }
        // SAFETY: root frame is owned by this space
        let root = unsafe { table_at(phys, self.root) }.ok_or(VmErr::BadRange)?;
        let l3 = self
            .child_table(phys, log, root, l4_idx(va), true)?
            .ok_or(VmErr::NoMemory)?;
        let l2 = self
            .child_table(phys, log, l3, l3_idx(va), true)?
            .ok_or(VmErr::NoMemory)?;
        let l1 = self
            .child_table(phys, log, l2, l2_idx(va), true)?
            .ok_or(VmErr::NoMemory)?;
        let entry = &mut l1[l1_idx(va)];
        if !entry.is_unused() {
            return Err(VmErr::Overlap);
        }
        entry.set_addr(PhysAddr::new(pa), to_ptf(flags));
        self.flush(va);
        Ok(())
    }

    fn map_huge(
        &mut self,
        phys: &mut PhysMemory,
        log: &VoidLog,
        va: u64,
        pa: u64,
        flags: MapFlags,
    ) -> Result<(), VmErr> {
        if !is_aligned_2m(va) || !is_aligned_2m(pa) {
            return Err(VmErr::Misaligned);
        }
        // SAFETY: root frame is owned by this space
        let root = unsafe { table_at(phys, self.root) }.ok_or(VmErr::BadRange)?;
        let l3 = self
            .child_table(phys, log, root, l4_idx(va), true)?
            .ok_or(VmErr::NoMemory)?;
        let l2 = self
            .child_table(phys, log, l3, l3_idx(va), true)?
            .ok_or(VmErr::NoMemory)?;
        let entry = &mut l2[l2_idx(va)];
        if !entry.is_unused() {
            return Err(VmErr::Overlap);
        }
        entry.set_addr(PhysAddr::new(pa), to_ptf(flags) | PtF::HUGE_PAGE);
        self.flush(va);
        Ok(())
    }

    /// Reserve a demand-fault window page: recorded in the tables with
    /// PRESENT clear so a touch routes to Atlas or Aether.
    pub fn reserve(
        &mut self,
        phys: &mut PhysMemory,
        log: &VoidLog,
        va: u64,
        flags: MapFlags,
    ) -> Result<(), VmErr> {
        self.map(phys, log, va, 0, flags - MapFlags::PRESENT)
    }

    /// Unmap a 4 KiB page (or a reservation), returning the physical
    /// address it held.
    pub fn unmap(&mut self, phys: &mut PhysMemory, va: u64) -> Result<u64, VmErr> {
        if !is_aligned_4k(va) {
            return Err(VmErr::Misaligned);
        }
        let entry = self.leaf_entry(phys, va).ok_or(VmErr::NotMapped)?;
        if entry.is_unused() {
            return Err(VmErr::NotMapped);
        }
        let pa = entry.addr().as_u64();
        entry.set_unused();
        self.flush(va);
        Ok(pa)
    }

    fn leaf_entry(&self, phys: &PhysMemory, va: u64) -> Option<&'static mut PageTableEntry> {
        // SAFETY: every frame in the chain was installed by this walker
        unsafe {
            let root = table_at(phys, self.root)?;
            let l4e = &root[l4_idx(va)];
            if l4e.is_unused() {
                return None;
            }
            let l3 = table_at(phys, Frame(l4e.addr().as_u64()))?;
            let l3e = &l3[l3_idx(va)];
            if l3e.is_unused() {
                return None;
            }
            let l2 = table_at(phys, Frame(l3e.addr().as_u64()))?;
            let l2e = &mut l2[l2_idx(va)];
            if l2e.is_unused() {
                return None;
            }
            if l2e.flags().contains(PtF::HUGE_PAGE) {
                return Some(l2e);
            }
            let l1 = table_at(phys, Frame(l2e.addr().as_u64()))?;
            Some(&mut l1[l1_idx(va)])
        }
    }

    /// Translate to a physical address; VOID on any miss or reservation.
    pub fn translate(&self, phys: &PhysMemory, log: &VoidLog, va: u64) -> u64 {
        match self.try_translate(phys, va) {
            Ok((pa, _flags)) => pa,
            Err(_) => {
                log.record(VoidReason::LookupMiss, "vmm.translate", [va, 0], "unmapped");
                VOID_U64
            }
        }
    }

    pub fn try_translate(&self, phys: &PhysMemory, va: u64) -> Result<(u64, MapFlags), VmErr> {
        let entry = self.leaf_entry(phys, va).ok_or(VmErr::NotMapped)?;
        let flags = entry.flags();
        if !flags.contains(PtF::PRESENT) {
            // reservation: owned by Atlas/Aether, not yet resident
            return Err(VmErr::NotMapped);
        }
        let (base, off) = if flags.contains(PtF::HUGE_PAGE) {
            (entry.addr().as_u64(), va & (HUGE_2M as u64 - 1))
        } else {
            (entry.addr().as_u64(), va & 0xfff)
        };
        Ok((base + off, from_ptf(flags)))
    }

    pub fn map_range(
        &mut self,
        phys: &mut PhysMemory,
        log: &VoidLog,
        va: u64,
        pa: u64,
        len: usize,
        flags: MapFlags,
    ) -> Result<(), VmErr> {
        if len == 0 {
            return Err(VmErr::BadRange);
        }
        let pages = (len + PAGE_SIZE - 1) / PAGE_SIZE;
        for p in 0..pages {
            self.map(
                phys,
                log,
                va + (p * PAGE_SIZE) as u64,
                pa + (p * PAGE_SIZE) as u64,
                flags,
            )?;
        }
        Ok(())
    }

    pub fn unmap_range(&mut self, phys: &mut PhysMemory, va: u64, len: usize) -> Result<(), VmErr> {
        if len == 0 {
            return Err(VmErr::BadRange);
        }
        let pages = (len + PAGE_SIZE - 1) / PAGE_SIZE;
        for p in 0..pages {
            self.unmap(phys, va + (p * PAGE_SIZE) as u64)?;
        }
        Ok(())
    }

    // single-CPU local shootdown; IPIs when SMP lands
    #[inline]
    fn flush(&self, _va: u64) {
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
    }
}
