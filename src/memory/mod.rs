//! Halcyon Memory Core
//!
//! Physical frames, the 4-level address space, bump arenas and the slab
//! heap, gathered behind one handle. v1 concurrency: the embedder wraps
//! `MemoryCore` in the single kernel lock; nothing in here locks again.

pub mod arena;
pub mod kmalloc;
pub mod layout;
pub mod phys;
pub mod virt;

use core::ptr::NonNull;

use crate::void::VoidLog;
use arena::{Arena, ArenaFlags};
use kmalloc::KernelHeap;
use layout::{pages_for, PAGE_SIZE};
use phys::{Frame, PhysMemory};
use virt::{AddressSpace, VmErr};

pub struct MemoryCore {
    pub phys: PhysMemory,
    pub space: AddressSpace,
    pub heap: KernelHeap,
}

impl MemoryCore {
    /// Bring up the memory core over one usable RAM window.
    ///
    /// # Safety
    /// `direct_map` must cover `len` bytes backing the physical window at
    /// `window_base` for the lifetime of the core.
    pub unsafe fn new(
        direct_map: NonNull<u8>,
        window_base: u64,
        len: usize,
        log: &VoidLog,
    ) -> Result<MemoryCore, VmErr> {
        let mut phys = PhysMemory::new(direct_map, window_base, len);
        let space = AddressSpace::new(&mut phys, log)?;
        log::info!(
            "memory: {} frames online, root table at {:#x}",
            phys.free_frames(),
            space.root_frame().0
        );
        Ok(MemoryCore {
            phys,
            space,
            heap: KernelHeap::new(),
        })
    }

    pub fn kmalloc(&mut self, log: &VoidLog, size: usize) -> Option<NonNull<u8>> {
        self.heap.kmalloc(&mut self.phys, log, size)
    }

    pub fn kfree(&mut self, log: &VoidLog, ptr: NonNull<u8>) {
        self.heap.kfree(&mut self.phys, log, ptr)
    }

    pub fn krealloc(
        &mut self,
        log: &VoidLog,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        self.heap.krealloc(&mut self.phys, log, ptr, new_size)
    }

    pub fn kaligned_alloc(
        &mut self,
        log: &VoidLog,
        size: usize,
        align: usize,
    ) -> Option<NonNull<u8>> {
        self.heap.kaligned_alloc(&mut self.phys, log, size, align)
    }

    /// Carve a bump arena out of physically contiguous pages.
    pub fn arena_create(
        &mut self,
        log: &VoidLog,
        bytes: usize,
        flags: ArenaFlags,
    ) -> Option<Arena> {
        let pages = pages_for(bytes.max(1));
        let frame = self.phys.alloc_pages(pages, log)?;
        let base = self.phys.frame_ptr(frame)?;
        // SAFETY: the run is freshly allocated and exclusively ours
        Some(unsafe { Arena::from_raw(base, pages * PAGE_SIZE, flags) })
    }

    /// Return an arena's pages. The caller guarantees no outstanding
    /// references; arena-bound capabilities die with the generation.
    pub fn arena_destroy(&mut self, log: &VoidLog, arena: Arena) -> bool {
        let pages = pages_for(arena.capacity());
        match self.phys.frame_of_ptr(arena.base()) {
            Some(frame) => self.phys.free_pages(frame, pages, log),
            None => false,
        }
    }

    pub fn frame_of_ptr(&self, ptr: NonNull<u8>) -> Option<Frame> {
        self.phys.frame_of_ptr(ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::phys::testutil::TestRam;

    #[test]
    fn core_bringup_and_arena_lifecycle() {
        let ram = TestRam::new(64);
        let log = VoidLog::new();
        let mut mem = ram.core(&log);

        let mut arena = mem
            .arena_create(&log, 3 * PAGE_SIZE, ArenaFlags::ZERO_ON_ALLOC)
            .expect("arena");
        assert_eq!(arena.capacity(), 3 * PAGE_SIZE);
        let p = arena.alloc(128, 0).expect("alloc");
        assert!(arena.contains(p));

        let free_before = mem.phys.free_frames();
        assert!(mem.arena_destroy(&log, arena));
        assert_eq!(mem.phys.free_frames(), free_before + 3);
    }

    #[test]
    fn heap_delegation_shares_the_window() {
        let ram = TestRam::new(64);
        let log = VoidLog::new();
        let mut mem = ram.core(&log);

        let p = mem.kmalloc(&log, 48).expect("alloc");
        assert_eq!(mem.heap.usable_size(p), 64);
        mem.kfree(&log, p);
        assert!(mem.heap.check_invariants(&log));
    }
}
