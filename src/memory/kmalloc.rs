// memory/kmalloc.rs — slab caches and the large-page path.
//
// Two routes. Small (<= 2048 B): eight power-of-two size classes, each a
// set of single-page slabs with an intrusive free list threaded through
// the free objects; partial/full/empty lists per cache, LIFO object reuse.
// Large: whole pages with a magic header ahead of the returned region.
// Freeing consults the page-aligned header magic and routes accordingly;
// over-aligned allocations stash the original pointer one word before the
// returned address. No internal locking; the embedder's kernel lock
// serializes the whole memory core.

use core::ptr::{null_mut, NonNull};

use crate::memory::layout::{pages_for, PAGE_SIZE};
use crate::memory::phys::PhysMemory;
use crate::void::{VoidLog, VoidReason};

pub const SLAB_MAGIC: u32 = 0x4853_4C42; // "HSLB"
pub const LARGE_MAGIC: u32 = 0x484C_4747; // "HLGG"

pub const SIZE_CLASSES: [usize; 8] = [16, 32, 64, 128, 256, 512, 1024, 2048];
pub const NUM_CLASSES: usize = SIZE_CLASSES.len();

/// Largest size served by the slab route.
pub const SLAB_MAX: usize = 2048;

const FREE_NONE: u32 = u32::MAX;

#[repr(C)]
struct SlabHeader {
    magic: u32,
    class: u32,
    object_size: u32,
    object_count: u32,
    free_head: u32, // byte offset within the page, FREE_NONE when exhausted
    free_count: u32,
    next: *mut SlabHeader,
    prev: *mut SlabHeader,
}

const SLAB_HDR_SIZE: usize = core::mem::size_of::<SlabHeader>();

#[repr(C)]
struct LargeHeader {
    magic: u32,
    pages: u32,
    size: u64,
}

const LARGE_HDR_SIZE: usize = 16;

#[inline]
fn first_object_offset(object_size: usize) -> usize {
    // keeps every object naturally aligned to its class size
    (SLAB_HDR_SIZE + object_size - 1) & !(object_size - 1)
}

#[inline]
fn objects_per_slab(object_size: usize) -> usize {
    (PAGE_SIZE - first_object_offset(object_size)) / object_size
}

fn class_index(size: usize) -> Option<usize> {
    SIZE_CLASSES.iter().position(|&c| c >= size)
}

// ───────────────────────── intrusive slab lists ────────────────────────────────

unsafe fn list_push(head: &mut *mut SlabHeader, slab: *mut SlabHeader) {
    (*slab).prev = null_mut();
    (*slab).next = *head;
    if !(*head).is_null() {
        (**head).prev = slab;
    }
    *head = slab;
}

unsafe fn list_remove(head: &mut *mut SlabHeader, slab: *mut SlabHeader) {
    let prev = (*slab).prev;
    let next = (*slab).next;
    if prev.is_null() {
        *head = next;
    } else {
        (*prev).next = next;
    }
    if !next.is_null() {
        (*next).prev = prev;
    }
    (*slab).prev = null_mut();
    (*slab).next = null_mut();
}

// ───────────────────────────── cache & stats ───────────────────────────────────

struct SlabCache {
    object_size: usize,
    partial: *mut SlabHeader,
    full: *mut SlabHeader,
    empty: *mut SlabHeader,
}

impl SlabCache {
    const fn new(object_size: usize) -> SlabCache {
        SlabCache {
            object_size,
            partial: null_mut(),
            full: null_mut(),
            empty: null_mut(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HeapStats {
    pub slab_allocations: u64,
    pub slab_frees: u64,
    pub large_allocations: u64,
    pub large_frees: u64,
    pub slabs_created: u64,
    /// sum(free_count * object_size) over every slab of every cache
    pub bytes_available: usize,
}

pub struct KernelHeap {
    caches: [SlabCache; NUM_CLASSES],
    pub stats: HeapStats,
}

// Raw slab pointers are only touched under the kernel lock.
unsafe impl Send for KernelHeap {}

impl KernelHeap {
    pub const fn new() -> KernelHeap {
        KernelHeap {
            caches: [
                SlabCache::new(SIZE_CLASSES[0]),
                SlabCache::new(SIZE_CLASSES[1]),
                SlabCache::new(SIZE_CLASSES[2]),
                SlabCache::new(SIZE_CLASSES[3]),
                SlabCache::new(SIZE_CLASSES[4]),
                SlabCache::new(SIZE_CLASSES[5]),
                SlabCache::new(SIZE_CLASSES[6]),
                SlabCache::new(SIZE_CLASSES[7]),
            ],
            stats: HeapStats {
                slab_allocations: 0,
                slab_frees: 0,
                large_allocations: 0,
                large_frees: 0,
                slabs_created: 0,
                bytes_available: 0,
            },
        }
    }

    // ───────────────────────────── allocation ──────────────────────────────────

    pub fn kmalloc(
        &mut self,
        phys: &mut PhysMemory,
        log: &VoidLog,
        size: usize,
    ) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        if size <= SLAB_MAX {
            self.slab_alloc(phys, log, size)
        } else {
            self.large_alloc(phys, log, size)
        }
    }

    fn slab_alloc(
        &mut self,
        phys: &mut PhysMemory,
        log: &VoidLog,
        size: usize,
    ) -> Option<NonNull<u8>> {
        let class = class_index(size)?;
        let object_size = SIZE_CLASSES[class];

        let slab = unsafe {
            if !self.caches[class].partial.is_null() {
                self.caches[class].partial
            } else if !self.caches[class].empty.is_null() {
                let slab = self.caches[class].empty;
                list_remove(&mut self.caches[class].empty, slab);
                list_push(&mut self.caches[class].partial, slab);
                slab
            } else {
                self.grow(phys, log, class)?
            }
        };

        unsafe {
            let page = slab as *mut u8;
            let off = (*slab).free_head;
            debug_assert_ne!(off, FREE_NONE);
            let obj = page.add(off as usize);
            (*slab).free_head = (obj as *const u32).read_unaligned();
            (*slab).free_count -= 1;
            if (*slab).free_count == 0 {
                list_remove(&mut self.caches[class].partial, slab);
                list_push(&mut self.caches[class].full, slab);
            }
            self.stats.slab_allocations += 1;
            self.stats.bytes_available -= object_size;
            Some(NonNull::new_unchecked(obj))
        }
    }

    /// New single-page slab, chained free list, pushed onto `partial`.
    fn grow(
        &mut self,
        phys: &mut PhysMemory,
        log: &VoidLog,
        class: usize,
    ) -> Option<*mut SlabHeader> {
        let object_size = SIZE_CLASSES[class];
        let frame = phys.alloc_page(log)?;
        let page = phys.frame_ptr(frame)?.as_ptr();

        let first = first_object_offset(object_size);
        let count = objects_per_slab(object_size);
        unsafe {
            let hdr = page as *mut SlabHeader;
            hdr.write(SlabHeader {
                magic: SLAB_MAGIC,
                class: class as u32,
                object_size: object_size as u32,
                object_count: count as u32,
                free_head: first as u32,
                free_count: count as u32,
                next: null_mut(),
                prev: null_mut(),
            });
            for i in 0..count {
                let off = first + i * object_size;
                let link = if i + 1 < count {
                    (first + (i + 1) * object_size) as u32
                } else {
                    FREE_NONE
                };
                (page.add(off) as *mut u32).write_unaligned(link);
            }
            list_push(&mut self.caches[class].partial, hdr);
            self.stats.slabs_created += 1;
            self.stats.bytes_available += count * object_size;
            Some(hdr)
        }
    }

    fn large_alloc(
        &mut self,
        phys: &mut PhysMemory,
        log: &VoidLog,
        size: usize,
    ) -> Option<NonNull<u8>> {
        let pages = pages_for(size + LARGE_HDR_SIZE);
        let frame = phys.alloc_pages(pages, log)?;
        let base = phys.frame_ptr(frame)?.as_ptr();
        unsafe {
            (base as *mut LargeHeader).write(LargeHeader {
                magic: LARGE_MAGIC,
                pages: pages as u32,
                size: size as u64,
            });
            self.stats.large_allocations += 1;
            Some(NonNull::new_unchecked(base.add(LARGE_HDR_SIZE)))
        }
    }

    /// Over-aligned allocation for `align > 16`. The original pointer sits
    /// one word before the returned address.
    pub fn kaligned_alloc(
        &mut self,
        phys: &mut PhysMemory,
        log: &VoidLog,
        size: usize,
        align: usize,
    ) -> Option<NonNull<u8>> {
        if !align.is_power_of_two() {
            log.record(
                VoidReason::Malformed,
                "kmalloc.aligned",
                [size as u64, align as u64],
                "align not a power of two",
            );
            return None;
        }
        if align <= 16 {
            return self.kmalloc(phys, log, size);
        }
        let raw = self.kmalloc(phys, log, size + align + 8)?;
        let raw_addr = raw.as_ptr() as usize;
        let aligned = (raw_addr + 8 + align - 1) & !(align - 1);
        unsafe {
            ((aligned - 8) as *mut u64).write_unaligned(raw_addr as u64);
            Some(NonNull::new_unchecked(aligned as *mut u8))
        }
    }

    // ─────────────────────────────── freeing ───────────────────────────────────

    pub fn kfree(&mut self, phys: &mut PhysMemory, log: &VoidLog, ptr: NonNull<u8>) {
        self.free_inner(phys, log, ptr, true);
    }

    fn free_inner(
        &mut self,
        phys: &mut PhysMemory,
        log: &VoidLog,
        ptr: NonNull<u8>,
        allow_redirect: bool,
    ) {
        let addr = ptr.as_ptr() as usize;
        let page = addr & !(PAGE_SIZE - 1);
        let magic = unsafe { (page as *const u32).read() };

        if magic == SLAB_MAGIC {
            let slab = page as *mut SlabHeader;
            let off = addr - page;
            if self.object_boundary(slab, off) {
                self.slab_free(slab, off as u32);
                return;
            }
        } else if magic == LARGE_MAGIC {
            if addr == page + LARGE_HDR_SIZE {
                self.large_free(phys, log, page);
                return;
            }
        }

        // over-aligned allocations point back at their origin; the word
        // sits just below the returned address, possibly in the previous
        // page of the same block
        if allow_redirect {
            let original = unsafe { ((addr - 8) as *const u64).read_unaligned() };
            if let Some(orig) = NonNull::new(original as *mut u8) {
                self.free_inner(phys, log, orig, false);
                return;
            }
        }
        log.record(
            VoidReason::Malformed,
            "kmalloc.free",
            [addr as u64, magic as u64],
            "pointer matches no allocation",
        );
    }

    fn object_boundary(&self, slab: *const SlabHeader, off: usize) -> bool {
        unsafe {
            let object_size = (*slab).object_size as usize;
            let first = first_object_offset(object_size);
            if off < first || (off - first) % object_size != 0 {
                return false;
            }
            ((off - first) / object_size) < (*slab).object_count as usize
        }
    }

    fn slab_free(&mut self, slab: *mut SlabHeader, off: u32) {
        unsafe {
            let class = (*slab).class as usize;
            let object_size = (*slab).object_size as usize;
            let page = slab as *mut u8;
            let was_full = (*slab).free_count == 0;

            // LIFO push so the next allocation of this class returns it
            (page.add(off as usize) as *mut u32).write_unaligned((*slab).free_head);
            (*slab).free_head = off;
            (*slab).free_count += 1;
            self.stats.slab_frees += 1;
            self.stats.bytes_available += object_size;

            let now_empty = (*slab).free_count == (*slab).object_count;
            if was_full {
                list_remove(&mut self.caches[class].full, slab);
                if now_empty {
                    list_push(&mut self.caches[class].empty, slab);
                } else {
                    list_push(&mut self.caches[class].partial, slab);
                }
            } else if now_empty {
                list_remove(&mut self.caches[class].partial, slab);
                list_push(&mut self.caches[class].empty, slab);
            }
        }
    }

    fn large_free(&mut self, phys: &mut PhysMemory, log: &VoidLog, page: usize) {
        unsafe {
            let hdr = page as *mut LargeHeader;
            let pages = (*hdr).pages as usize;
            (*hdr).magic = 0;
            if let Some(ptr) = NonNull::new(page as *mut u8) {
                if let Some(frame) = phys.frame_of_ptr(ptr) {
                    phys.free_pages(frame, pages, log);
                }
            }
            self.stats.large_frees += 1;
        }
    }

    // ──────────────────────────── sizing & realloc ─────────────────────────────

    /// Bytes usable behind a pointer returned by this heap.
    pub fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        let addr = ptr.as_ptr() as usize;
        let page = addr & !(PAGE_SIZE - 1);
        let magic = unsafe { (page as *const u32).read() };
        if magic == SLAB_MAGIC {
            let slab = page as *const SlabHeader;
            let off = addr - page;
            if self.object_boundary(slab, off) {
                return unsafe { (*slab).object_size as usize };
            }
        } else if magic == LARGE_MAGIC && addr == page + LARGE_HDR_SIZE {
            unsafe {
                let hdr = page as *const LargeHeader;
                return (*hdr).pages as usize * PAGE_SIZE - LARGE_HDR_SIZE;
            }
        }
        {
            let original = unsafe { ((addr - 8) as *const u64).read_unaligned() };
            if original != 0 {
                let origin_page = original as usize & !(PAGE_SIZE - 1);
                let origin_magic = unsafe { (origin_page as *const u32).read() };
                if origin_magic == SLAB_MAGIC || origin_magic == LARGE_MAGIC {
                    if let Some(orig) = NonNull::new(original as *mut u8) {
                        let total = self.usable_size(orig);
                        let skew = addr - original as usize;
                        return total.saturating_sub(skew);
                    }
                }
            }
        }
        0
    }

    /// Grow-and-copy when the request exceeds the current usable size,
    /// otherwise the same pointer.
    pub fn krealloc(
        &mut self,
        phys: &mut PhysMemory,
        log: &VoidLog,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        let Some(old) = ptr else {
            return self.kmalloc(phys, log, new_size);
        };
        if new_size == 0 {
            self.kfree(phys, log, old);
            return None;
        }
        let usable = self.usable_size(old);
        if new_size <= usable {
            return Some(old);
        }
        let fresh = self.kmalloc(phys, log, new_size)?;
        unsafe {
            core::ptr::copy_nonoverlapping(old.as_ptr(), fresh.as_ptr(), usable);
        }
        self.kfree(phys, log, old);
        Some(fresh)
    }

    // ───────────────────────────── introspection ───────────────────────────────

    /// Walk every slab list and check the structural invariants. Returns
    /// false (and records) on the first violation.
    pub fn check_invariants(&self, log: &VoidLog) -> bool {
        let mut available = 0usize;
        for cache in &self.caches {
            unsafe {
                let mut s = cache.partial;
                while !s.is_null() {
                    let fc = (*s).free_count;
                    if fc == 0 || fc >= (*s).object_count || (*s).magic != SLAB_MAGIC {
                        log.record(
                            VoidReason::StateViolation,
                            "kmalloc.check",
                            [s as u64, fc as u64],
                            "partial slab out of bounds",
                        );
                        return false;
                    }
                    available += fc as usize * (*s).object_size as usize;
                    s = (*s).next;
                }
                let mut s = cache.full;
                while !s.is_null() {
                    if (*s).free_count != 0 || (*s).magic != SLAB_MAGIC {
                        log.record(
                            VoidReason::StateViolation,
                            "kmalloc.check",
                            [s as u64, (*s).free_count as u64],
                            "full slab has free objects",
                        );
                        return false;
                    }
                    s = (*s).next;
                }
                let mut s = cache.empty;
                while !s.is_null() {
                    if (*s).free_count != (*s).object_count || (*s).magic != SLAB_MAGIC {
                        log.record(
                            VoidReason::StateViolation,
                            "kmalloc.check",
                            [s as u64, (*s).free_count as u64],
                            "empty slab has live objects",
                        );
                        return false;
                    }
                    available += (*s).free_count as usize * (*s).object_size as usize;
                    s = (*s).next;
                }
            }
        }
        if available != self.stats.bytes_available {
            log.record(
                VoidReason::StateViolation,
                "kmalloc.check",
                [available as u64, self.stats.bytes_available as u64],
                "available statistic drifted",
            );
            return false;
        }
        true
    }
}

impl Default for KernelHeap {
    fn default() -> Self {
        KernelHeap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::phys::testutil::TestRam;
    use crate::void::VoidLog;

    fn setup(pages: usize) -> (TestRam, KernelHeap, VoidLog) {
        let ram = TestRam::new(pages);
        (ram, KernelHeap::new(), VoidLog::new())
    }

    #[test]
    fn slab_roundtrip_is_lifo() {
        let (ram, mut heap, log) = setup(32);
        let mut phys = ram.phys();

        let p = heap.kmalloc(&mut phys, &log, 48).expect("alloc");
        assert_eq!(heap.usable_size(p), 64);
        heap.kfree(&mut phys, &log, p);
        let q = heap.kmalloc(&mut phys, &log, 48).expect("alloc");
        assert_eq!(p, q);
        assert_eq!(heap.stats.slab_allocations, 2);
        assert_eq!(heap.stats.slab_frees, 1);
        assert!(heap.check_invariants(&log));
    }

    #[test]
    fn class_selection_and_page_headers() {
        let (ram, mut heap, log) = setup(32);
        let mut phys = ram.phys();

        for (size, class) in [(1, 16), (16, 16), (17, 32), (100, 128), (2048, 2048)] {
            let p = heap.kmalloc(&mut phys, &log, size).expect("alloc");
            assert_eq!(heap.usable_size(p), class, "size {}", size);
            let page = (p.as_ptr() as usize) & !(PAGE_SIZE - 1);
            assert_eq!(unsafe { (page as *const u32).read() }, SLAB_MAGIC);
        }
        assert!(heap.check_invariants(&log));
    }

    #[test]
    fn slab_fills_move_to_full_list() {
        let (ram, mut heap, log) = setup(64);
        let mut phys = ram.phys();

        // 2048-byte class holds one object per slab
        let a = heap.kmalloc(&mut phys, &log, 2048).expect("alloc");
        let b = heap.kmalloc(&mut phys, &log, 2048).expect("alloc");
        assert_ne!(a, b);
        assert!(heap.check_invariants(&log));
        heap.kfree(&mut phys, &log, a);
        heap.kfree(&mut phys, &log, b);
        assert!(heap.check_invariants(&log));
        assert_eq!(heap.stats.slabs_created, 2);
    }

    #[test]
    fn large_allocations_have_magic_headers() {
        let (ram, mut heap, log) = setup(64);
        let mut phys = ram.phys();

        let p = heap.kmalloc(&mut phys, &log, 3 * PAGE_SIZE).expect("alloc");
        let page = (p.as_ptr() as usize) & !(PAGE_SIZE - 1);
        assert_eq!(unsafe { (page as *const u32).read() }, LARGE_MAGIC);
        assert_eq!(heap.usable_size(p), 4 * PAGE_SIZE - 16);

        let frames_before = phys.free_frames();
        heap.kfree(&mut phys, &log, p);
        assert_eq!(phys.free_frames(), frames_before + 4);
        assert_eq!(heap.stats.large_allocations, 1);
        assert_eq!(heap.stats.large_frees, 1);
    }

    #[test]
    fn realloc_grows_and_keeps_bytes() {
        let (ram, mut heap, log) = setup(64);
        let mut phys = ram.phys();

        let p = heap.kmalloc(&mut phys, &log, 32).expect("alloc");
        unsafe { core::ptr::write_bytes(p.as_ptr(), 0x5A, 32) };
        // within the class: same pointer
        let same = heap
            .krealloc(&mut phys, &log, Some(p), 30)
            .expect("realloc");
        assert_eq!(same, p);
        // beyond the class: moved, contents preserved
        let grown = heap
            .krealloc(&mut phys, &log, Some(p), 200)
            .expect("realloc");
        assert_ne!(grown, p);
        let bytes = unsafe { core::slice::from_raw_parts(grown.as_ptr(), 32) };
        assert!(bytes.iter().all(|&b| b == 0x5A));
        assert!(heap.check_invariants(&log));
    }

    #[test]
    fn aligned_alloc_roundtrip() {
        let (ram, mut heap, log) = setup(64);
        let mut phys = ram.phys();

        let p = heap
            .kaligned_alloc(&mut phys, &log, 100, 256)
            .expect("alloc");
        assert_eq!(p.as_ptr() as usize % 256, 0);
        assert!(heap.usable_size(p) >= 100);
        heap.kfree(&mut phys, &log, p);
        assert!(heap.check_invariants(&log));

        // huge alignment routes through the large path transparently
        let frames_before = phys.free_frames();
        let q = heap
            .kaligned_alloc(&mut phys, &log, 8192, 4096)
            .expect("alloc");
        assert_eq!(q.as_ptr() as usize % 4096, 0);
        heap.kfree(&mut phys, &log, q);
        assert_eq!(phys.free_frames(), frames_before);
        assert!(heap.check_invariants(&log));
    }

    #[test]
    fn bogus_free_is_recorded_not_fatal() {
        let (ram, mut heap, log) = setup(32);
        let mut phys = ram.phys();

        let p = heap.kmalloc(&mut phys, &log, 64).expect("alloc");
        // interior pointer with a zero redirect word
        unsafe {
            let interior = NonNull::new_unchecked(p.as_ptr().add(16));
            core::ptr::write_bytes(p.as_ptr(), 0, 64);
            heap.kfree(&mut phys, &log, interior);
        }
        assert!(log.has_reason(VoidReason::Malformed));
        assert!(heap.check_invariants(&log));
    }

    #[test]
    fn zero_size_returns_none() {
        let (ram, mut heap, log) = setup(8);
        let mut phys = ram.phys();
        assert!(heap.kmalloc(&mut phys, &log, 0).is_none());
    }
}
