// boot.rs — bootloader handoff contract.
//
// The loader hands the kernel one record: framebuffer geometry, the
// physical memory map, kernel load addresses, the primordial arena size
// and an optional ACPI RSDP pointer. The magic and version are fixed;
// a record failing `valid()` never reaches memory bring-up.

use crate::void::{is_void_u64, VOID_U64};

pub const BOOT_MAGIC: u64 = u64::from_le_bytes(*b"HALCBOOT");
pub const BOOT_VERSION: u32 = 1;
pub const MAX_MEMORY_RANGES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MemoryKind {
    Usable = 1,
    Reserved = 2,
    AcpiReclaimable = 3,
    Mmio = 4,
    KernelImage = 5,
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct MemoryRange {
    pub phys: u64,
    pub length: u64,
    pub kind: MemoryKind,
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Framebuffer {
    pub base: u64,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub bpp: u32,
}

#[repr(C)]
pub struct BootInfo {
    pub magic: u64,
    pub version: u32,
    pub range_count: u32,
    pub framebuffer: Framebuffer,
    pub ranges: [MemoryRange; MAX_MEMORY_RANGES],
    pub kernel_phys_base: u64,
    pub kernel_virt_base: u64,
    pub stack_size: u64,
    pub primordial_arena_size: u64,
    /// ACPI RSDP physical address; VOID when the loader found none.
    pub rsdp: u64,
}

impl BootInfo {
    pub fn valid(&self) -> bool {
        self.magic == BOOT_MAGIC
            && self.version == BOOT_VERSION
            && self.range_count as usize <= MAX_MEMORY_RANGES
    }

    pub fn ranges(&self) -> &[MemoryRange] {
        &self.ranges[..self.range_count as usize]
    }

    /// Largest usable window; memory bring-up starts here.
    pub fn largest_usable(&self) -> Option<MemoryRange> {
        self.ranges()
            .iter()
            .filter(|r| r.kind == MemoryKind::Usable)
            .max_by_key(|r| r.length)
            .copied()
    }

    pub fn has_rsdp(&self) -> bool {
        self.rsdp != 0 && !is_void_u64(self.rsdp)
    }
}

impl Default for BootInfo {
    fn default() -> Self {
        BootInfo {
            magic: BOOT_MAGIC,
            version: BOOT_VERSION,
            range_count: 0,
            framebuffer: Framebuffer {
                base: 0,
                width: 0,
                height: 0,
                stride: 0,
                bpp: 0,
            },
            ranges: [MemoryRange {
                phys: 0,
                length: 0,
                kind: MemoryKind::Reserved,
            }; MAX_MEMORY_RANGES],
            kernel_phys_base: 0,
            kernel_virt_base: crate::memory::layout::KERNEL_BASE,
            stack_size: 64 * 1024,
            primordial_arena_size: 4 * 1024 * 1024,
            rsdp: VOID_U64,
        }
    }
}
