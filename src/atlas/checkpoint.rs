// atlas/checkpoint.rs — semantic checkpoints.
//
// A checkpoint is a typed validation record over Atlas-resident objects:
// each entry pins an offset, a registered type and a CRC of the bytes at
// creation. Validation runs the type's declared invariants and flags
// entries INVALID (an invariant failed) or MODIFIED (CRC drift).
// Recovery applies the canonical fix per invariant kind and re-validates.
// Validation failures surface in the report; they never abort the
// checkpoint.

use arrayvec::ArrayVec;

use super::Atlas;
use crate::core_handle::Core;
use crate::void::{is_void_u64, Vbit, VoidReason};

pub const MAX_TYPES: usize = 32;
pub const MAX_INVARIANTS: usize = 8;
pub const TYPE_NAME_LEN: usize = 32;
/// Bound on linked-list walks during cycle checks.
const CHAIN_WALK_LIMIT: usize = 4096;

pub type TypeId = u32;

/// Declarative property of a checkpointed object. Field offsets are
/// relative to the instance; pointers are stored as Atlas offsets.
#[derive(Clone, Copy)]
pub enum Invariant {
    NonNullPointer {
        field_offset: u32,
    },
    NullablePointer {
        field_offset: u32,
    },
    /// Linked list through a next-offset field must be acyclic.
    NoCycle {
        next_offset: u32,
    },
    ArrayBounds {
        ptr_offset: u32,
        count_offset: u32,
        elem_size: u32,
        /// Zero means unspecified.
        max_count: u64,
    },
    Refcount {
        field_offset: u32,
        width: u8,
        min: u64,
        live_only: bool,
    },
    Range {
        field_offset: u32,
        width: u8,
        min: i64,
        max: i64,
    },
    Custom {
        validate: fn(&[u8]) -> bool,
        recover: Option<fn(&mut [u8]) -> bool>,
    },
}

pub struct TypeDescriptor {
    pub name: ArrayVec<u8, TYPE_NAME_LEN>,
    pub instance_size: u32,
    pub invariants: ArrayVec<Invariant, MAX_INVARIANTS>,
}

impl TypeDescriptor {
    pub fn name_str(&self) -> &str {
        core::str::from_utf8(&self.name).unwrap_or("?")
    }
}

/// Process-wide registry of checkpointable types (held by `Core`).
pub struct TypeRegistry {
    types: ArrayVec<TypeDescriptor, MAX_TYPES>,
}

impl TypeRegistry {
    pub fn new() -> TypeRegistry {
        TypeRegistry {
            types: ArrayVec::new(),
        }
    }

    /// Duplicate names and a full registry yield VOID (None).
    pub fn register(&mut self, name: &str, instance_size: u32) -> Option<TypeId> {
        if name.is_empty() || name.len() > TYPE_NAME_LEN {
            return None;
        }
        if self.types.iter().any(|t| t.name_str() == name) {
            return None;
        }
        if self.types.is_full() {
            return None;
        }
        let mut stored = ArrayVec::new();
        let _ = stored.try_extend_from_slice(name.as_bytes());
        self.types.push(TypeDescriptor {
            name: stored,
            instance_size,
            invariants: ArrayVec::new(),
        });
        Some(self.types.len() as TypeId - 1)
    }

    pub fn add_invariant(&mut self, type_id: TypeId, invariant: Invariant) -> bool {
        match self.types.get_mut(type_id as usize) {
            Some(t) => t.invariants.try_push(invariant).is_ok(),
            None => false,
        }
    }

    pub fn get(&self, type_id: TypeId) -> Option<&TypeDescriptor> {
        self.types.get(type_id as usize)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        TypeRegistry::new()
    }
}

// ─────────────────────────── on-region layout ─────────────────────────────────

#[repr(C)]
struct CheckpointBlob {
    magic: u32,
    _pad: u32,
    id: u64,
    max_entries: u32,
    entry_count: u32,
    name: [u8; TYPE_NAME_LEN],
}

const BLOB_SIZE: u64 = core::mem::size_of::<CheckpointBlob>() as u64;

pub const ENTRY_INVALID: u32 = 1 << 0;
pub const ENTRY_MODIFIED: u32 = 1 << 1;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct CheckpointEntry {
    pub offset: u64,
    pub type_id: u32,
    pub size: u32,
    pub crc: u32,
    pub flags: u32,
    pub last_result: u32,
    _pad: u32,
}

const ENTRY_SIZE: u64 = core::mem::size_of::<CheckpointEntry>() as u64;

/// Rust-side handle to a checkpoint blob inside the region.
#[derive(Debug, Clone, Copy)]
pub struct CheckpointHandle {
    pub id: u64,
    pub offset: u64,
    pub max_entries: u32,
}

pub type CkptId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum InvariantVerdict {
    Ok = 0,
    NullPointer = 1,
    BadPointer = 2,
    CycleDetected = 3,
    BoundsExceeded = 4,
    RefcountLow = 5,
    OutOfRange = 6,
    CustomFailed = 7,
}

#[derive(Default)]
pub struct ValidationReport {
    pub checked: u32,
    pub violations: u32,
    pub modified: u32,
    pub recovered: u32,
    pub failures: ArrayVec<(u32, InvariantVerdict), 64>,
}

impl ValidationReport {
    pub fn clean(&self) -> bool {
        self.violations == 0
    }
}

impl Atlas {
    /// Allocate a checkpoint and its entry table inside the region.
    pub fn checkpoint_create(
        &mut self,
        core: &Core,
        name: &str,
        max_entries: u32,
    ) -> Option<CkptId> {
        if self.checkpoints.is_full() {
            core.void.record(
                VoidReason::PoolExhausted,
                "atlas.checkpoint_create",
                [self.checkpoints.len() as u64, 0],
                "checkpoint pool full",
            );
            return None;
        }
        let blob_bytes = BLOB_SIZE + max_entries as u64 * ENTRY_SIZE;
        let offset = self.alloc(blob_bytes, &core.void);
        if is_void_u64(offset) {
            return None;
        }
        let id = core.next_checkpoint_id();
        let mut name_buf = [0u8; TYPE_NAME_LEN];
        let take = name.len().min(TYPE_NAME_LEN);
        name_buf[..take].copy_from_slice(&name.as_bytes()[..take]);
        {
            let blob = self.blob_mut(offset)?;
            blob.magic = super::CHECKPOINT_MAGIC;
            blob._pad = 0;
            blob.id = id;
            blob.max_entries = max_entries;
            blob.entry_count = 0;
            blob.name = name_buf;
        }
        let handle = CheckpointHandle {
            id,
            offset,
            max_entries,
        };
        self.checkpoints.push(handle);
        Some(self.checkpoints.len() - 1)
    }

    fn blob_mut(&mut self, offset: u64) -> Option<&mut CheckpointBlob> {
        self.bytes_mut(offset, BLOB_SIZE as usize)?;
        // SAFETY: containment checked; blob offsets are 8-aligned by alloc
        Some(unsafe { &mut *(self.offset_to_ptr(offset)?.as_ptr() as *mut CheckpointBlob) })
    }

    fn blob(&self, offset: u64) -> Option<&CheckpointBlob> {
        self.bytes(offset, BLOB_SIZE as usize)?;
        // SAFETY: as blob_mut()
        Some(unsafe { &*(self.offset_to_ptr(offset)?.as_ptr() as *const CheckpointBlob) })
    }

    fn entry_offset(&self, cp: CkptId, index: u32) -> Option<u64> {
        let handle = self.checkpoints.get(cp)?;
        if index >= handle.max_entries {
            return None;
        }
        Some(handle.offset + BLOB_SIZE + index as u64 * ENTRY_SIZE)
    }

    pub fn checkpoint_entry(&self, cp: CkptId, index: u32) -> Option<CheckpointEntry> {
        let off = self.entry_offset(cp, index)?;
        self.bytes(off, ENTRY_SIZE as usize)?;
        // SAFETY: containment checked, 8-aligned layout
        Some(unsafe { *(self.offset_to_ptr(off)?.as_ptr() as *const CheckpointEntry) })
    }

    fn write_entry(&mut self, cp: CkptId, index: u32, entry: CheckpointEntry) -> bool {
        let Some(off) = self.entry_offset(cp, index) else {
            return false;
        };
        if self.bytes_mut(off, ENTRY_SIZE as usize).is_none() {
            return false;
        }
        let Some(ptr) = self.offset_to_ptr(off) else {
            return false;
        };
        // SAFETY: containment checked, 8-aligned layout
        unsafe { *(ptr.as_ptr() as *mut CheckpointEntry) = entry };
        true
    }

    pub fn checkpoint_entry_count(&self, cp: CkptId) -> u32 {
        self.checkpoints
            .get(cp)
            .and_then(|h| self.blob(h.offset))
            .map(|b| b.entry_count)
            .unwrap_or(0)
    }

    /// Record an object: offset, type, size and the CRC of its current
    /// bytes.
    pub fn checkpoint_add_entry(
        &mut self,
        core: &Core,
        cp: CkptId,
        target: u64,
        type_id: TypeId,
        size: u32,
    ) -> Vbit {
        let Some(handle) = self.checkpoints.get(cp).copied() else {
            return Vbit::Void;
        };
        if !self.contains(target, size as u64) {
            core.void.record(
                VoidReason::OutOfRange,
                "atlas.checkpoint_add_entry",
                [target, size as u64],
                "entry outside region",
            );
            return Vbit::Void;
        }
        let count = self.checkpoint_entry_count(cp);
        if count >= handle.max_entries {
            core.void.record(
                VoidReason::PoolExhausted,
                "atlas.checkpoint_add_entry",
                [cp as u64, handle.max_entries as u64],
                "entry table full",
            );
            return Vbit::Void;
        }
        let crc = self.crc_of(target, size);
        let entry = CheckpointEntry {
            offset: target,
            type_id,
            size,
            crc,
            flags: 0,
            last_result: InvariantVerdict::Ok as u32,
            _pad: 0,
        };
        if !self.write_entry(cp, count, entry) {
            return Vbit::Void;
        }
        if let Some(blob) = self.blob_mut(handle.offset) {
            blob.entry_count = count + 1;
        }
        Vbit::True
    }

    fn crc_of(&self, offset: u64, size: u32) -> u32 {
        match self.bytes(offset, size as usize) {
            Some(bytes) => {
                let mut hasher = crc32fast::Hasher::new();
                hasher.update(bytes);
                hasher.finalize()
            }
            None => 0,
        }
    }

    // ───────────────────────────── validation ──────────────────────────────────

    /// Check every entry against its type's invariants. Flags and
    /// last_result update in place; the report totals the damage.
    pub fn checkpoint_validate(
        &mut self,
        core: &Core,
        cp: CkptId,
        report: &mut ValidationReport,
    ) -> Vbit {
        let count = self.checkpoint_entry_count(cp);
        if self.checkpoints.get(cp).is_none() {
            return Vbit::Void;
        }
        let types = core.types.lock();
        for index in 0..count {
            let Some(mut entry) = self.checkpoint_entry(cp, index) else {
                continue;
            };
            report.checked += 1;
            let mut verdict = InvariantVerdict::Ok;
            if let Some(descriptor) = types.get(entry.type_id) {
                for invariant in descriptor.invariants.iter() {
                    let v = self.check_invariant(invariant, entry.offset, entry.size);
                    if v != InvariantVerdict::Ok {
                        if verdict == InvariantVerdict::Ok {
                            verdict = v;
                        }
                        let _ = report.failures.try_push((index, v));
                    }
                }
            }
            let crc_now = self.crc_of(entry.offset, entry.size);
            entry.flags = 0;
            if verdict != InvariantVerdict::Ok {
                entry.flags |= ENTRY_INVALID;
                report.violations += 1;
            }
            if crc_now != entry.crc {
                entry.flags |= ENTRY_MODIFIED;
                report.modified += 1;
            }
            entry.last_result = verdict as u32;
            self.write_entry(cp, index, entry);
        }
        Vbit::True
    }

    fn check_invariant(
        &self,
        invariant: &Invariant,
        base: u64,
        size: u32,
    ) -> InvariantVerdict {
        match *invariant {
            Invariant::NonNullPointer { field_offset } => {
                match self.field_u64(base, size, field_offset) {
                    Some(0) | None => InvariantVerdict::NullPointer,
                    Some(_) => InvariantVerdict::Ok,
                }
            }
            Invariant::NullablePointer { field_offset } => {
                match self.field_u64(base, size, field_offset) {
                    None => InvariantVerdict::BadPointer,
                    Some(0) => InvariantVerdict::Ok,
                    Some(v) if self.contains(v, 1) => InvariantVerdict::Ok,
                    Some(_) => InvariantVerdict::BadPointer,
                }
            }
            Invariant::NoCycle { next_offset } => {
                if self.chain_has_cycle(base, next_offset) {
                    InvariantVerdict::CycleDetected
                } else {
                    InvariantVerdict::Ok
                }
            }
            Invariant::ArrayBounds {
                ptr_offset,
                count_offset,
                elem_size,
                max_count,
            } => {
                let (Some(ptr), Some(count)) = (
                    self.field_u64(base, size, ptr_offset),
                    self.field_u64(base, size, count_offset),
                ) else {
                    return InvariantVerdict::BoundsExceeded;
                };
                if !self.contains(ptr, 1) {
                    return InvariantVerdict::BoundsExceeded;
                }
                if max_count != 0 && count > max_count {
                    return InvariantVerdict::BoundsExceeded;
                }
                let span = count.saturating_mul(elem_size as u64);
                if !self.contains(ptr, span) {
                    return InvariantVerdict::BoundsExceeded;
                }
                InvariantVerdict::Ok
            }
            Invariant::Refcount {
                field_offset,
                width,
                min,
                live_only,
            } => match self.field_uint(base, size, field_offset, width) {
                Some(0) if live_only => InvariantVerdict::Ok,
                Some(v) if v >= min => InvariantVerdict::Ok,
                _ => InvariantVerdict::RefcountLow,
            },
            Invariant::Range {
                field_offset,
                width,
                min,
                max,
            } => match self.field_uint(base, size, field_offset, width) {
                Some(v) if (v as i64) >= min && (v as i64) <= max => InvariantVerdict::Ok,
                _ => InvariantVerdict::OutOfRange,
            },
            Invariant::Custom { validate, .. } => {
                match self.bytes(base, size as usize) {
                    Some(bytes) if validate(bytes) => InvariantVerdict::Ok,
                    _ => InvariantVerdict::CustomFailed,
                }
            }
        }
    }

    fn field_u64(&self, base: u64, size: u32, field_offset: u32) -> Option<u64> {
        if field_offset + 8 > size {
            return None;
        }
        self.read_u64(base + field_offset as u64)
    }

    fn field_uint(&self, base: u64, size: u32, field_offset: u32, width: u8) -> Option<u64> {
        if field_offset as u64 + width as u64 > size as u64 {
            return None;
        }
        let bytes = self.bytes(base + field_offset as u64, width as usize)?;
        let mut value = 0u64;
        for (i, &b) in bytes.iter().enumerate() {
            value |= (b as u64) << (8 * i);
        }
        Some(value)
    }

    fn write_field_uint(&mut self, base: u64, field_offset: u32, width: u8, value: u64) -> bool {
        match self.bytes_mut(base + field_offset as u64, width as usize) {
            Some(bytes) => {
                for (i, b) in bytes.iter_mut().enumerate() {
                    *b = (value >> (8 * i)) as u8;
                }
                true
            }
            None => false,
        }
    }

    fn chain_next(&self, node: u64, next_offset: u32) -> Option<u64> {
        let next = self.read_u64(node.checked_add(next_offset as u64)?)?;
        if next == 0 || is_void_u64(next) || !self.contains(next, 8) {
            return None;
        }
        Some(next)
    }

    /// Floyd's tortoise and hare over the next-offset chain.
    fn chain_has_cycle(&self, head: u64, next_offset: u32) -> bool {
        let mut tortoise = head;
        let mut hare = head;
        for _ in 0..CHAIN_WALK_LIMIT {
            let Some(h1) = self.chain_next(hare, next_offset) else {
                return false;
            };
            let Some(h2) = self.chain_next(h1, next_offset) else {
                return false;
            };
            hare = h2;
            tortoise = match self.chain_next(tortoise, next_offset) {
                Some(t) => t,
                None => return false,
            };
            if tortoise == hare {
                return true;
            }
        }
        false
    }

    /// Break a detected cycle: locate the cycle start, walk to the node
    /// pointing back at it, null that link.
    fn break_cycle(&mut self, head: u64, next_offset: u32) -> bool {
        // find the meeting point again
        let mut tortoise = head;
        let mut hare = head;
        let mut met = None;
        for _ in 0..CHAIN_WALK_LIMIT {
            let Some(h1) = self.chain_next(hare, next_offset) else {
                return false;
            };
            let Some(h2) = self.chain_next(h1, next_offset) else {
                return false;
            };
            hare = h2;
            tortoise = match self.chain_next(tortoise, next_offset) {
                Some(t) => t,
                None => return false,
            };
            if tortoise == hare {
                met = Some(hare);
                break;
            }
        }
        let Some(meeting) = met else { return false };

        // cycle start: advance from head and meeting in lockstep
        let mut a = head;
        let mut b = meeting;
        while a != b {
            a = match self.chain_next(a, next_offset) {
                Some(n) => n,
                None => return false,
            };
            b = match self.chain_next(b, next_offset) {
                Some(n) => n,
                None => return false,
            };
        }
        let start = a;

        // last node in the cycle points back at the start
        let mut last = start;
        for _ in 0..CHAIN_WALK_LIMIT {
            match self.chain_next(last, next_offset) {
                Some(n) if n == start => {
                    return self.write_u64(last + next_offset as u64, 0);
                }
                Some(n) => last = n,
                None => return false,
            }
        }
        false
    }

    // ───────────────────────────── recovery ────────────────────────────────────

    /// Validate, apply the canonical fix for every auto-recoverable
    /// failure, then validate again.
    pub fn checkpoint_recover(
        &mut self,
        core: &Core,
        cp: CkptId,
        report: &mut ValidationReport,
    ) -> Vbit {
        let mut first_pass = ValidationReport::default();
        if self.checkpoint_validate(core, cp, &mut first_pass) == Vbit::Void {
            return Vbit::Void;
        }

        let failures: ArrayVec<(u32, InvariantVerdict), 64> = first_pass.failures.clone();
        let mut recovered = 0u32;
        for (index, verdict) in failures {
            let Some(entry) = self.checkpoint_entry(cp, index) else {
                continue;
            };
            let invariants: ArrayVec<Invariant, MAX_INVARIANTS> = {
                let types = core.types.lock();
                match types.get(entry.type_id) {
                    Some(d) => d.invariants.clone(),
                    None => continue,
                }
            };
            for invariant in invariants {
                if self.recover_invariant(&invariant, entry.offset, entry.size, verdict) {
                    recovered += 1;
                    break;
                }
            }
        }

        let mut second_pass = ValidationReport::default();
        self.checkpoint_validate(core, cp, &mut second_pass);
        report.checked = second_pass.checked;
        report.violations = second_pass.violations;
        report.modified = second_pass.modified;
        report.recovered = recovered;
        report.failures = second_pass.failures;
        Vbit::True
    }

    fn recover_invariant(
        &mut self,
        invariant: &Invariant,
        base: u64,
        size: u32,
        verdict: InvariantVerdict,
    ) -> bool {
        match (*invariant, verdict) {
            (Invariant::NullablePointer { field_offset }, InvariantVerdict::BadPointer) => {
                self.write_field_uint(base, field_offset, 8, 0)
            }
            (Invariant::NoCycle { next_offset }, InvariantVerdict::CycleDetected) => {
                self.break_cycle(base, next_offset)
            }
            (
                Invariant::ArrayBounds {
                    ptr_offset,
                    count_offset,
                    elem_size,
                    max_count,
                },
                InvariantVerdict::BoundsExceeded,
            ) => {
                let Some(ptr) = self.field_u64(base, size, ptr_offset) else {
                    return false;
                };
                if !self.contains(ptr, 1) || elem_size == 0 {
                    return false;
                }
                let fit = (self.size() as u64 - ptr) / elem_size as u64;
                let clamped = if max_count != 0 { fit.min(max_count) } else { fit };
                self.write_field_uint(base, count_offset, 8, clamped)
            }
            (
                Invariant::Refcount {
                    field_offset,
                    width,
                    min,
                    ..
                },
                InvariantVerdict::RefcountLow,
            ) => self.write_field_uint(base, field_offset, width, min),
            (
                Invariant::Range {
                    field_offset,
                    width,
                    min,
                    max,
                },
                InvariantVerdict::OutOfRange,
            ) => {
                let value = self
                    .field_uint(base, size, field_offset, width)
                    .unwrap_or(0) as i64;
                let clamped = value.clamp(min, max);
                self.write_field_uint(base, field_offset, width, clamped as u64)
            }
            (Invariant::Custom { recover, .. }, InvariantVerdict::CustomFailed) => {
                let Some(fix) = recover else { return false };
                match self.bytes_mut(base, size as usize) {
                    Some(bytes) => fix(bytes),
                    None => false,
                }
            }
            _ => false,
        }
    }
}
