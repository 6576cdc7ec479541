//! Halcyon Strands
//!
//! A strand is a capability-isolated thread: no implicit shared state, a
//! fixed 256-slot capability table, a private bump band, and a stack that
//! lives inside the owning sovereign's primary arena. Everything a strand
//! can touch, it holds a capability for.
//!
//! States: NASCENT → READY → RUNNING → {READY, BLOCKED, WAITING,
//! TERMINATED}; BLOCKED/WAITING wake back to READY; TERMINATED is final.

pub mod context;
pub mod mutex;

use alloc::vec::Vec;

use crate::capabilities::Capability;
use crate::memory::arena::Arena;
use crate::sched::galactic::GalacticStats;
use crate::sovereign::SovereignId;
use crate::time::Chronon;
use context::{CpuContext, EntryFn};

pub const CAP_TABLE_SIZE: usize = 256;

// exit codes reserved for terminal corruption
pub const EXIT_STACK_VIOLATION: u32 = 0xFFFF_FF00;
pub const EXIT_BAD_CONTEXT: u32 = 0xFFFF_FF01;
pub const EXIT_CAP_VIOLATION: u32 = 0xFFFF_FF02;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct StrandId(pub u32);

impl StrandId {
    pub const VOID: StrandId = StrandId(u32::MAX);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct MutexId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StrandState {
    Nascent = 0,
    Ready = 1,
    Running = 2,
    Blocked = 3,
    Waiting = 4,
    Terminated = 5,
}

/// One capability-table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapSlot {
    Empty,
    Owned(Capability),
    /// Lent out; unusable here until returned or expired.
    Lent {
        cap: Capability,
        borrower: StrandId,
        borrower_slot: u8,
        expiry: Chronon,
    },
    /// Held on loan from another strand.
    Borrowed {
        cap: Capability,
        lender: StrandId,
        lender_slot: u8,
        expiry: Chronon,
    },
    /// Revoked out from under the borrower; dereference reads VOID.
    Voided,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrandError {
    BadSlot,
    SlotOccupied,
    SlotEmpty,
    TableFull,
    BadState,
    Deadlock,
    NotFound,
    NoMemory,
    NoAuthority,
    StackViolation,
}

impl core::fmt::Display for StrandError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Stack carved from the sovereign's primary arena, guarded by its own
/// capability.
pub struct StackInfo {
    pub cap: Capability,
    pub base: u64,
    pub size: usize,
    pub sp: u64,
}

pub struct Strand {
    pub id: StrandId,
    pub owner: SovereignId,
    pub state: StrandState,
    pub chronon: Chronon,
    cap_table: [CapSlot; CAP_TABLE_SIZE],
    /// Private bump band; allocations share the strand's lifetime.
    pub band: Arena,
    pub stack: StackInfo,
    pub entry: EntryFn,
    pub arg: u64,
    pub context: CpuContext,
    pub priority: u8,
    pub base_priority: u8,
    pub affinity: u64,
    pub galactic: GalacticStats,
    /// Join edge in the wait graph; non-owning.
    pub waiting_on: Option<StrandId>,
    /// Mutex edge in the wait graph; non-owning.
    pub blocked_on: Option<MutexId>,
    pub joiners: Vec<StrandId>,
    pub exit_code: Option<u32>,
}

impl Strand {
    pub fn new(
        id: StrandId,
        owner: SovereignId,
        entry: EntryFn,
        arg: u64,
        band: Arena,
        stack: StackInfo,
        priority: u8,
    ) -> Strand {
        Strand {
            id,
            owner,
            state: StrandState::Nascent,
            chronon: Chronon(0),
            cap_table: [CapSlot::Empty; CAP_TABLE_SIZE],
            band,
            stack,
            entry,
            arg,
            context: CpuContext::empty(),
            priority,
            base_priority: priority,
            affinity: u64::MAX,
            galactic: GalacticStats::new(),
            waiting_on: None,
            blocked_on: None,
            joiners: Vec::new(),
            exit_code: None,
        }
    }

    // ─────────────────────────── cap table ─────────────────────────────────────

    pub fn cap_store(&mut self, slot: usize, cap: Capability) -> Result<(), StrandError> {
        let entry = self
            .cap_table
            .get_mut(slot)
            .ok_or(StrandError::BadSlot)?;
        if !matches!(entry, CapSlot::Empty) {
            return Err(StrandError::SlotOccupied);
        }
        *entry = CapSlot::Owned(cap);
        Ok(())
    }

    /// Usable capability in a slot. Lent-out slots and expired borrows
    /// yield nothing.
    pub fn cap_get(&self, slot: usize, now: Chronon) -> Option<Capability> {
        match self.cap_table.get(slot)? {
            CapSlot::Owned(cap) => Some(*cap),
            CapSlot::Borrowed { cap, expiry, .. } if expiry.0 > now.0 => Some(*cap),
            _ => None,
        }
    }

    /// Empty an owned or voided slot, returning the owned token if any.
    pub fn cap_clear(&mut self, slot: usize) -> Result<Option<Capability>, StrandError> {
        let entry = self
            .cap_table
            .get_mut(slot)
            .ok_or(StrandError::BadSlot)?;
        match *entry {
            CapSlot::Owned(cap) => {
                *entry = CapSlot::Empty;
                Ok(Some(cap))
            }
            CapSlot::Voided => {
                *entry = CapSlot::Empty;
                Ok(None)
            }
            CapSlot::Empty => Ok(None),
            _ => Err(StrandError::BadState),
        }
    }

    /// First free slot; a full table reports VOID upstream.
    pub fn cap_find_slot(&self) -> Option<u8> {
        self.cap_table
            .iter()
            .position(|s| matches!(s, CapSlot::Empty))
            .map(|i| i as u8)
    }

    pub fn slot(&self, slot: usize) -> Option<&CapSlot> {
        self.cap_table.get(slot)
    }

    pub(crate) fn set_slot(&mut self, slot: usize, value: CapSlot) -> Result<(), StrandError> {
        let entry = self
            .cap_table
            .get_mut(slot)
            .ok_or(StrandError::BadSlot)?;
        *entry = value;
        Ok(())
    }

    /// Expired borrows in this table, cleared by the scheduler pass.
    pub(crate) fn expired_borrows(&self, now: Chronon) -> Vec<(usize, StrandId, u8)> {
        let mut out = Vec::new();
        for (idx, slot) in self.cap_table.iter().enumerate() {
            if let CapSlot::Borrowed {
                lender,
                lender_slot,
                expiry,
                ..
            } = slot
            {
                if expiry.0 <= now.0 {
                    out.push((idx, *lender, *lender_slot));
                }
            }
        }
        out
    }

    // ─────────────────────────── accounting ────────────────────────────────────

    /// Bytes committed from the private band never exceed its capacity;
    /// the band's bump cursor enforces it by construction.
    pub fn band_used(&self) -> usize {
        self.band.used()
    }

    pub fn is_terminal(&self) -> bool {
        self.state == StrandState::Terminated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{CapTag, CdtNodeId, Rights};
    use crate::memory::arena::ArenaFlags;
    use alloc::vec;
    use core::ptr::NonNull;

    extern "C" fn nop_entry(_arg: u64) -> u32 {
        0
    }

    fn test_cap(gen: u64) -> Capability {
        Capability {
            base: 0x1000,
            len: 0x100,
            generation: gen,
            rights: Rights::RW,
            tag: CapTag::Raw,
            node: CdtNodeId::VOID,
        }
    }

    fn test_strand(buf: &mut [u8]) -> Strand {
        let base = NonNull::new(buf.as_mut_ptr()).expect("base");
        let band = unsafe { Arena::from_raw(base, buf.len(), ArenaFlags::empty()) };
        let stack = StackInfo {
            cap: test_cap(1),
            base: 0x2000,
            size: 0x1000,
            sp: 0x3000,
        };
        Strand::new(StrandId(1), SovereignId(0), nop_entry, 0, band, stack, 16)
    }

    #[test]
    fn cap_table_store_get_clear() {
        let mut buf = vec![0u8; 64];
        let mut strand = test_strand(&mut buf);
        let cap = test_cap(1);

        strand.cap_store(3, cap).expect("store");
        assert_eq!(strand.cap_store(3, cap), Err(StrandError::SlotOccupied));
        assert_eq!(strand.cap_get(3, Chronon(0)), Some(cap));
        assert_eq!(strand.cap_clear(3).expect("clear"), Some(cap));
        assert_eq!(strand.cap_get(3, Chronon(0)), None);
        assert_eq!(strand.cap_store(CAP_TABLE_SIZE, cap), Err(StrandError::BadSlot));
    }

    #[test]
    fn find_slot_skips_occupied() {
        let mut buf = vec![0u8; 64];
        let mut strand = test_strand(&mut buf);
        strand.cap_store(0, test_cap(1)).expect("store");
        strand.cap_store(1, test_cap(1)).expect("store");
        assert_eq!(strand.cap_find_slot(), Some(2));
    }

    #[test]
    fn borrowed_slots_expire() {
        let mut buf = vec![0u8; 64];
        let mut strand = test_strand(&mut buf);
        strand
            .set_slot(
                5,
                CapSlot::Borrowed {
                    cap: test_cap(1),
                    lender: StrandId(9),
                    lender_slot: 2,
                    expiry: Chronon(10),
                },
            )
            .expect("set");

        assert!(strand.cap_get(5, Chronon(9)).is_some());
        assert!(strand.cap_get(5, Chronon(10)).is_none());
        let expired = strand.expired_borrows(Chronon(10));
        assert_eq!(expired, vec![(5, StrandId(9), 2)]);
    }

    #[test]
    fn band_accounting_tracks_cursor() {
        let mut buf = vec![0u8; 256];
        let mut strand = test_strand(&mut buf);
        assert_eq!(strand.band_used(), 0);
        strand.band.alloc(100, 0).expect("alloc");
        assert!(strand.band_used() >= 100);
        assert!(strand.band_used() <= strand.band.capacity());
    }
}
