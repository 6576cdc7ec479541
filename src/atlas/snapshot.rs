// atlas/snapshot.rs — causal snapshots with copy-on-write.
//
// A snapshot is a point-in-time view tracked by a vector clock: PREPARING
// collects the page set, ACTIVE owns a COW reserve inside the region and
// captures first-touch originals, COMMITTED is durable and restorable.
// Restore copies every captured page back, rebuilds Genesis from the copy
// taken at begin (preserving the live generation and counters), merges
// clocks componentwise and ticks the local component.

use arrayvec::ArrayVec;
use hashbrown::HashMap;

use super::{Atlas, GenesisHeader, GENESIS_SIZE, PAGE};
use crate::time::{CausalOrder, VectorClock};
use crate::void::{is_void_u64, Vbit, VoidLog, VoidReason, VOID_U64};

pub const MAX_SNAP_PAGES: usize = 64;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CowFlags: u32 {
        const VALID        = 1 << 0;
        const DIRTY        = 1 << 1;
        const GENESIS_PAGE = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotState {
    Preparing,
    Active,
    Committed,
    Failed,
    Void,
}

#[derive(Debug, Clone, Copy)]
pub struct CowEntry {
    pub copy_offset: u64,
    pub flags: CowFlags,
}

/// Slot index into the bounded snapshot pool.
pub type SnapId = usize;

pub struct Snapshot {
    pub id: u64,
    pub state: SnapshotState,
    pub vclock: VectorClock,
    pub generation: u64,
    pub epoch: u64,
    pub(crate) included: ArrayVec<u64, MAX_SNAP_PAGES>,
    pub(crate) cow: HashMap<u64, CowEntry>,
    cow_base: u64,
    cow_used: usize,
    genesis_copy: [u8; GENESIS_SIZE],
}

impl Snapshot {
    pub(crate) fn mark_dead(&mut self) {
        if matches!(self.state, SnapshotState::Preparing | SnapshotState::Active) {
            self.state = SnapshotState::Failed;
        }
    }

    pub fn includes_page(&self, page: u64) -> bool {
        self.included.contains(&page)
    }

    /// Best-effort mode after a failed COW reservation.
    pub fn degraded(&self) -> bool {
        is_void_u64(self.cow_base)
    }
}

impl Atlas {
    /// Open a snapshot in PREPARING, capturing the supplied vector clock
    /// or the live one. VOID (None) when the pool is exhausted.
    pub fn snapshot_begin(
        &mut self,
        vclock: Option<&VectorClock>,
        log: &VoidLog,
    ) -> Option<SnapId> {
        let slot = match self
            .snapshots
            .iter()
            .position(|s| matches!(s.state, SnapshotState::Failed | SnapshotState::Void))
        {
            Some(slot) => slot,
            None if self.snapshots.is_full() => {
                log.record(
                    VoidReason::PoolExhausted,
                    "atlas.snapshot_begin",
                    [self.snapshots.len() as u64, 0],
                    "snapshot pool full",
                );
                return None;
            }
            None => {
                self.snapshots.push(Snapshot {
                    id: 0,
                    state: SnapshotState::Void,
                    vclock: VectorClock::new(),
                    generation: 0,
                    epoch: 0,
                    included: ArrayVec::new(),
                    cow: HashMap::new(),
                    cow_base: VOID_U64,
                    cow_used: 0,
                    genesis_copy: [0; GENESIS_SIZE],
                });
                self.snapshots.len() - 1
            }
        };

        let id = self.stamp();
        let captured = vclock.copied().unwrap_or(self.vclock);
        let generation = self.generation();
        let epoch = self.epoch();
        let mut genesis_copy = [0u8; GENESIS_SIZE];
        if let Some(bytes) = self.bytes(0, GENESIS_SIZE) {
            genesis_copy.copy_from_slice(bytes);
        }
        let snap = &mut self.snapshots[slot];
        snap.id = id;
        snap.state = SnapshotState::Preparing;
        snap.vclock = captured;
        snap.generation = generation;
        snap.epoch = epoch;
        snap.included.clear();
        snap.cow.clear();
        snap.cow_base = VOID_U64;
        snap.cow_used = 0;
        snap.genesis_copy = genesis_copy;
        Some(slot)
    }

    pub fn snapshot(&self, snap: SnapId) -> Option<&Snapshot> {
        self.snapshots.get(snap)
    }

    /// Accumulate pages covering `[offset, offset+size)` while PREPARING.
    pub fn snapshot_include(
        &mut self,
        snap: SnapId,
        offset: u64,
        size: u64,
        log: &VoidLog,
    ) -> Vbit {
        if size == 0 || !self.contains(offset, size) {
            return Vbit::Void;
        }
        let Some(s) = self.snapshots.get_mut(snap) else {
            return Vbit::Void;
        };
        if s.state != SnapshotState::Preparing {
            return Vbit::False;
        }
        let first = offset & !(PAGE - 1);
        let last = (offset + size - 1) & !(PAGE - 1);
        let mut page = first;
        loop {
            if !s.included.contains(&page) {
                if s.included.try_push(page).is_err() {
                    log.record(
                        VoidReason::PoolExhausted,
                        "atlas.snapshot_include",
                        [snap as u64, MAX_SNAP_PAGES as u64],
                        "page set full",
                    );
                    return Vbit::Void;
                }
            }
            if page == last {
                break;
            }
            page += PAGE;
        }
        Vbit::True
    }

    /// Convenience: include everything from Genesis up to the bump cursor.
    pub fn snapshot_include_all(&mut self, snap: SnapId, log: &VoidLog) -> Vbit {
        let len = self.genesis().next_alloc_offset;
        self.snapshot_include(snap, 0, len, log)
    }

    /// PREPARING → ACTIVE: reserve COW storage sized to the page set and
    /// tick the local clock (a causal event). A failed reservation
    /// degrades to best-effort instead of failing the snapshot.
    pub fn snapshot_activate(&mut self, snap: SnapId, log: &VoidLog) -> Vbit {
        let pages = match self.snapshots.get(snap) {
            Some(s) if s.state == SnapshotState::Preparing => s.included.len(),
            _ => return Vbit::Void,
        };
        let cow_base = if pages > 0 {
            self.alloc_pages(pages as u64 * PAGE, log)
        } else {
            VOID_U64
        };
        let node = self.node_id;
        self.vclock.tick(node);
        let s = &mut self.snapshots[snap];
        s.cow_base = cow_base;
        s.state = SnapshotState::Active;
        if pages > 0 && is_void_u64(cow_base) {
            log.record(
                VoidReason::OutOfMemory,
                "atlas.snapshot_activate",
                [snap as u64, pages as u64],
                "degraded to best-effort",
            );
        }
        Vbit::True
    }

    /// First-touch copy of an included page into the COW reserve.
    /// True once recorded (idempotent), False when degraded or full,
    /// Void for pages outside the snapshot.
    pub fn snapshot_cow_page(&mut self, snap: SnapId, page: u64, log: &VoidLog) -> Vbit {
        let page = page & !(PAGE - 1);
        let (cow_base, cow_used, included, already) = match self.snapshots.get(snap) {
            Some(s) if s.state == SnapshotState::Active => (
                s.cow_base,
                s.cow_used,
                s.includes_page(page),
                s.cow.contains_key(&page),
            ),
            _ => return Vbit::Void,
        };
        if !included {
            log.record(
                VoidReason::OutOfRange,
                "atlas.snapshot_cow_page",
                [snap as u64, page],
                "page not in snapshot",
            );
            return Vbit::Void;
        }
        if already {
            return Vbit::True;
        }
        if is_void_u64(cow_base) {
            return Vbit::False;
        }
        let copy_offset = cow_base + (cow_used as u64) * PAGE;
        if !self.copy_within_region(page, copy_offset, PAGE as usize) {
            return Vbit::False;
        }
        let mut flags = CowFlags::VALID;
        if page == 0 {
            flags |= CowFlags::GENESIS_PAGE;
        }
        let s = &mut self.snapshots[snap];
        s.cow.insert(page, CowEntry { copy_offset, flags });
        s.cow_used += 1;
        Vbit::True
    }

    /// Guard a live write: every ACTIVE snapshot covering the range
    /// captures its original first.
    pub fn snapshot_guard_write(&mut self, offset: u64, len: u64, log: &VoidLog) {
        if len == 0 {
            return;
        }
        let first = offset & !(PAGE - 1);
        let last = (offset + len - 1) & !(PAGE - 1);
        for snap in 0..self.snapshots.len() {
            if self.snapshots[snap].state != SnapshotState::Active {
                continue;
            }
            let mut page = first;
            loop {
                if self.snapshots[snap].includes_page(page) {
                    let _ = self.snapshot_cow_page(snap, page, log);
                }
                if page == last {
                    break;
                }
                page += PAGE;
            }
        }
    }

    /// Read through the snapshot: the COW copy when present, the live
    /// page otherwise.
    pub fn snapshot_read_page(&self, snap: SnapId, offset: u64) -> Option<core::ptr::NonNull<u8>> {
        let s = self.snapshots.get(snap)?;
        let page = offset & !(PAGE - 1);
        let within = offset - page;
        match s.cow.get(&page) {
            Some(entry) => self.offset_to_ptr(entry.copy_offset + within),
            None => self.offset_to_ptr(offset),
        }
    }

    /// ACTIVE → COMMITTED: captured pages and metadata go durable, local
    /// clock ticks.
    pub fn snapshot_commit(&mut self, snap: SnapId, log: &VoidLog) -> Vbit {
        let (state, cow_base, cow_used) = match self.snapshots.get(snap) {
            Some(s) => (s.state, s.cow_base, s.cow_used),
            None => return Vbit::Void,
        };
        if state != SnapshotState::Active {
            log.record(
                VoidReason::StateViolation,
                "atlas.snapshot_commit",
                [snap as u64, state as u64],
                "commit on non-active snapshot",
            );
            return Vbit::Void;
        }
        if !is_void_u64(cow_base) && cow_used > 0 {
            let _ = self.sync_range(cow_base, cow_used * PAGE as usize);
        }
        let _ = self.sync_range(0, GENESIS_SIZE);
        let node = self.node_id;
        self.vclock.tick(node);
        self.snapshots[snap].state = SnapshotState::Committed;
        Vbit::True
    }

    /// Roll the region back to a COMMITTED snapshot. Active transactions
    /// abort; every captured page returns to its original location;
    /// Genesis is rebuilt from the begin-time copy with the live
    /// generation preserved and the commit counter advanced; clocks merge
    /// then tick local; the epoch moves forward.
    pub fn snapshot_restore(&mut self, snap: SnapId, log: &VoidLog) -> Vbit {
        let state = match self.snapshots.get(snap) {
            Some(s) => s.state,
            None => return Vbit::Void,
        };
        if state != SnapshotState::Committed {
            log.record(
                VoidReason::StateViolation,
                "atlas.snapshot_restore",
                [snap as u64, state as u64],
                "restore needs a committed snapshot",
            );
            return Vbit::Void;
        }

        // abort whatever is in flight; restored state supersedes it
        for slot in 0..self.tx_pool.len() {
            let _ = self.tx_abort(slot);
        }

        // live counters survive the restore, so read them before any
        // captured Genesis page copies back over them
        let preserved_generation = self.generation();
        let preserved_commits = self.commit_count();
        let preserved_aborts = self.abort_count();
        let preserved_epoch = self.epoch();
        let snapshot_clock = self.snapshots[snap].vclock;
        let genesis_copy = self.snapshots[snap].genesis_copy;

        let pairs: alloc::vec::Vec<(u64, u64)> = self.snapshots[snap]
            .cow
            .iter()
            .map(|(&page, entry)| (entry.copy_offset, page))
            .collect();
        for (copy_offset, page) in pairs {
            if !self.copy_within_region(copy_offset, page, PAGE as usize) {
                return Vbit::Void;
            }
        }

        // SAFETY: both buffers are GENESIS_SIZE and the region holds it
        unsafe {
            let genesis = self.genesis_mut() as *mut GenesisHeader as *mut u8;
            core::ptr::copy_nonoverlapping(genesis_copy.as_ptr(), genesis, GENESIS_SIZE);
        }
        {
            let genesis = self.genesis_mut();
            genesis.generation = preserved_generation;
            genesis.commit_count = preserved_commits + 1;
            genesis.abort_count = preserved_aborts;
            genesis.epoch = preserved_epoch + 1;
        }

        self.vclock.merge(&snapshot_clock);
        let node = self.node_id;
        self.vclock.tick(node);

        let _ = self.sync();
        Vbit::True
    }

    /// Causal order between two snapshots.
    pub fn snapshot_compare(&self, a: SnapId, b: SnapId) -> CausalOrder {
        match (self.snapshots.get(a), self.snapshots.get(b)) {
            (Some(sa), Some(sb)) => sa.vclock.compare(&sb.vclock),
            _ => CausalOrder::Void,
        }
    }

    /// Raw byte move between two in-region ranges.
    pub(crate) fn copy_within_region(&mut self, src: u64, dst: u64, len: usize) -> bool {
        if !self.contains(src, len as u64) || !self.contains(dst, len as u64) || src == dst {
            return false;
        }
        // SAFETY: both ranges validated against the mapped length
        unsafe {
            let base = self.base.as_ptr();
            core::ptr::copy(base.add(src as usize), base.add(dst as usize), len);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::mem_atlas;
    use super::*;
    use crate::atlas::MAX_SNAPSHOTS;

    #[test]
    fn lifecycle_preparing_active_committed() {
        let log = VoidLog::new();
        let mut atlas = mem_atlas(64, &log);
        let off = atlas.alloc_pages(PAGE, &log);

        let snap = atlas.snapshot_begin(None, &log).expect("begin");
        assert_eq!(
            atlas.snapshot(snap).map(|s| s.state),
            Some(SnapshotState::Preparing)
        );
        assert_eq!(atlas.snapshot_include(snap, off, PAGE, &log), Vbit::True);

        let clock_before = atlas.vclock;
        assert_eq!(atlas.snapshot_activate(snap, &log), Vbit::True);
        assert!(atlas.vclock.get(0) > clock_before.get(0));

        assert_eq!(atlas.snapshot_commit(snap, &log), Vbit::True);
        assert_eq!(
            atlas.snapshot(snap).map(|s| s.state),
            Some(SnapshotState::Committed)
        );
        // commit again is a state violation
        assert_eq!(atlas.snapshot_commit(snap, &log), Vbit::Void);
    }

    #[test]
    fn cow_read_prefers_the_copy() {
        let log = VoidLog::new();
        let mut atlas = mem_atlas(64, &log);
        let off = atlas.alloc_pages(PAGE, &log);
        atlas.bytes_mut(off, 16).expect("bytes").fill(0x11);

        let snap = atlas.snapshot_begin(None, &log).expect("begin");
        atlas.snapshot_include(snap, off, PAGE, &log);
        atlas.snapshot_activate(snap, &log);

        assert_eq!(atlas.snapshot_cow_page(snap, off, &log), Vbit::True);
        // idempotent on the second touch
        assert_eq!(atlas.snapshot_cow_page(snap, off, &log), Vbit::True);

        atlas.bytes_mut(off, 16).expect("bytes").fill(0x22);
        let through = atlas.snapshot_read_page(snap, off).expect("read");
        assert_eq!(unsafe { through.as_ptr().read() }, 0x11);
        // pages never captured read live
        let live = atlas.snapshot_read_page(snap, 0).expect("read");
        assert_eq!(unsafe { (live.as_ptr() as *const u64).read() }, super::super::ATLAS_MAGIC);
    }

    #[test]
    fn restore_returns_pattern_and_advances_clock() {
        // S4 shape: include all, write 0xAB, capture, commit, clobber
        // with 0xCD, restore, read 0xAB back
        let log = VoidLog::new();
        let mut atlas = mem_atlas(64, &log);
        let p = atlas.alloc_pages(PAGE, &log);

        let v0 = atlas.vclock;
        let snap = atlas.snapshot_begin(Some(&v0), &log).expect("begin");
        assert_eq!(atlas.snapshot_include_all(snap, &log), Vbit::True);
        assert_eq!(atlas.snapshot_activate(snap, &log), Vbit::True);

        atlas.bytes_mut(p, PAGE as usize).expect("bytes").fill(0xAB);
        assert_eq!(atlas.snapshot_cow_page(snap, p, &log), Vbit::True);
        assert_eq!(atlas.snapshot_commit(snap, &log), Vbit::True);

        atlas.bytes_mut(p, PAGE as usize).expect("bytes").fill(0xCD);
        let commits = atlas.commit_count();
        let generation = atlas.generation();
        let epoch = atlas.epoch();
        let clock_before_restore = atlas.vclock;

        assert_eq!(atlas.snapshot_restore(snap, &log), Vbit::True);
        assert!(atlas
            .bytes(p, PAGE as usize)
            .expect("bytes")
            .iter()
            .all(|&b| b == 0xAB));
        assert_eq!(atlas.generation(), generation);
        assert_eq!(atlas.commit_count(), commits + 1);
        assert_eq!(atlas.epoch(), epoch + 1);
        // componentwise >= both clocks and strictly greater locally
        assert!(atlas.vclock.get(0) > clock_before_restore.get(0));
        assert!(atlas.vclock.get(0) > v0.get(0));
    }

    #[test]
    fn restore_aborts_active_transactions() {
        let log = VoidLog::new();
        let mut atlas = mem_atlas(64, &log);
        let snap = atlas.snapshot_begin(None, &log).expect("begin");
        atlas.snapshot_include_all(snap, &log);
        atlas.snapshot_activate(snap, &log);
        atlas.snapshot_commit(snap, &log);

        let tx = atlas.tx_begin(&log).expect("tx");
        assert_eq!(atlas.snapshot_restore(snap, &log), Vbit::True);
        assert_eq!(
            atlas.tx(tx).map(|t| t.state),
            Some(crate::atlas::tx::TxState::Aborted)
        );
    }

    #[test]
    fn compare_reads_the_vector_clocks() {
        let log = VoidLog::new();
        let mut atlas = mem_atlas(64, &log);
        let a = atlas.snapshot_begin(None, &log).expect("a");
        // a causal event between the two snapshots orders them
        atlas.vclock.tick(0);
        let b = atlas.snapshot_begin(None, &log).expect("b");
        assert_eq!(atlas.snapshot_compare(a, a), CausalOrder::Equal);
        assert_eq!(atlas.snapshot_compare(a, b), CausalOrder::Before);
        assert_eq!(atlas.snapshot_compare(b, a), CausalOrder::After);
        assert_eq!(atlas.snapshot_compare(a, 99), CausalOrder::Void);
    }

    #[test]
    fn pool_bounds_and_degraded_mode() {
        let log = VoidLog::new();
        let mut atlas = mem_atlas(16, &log);
        for _ in 0..MAX_SNAPSHOTS {
            assert!(atlas.snapshot_begin(None, &log).is_some());
        }
        assert!(atlas.snapshot_begin(None, &log).is_none());
        assert!(log.has_reason(VoidReason::PoolExhausted));

        // a snapshot too large for the remaining region degrades
        let log2 = VoidLog::new();
        let mut small = mem_atlas(5, &log2);
        let snap = small.snapshot_begin(None, &log2).expect("begin");
        assert_eq!(small.snapshot_include_all(snap, &log2), Vbit::True);
        assert_eq!(small.snapshot_activate(snap, &log2), Vbit::True);
        assert!(small.snapshot(snap).expect("snap").degraded());
        // best effort: captures report FALSE, snapshot stays usable
        assert_eq!(small.snapshot_cow_page(snap, 0, &log2), Vbit::False);
    }
}
