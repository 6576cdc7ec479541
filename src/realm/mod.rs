//! Halcyon Realm
//!
//! The realm owns every execution table: sovereigns, strands, kernel
//! mutexes, the capability derivation tree and the scheduler. All
//! cross-strand traffic (grants, lends, joins, mutex hand-offs) goes
//! through realm methods over plain ids, so the wait graph can be walked
//! read-only before anyone blocks. Ownership of a strand always rests
//! with its sovereign; `waiting_on` and mutex holder fields are
//! non-owning edges.

use alloc::vec::Vec;

use crate::capabilities::{CapTag, Capability, DerivationTree, Rights};
use crate::memory::arena::{Arena, ArenaFlags};
use crate::sched::GalacticScheduler;
use crate::sovereign::{Sovereign, SovereignId};
use crate::strand::context::EntryFn;
use crate::strand::mutex::KMutex;
use crate::strand::{
    CapSlot, MutexId, Strand, StrandError, StrandId, StrandState, EXIT_BAD_CONTEXT,
    EXIT_STACK_VIOLATION,
};
use crate::time::Chronon;
use crate::void::{VoidLog, VoidReason};

/// Bound on wait-graph walks; cycles are found long before this.
const WAIT_WALK_DEPTH: usize = 64;

/// Default private band carved for each strand.
pub const STRAND_BAND_BYTES: usize = 16 * 1024;

/// Outcome of a join that did not error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Done(u32),
    Pending,
}

pub struct Realm {
    pub cdt: DerivationTree,
    pub(crate) sovereigns: Vec<Option<Sovereign>>,
    pub(crate) strands: Vec<Option<Strand>>,
    pub(crate) mutexes: Vec<Option<KMutex>>,
    pub sched: GalacticScheduler,
    pub current: Option<StrandId>,
    /// Realm-wide tick; lend expiries and wait deadlines use it.
    pub now: Chronon,
}

extern "C" fn exit_trap(_code: u32) -> ! {
    // embedder installs the real exit path before first dispatch
    loop {
        core::hint::spin_loop();
    }
}

impl Realm {
    pub fn new() -> Realm {
        Realm {
            cdt: DerivationTree::new(),
            sovereigns: Vec::new(),
            strands: Vec::new(),
            mutexes: Vec::new(),
            sched: GalacticScheduler::new(),
            current: None,
            now: Chronon(0),
        }
    }

    pub fn tick(&mut self) -> Chronon {
        if let Some(cur) = self.current {
            if let Some(strand) = self.strand_mut(cur) {
                strand.chronon.advance();
            }
        }
        self.now.advance()
    }

    // ───────────────────────── table access ────────────────────────────────────

    pub fn strand(&self, id: StrandId) -> Option<&Strand> {
        self.strands.get(id.0 as usize)?.as_ref()
    }

    pub fn strand_mut(&mut self, id: StrandId) -> Option<&mut Strand> {
        self.strands.get_mut(id.0 as usize)?.as_mut()
    }

    pub fn sovereign(&self, id: SovereignId) -> Option<&Sovereign> {
        self.sovereigns.get(id.0 as usize)?.as_ref()
    }

    pub fn sovereign_mut(&mut self, id: SovereignId) -> Option<&mut Sovereign> {
        self.sovereigns.get_mut(id.0 as usize)?.as_mut()
    }

    pub fn mutex(&self, id: MutexId) -> Option<&KMutex> {
        self.mutexes.get(id.0 as usize)?.as_ref()
    }

    pub fn mutex_mut(&mut self, id: MutexId) -> Option<&mut KMutex> {
        self.mutexes.get_mut(id.0 as usize)?.as_mut()
    }

    fn strand_pair_mut(
        &mut self,
        a: StrandId,
        b: StrandId,
    ) -> Option<(&mut Strand, &mut Strand)> {
        let (ai, bi) = (a.0 as usize, b.0 as usize);
        if ai == bi || ai >= self.strands.len() || bi >= self.strands.len() {
            return None;
        }
        let (low, high) = if ai < bi { (ai, bi) } else { (bi, ai) };
        let (left, right) = self.strands.split_at_mut(high);
        let first = left[low].as_mut()?;
        let second = right[0].as_mut()?;
        Some(if ai < bi { (first, second) } else { (second, first) })
    }

    // ───────────────────────── strand lifecycle ────────────────────────────────

    /// New strand in NASCENT: stack and private band carved from the
    /// owning sovereign's primary arena, stack capability minted, context
    /// primed to begin at `entry(arg)`.
    pub fn strand_create(
        &mut self,
        log: &VoidLog,
        owner: SovereignId,
        entry: EntryFn,
        arg: u64,
        stack_size: usize,
        priority: u8,
    ) -> Result<StrandId, StrandError> {
        let id = StrandId(self.strands.len() as u32);

        let sovereign = self.sovereign_mut(owner).ok_or(StrandError::NotFound)?;
        let primary = sovereign.arenas.primary.as_mut().ok_or(StrandError::BadState)?;

        let stack_ptr = primary.alloc(stack_size, 16).ok_or_else(|| {
            log.record(
                VoidReason::OutOfMemory,
                "realm.strand_create",
                [owner.0 as u64, stack_size as u64],
                "primary arena exhausted",
            );
            StrandError::NoMemory
        })?;
        let band_ptr = primary.alloc(STRAND_BAND_BYTES, 16).ok_or_else(|| {
            log.record(
                VoidReason::OutOfMemory,
                "realm.strand_create",
                [owner.0 as u64, STRAND_BAND_BYTES as u64],
                "primary arena exhausted",
            );
            StrandError::NoMemory
        })?;
        sovereign.memory_used += stack_size + STRAND_BAND_BYTES;
        sovereign.strands.push(id);

        let stack_base = stack_ptr.as_ptr() as u64;
        let stack_top = stack_base + stack_size as u64;
        // SAFETY: the band range was just carved from the primary arena
        let band = unsafe { Arena::from_raw(band_ptr, STRAND_BAND_BYTES, ArenaFlags::empty()) };

        let stack_cap = self
            .cdt
            .mint(log, stack_base, stack_size as u64, Rights::RW, CapTag::Stack)
            .map_err(|_| StrandError::NoMemory)?;

        let stack = crate::strand::StackInfo {
            cap: stack_cap,
            base: stack_base,
            size: stack_size,
            sp: stack_top,
        };

        let mut strand = Strand::new(id, owner, entry, arg, band, stack, priority);
        strand
            .context
            .init_for_entry(entry, arg, stack_top, exit_trap);
        self.strands.push(Some(strand));
        log::debug!("strand {:?} created for sovereign {:?}", id, owner);
        Ok(id)
    }

    /// NASCENT → READY and onto the run queue.
    pub fn strand_start(&mut self, id: StrandId) -> Result<(), StrandError> {
        let strand = self.strand_mut(id).ok_or(StrandError::NotFound)?;
        if strand.state != StrandState::Nascent {
            return Err(StrandError::BadState);
        }
        strand.state = StrandState::Ready;
        let priority = strand.priority;
        self.sched.enqueue(id, priority);
        Ok(())
    }

    /// RUNNING → READY, back on the queue; the caller dispatches next.
    pub fn strand_yield(&mut self) -> Result<(), StrandError> {
        let id = self.current.ok_or(StrandError::BadState)?;
        let strand = self.strand_mut(id).ok_or(StrandError::NotFound)?;
        if strand.state != StrandState::Running {
            return Err(StrandError::BadState);
        }
        strand.state = StrandState::Ready;
        let priority = strand.priority;
        self.sched.enqueue(id, priority);
        self.current = None;
        Ok(())
    }

    /// Terminate the strand and wake every joiner.
    pub fn strand_exit(&mut self, id: StrandId, code: u32) -> Result<(), StrandError> {
        let strand = self.strand_mut(id).ok_or(StrandError::NotFound)?;
        if strand.state == StrandState::Terminated {
            return Err(StrandError::BadState);
        }
        strand.state = StrandState::Terminated;
        strand.exit_code = Some(code);
        strand.waiting_on = None;
        strand.blocked_on = None;
        let joiners = core::mem::take(&mut strand.joiners);
        self.sched.remove(id);
        if self.current == Some(id) {
            self.current = None;
        }
        for joiner in joiners {
            if let Some(waiter) = self.strand_mut(joiner) {
                if waiter.state == StrandState::Waiting {
                    waiter.state = StrandState::Ready;
                    waiter.waiting_on = None;
                    let priority = waiter.priority;
                    self.sched.enqueue(joiner, priority);
                }
            }
        }
        Ok(())
    }

    /// Block until `target` terminates. Detects join cycles before anyone
    /// blocks: a caller that would appear in its own wait chain gets
    /// DEADLOCK and stays runnable.
    pub fn strand_join(
        &mut self,
        log: &VoidLog,
        caller: StrandId,
        target: StrandId,
    ) -> Result<JoinOutcome, StrandError> {
        if caller == target {
            return Err(StrandError::Deadlock);
        }
        let code = {
            let t = self.strand(target).ok_or(StrandError::NotFound)?;
            if t.state == StrandState::Terminated {
                t.exit_code
            } else {
                None
            }
        };
        if let Some(code) = code {
            return Ok(JoinOutcome::Done(code));
        }

        if self.wait_chain_reaches(target, caller) {
            log.record(
                VoidReason::Deadlock,
                "realm.join",
                [caller.0 as u64, target.0 as u64],
                "join cycle",
            );
            return Err(StrandError::Deadlock);
        }

        let caller_strand = self.strand_mut(caller).ok_or(StrandError::NotFound)?;
        caller_strand.state = StrandState::Waiting;
        caller_strand.waiting_on = Some(target);
        self.sched.remove(caller);
        if self.current == Some(caller) {
            self.current = None;
        }
        let target_strand = self.strand_mut(target).ok_or(StrandError::NotFound)?;
        target_strand.joiners.push(caller);
        Ok(JoinOutcome::Pending)
    }

    /// Exit code of a terminated strand, for a woken joiner.
    pub fn join_result(&self, target: StrandId) -> Option<u32> {
        self.strand(target)?.exit_code
    }

    /// Walk `waiting_on` and mutex-holder edges from `start`; true if the
    /// chain reaches `needle` within the bounded depth.
    fn wait_chain_reaches(&self, start: StrandId, needle: StrandId) -> bool {
        let mut cursor = Some(start);
        for _ in 0..WAIT_WALK_DEPTH {
            let Some(id) = cursor else { return false };
            if id == needle {
                return true;
            }
            let Some(strand) = self.strand(id) else {
                return false;
            };
            cursor = match (strand.waiting_on, strand.blocked_on) {
                (Some(next), _) => Some(next),
                (None, Some(mid)) => self.mutex(mid).and_then(|m| m.holder),
                (None, None) => None,
            };
        }
        false
    }

    /// Terminal corruption path: reserved exit code, recorded, queues
    /// cleaned.
    pub fn strand_fault(&mut self, log: &VoidLog, id: StrandId, code: u32) {
        log.record(
            VoidReason::StateViolation,
            "realm.fault",
            [id.0 as u64, code as u64],
            "strand terminated by fault",
        );
        let _ = self.strand_exit(id, code);
    }

    // ───────────────────────────── dispatch ────────────────────────────────────

    /// Scheduler entry: clear expired lends, then run the highest-priority
    /// READY strand. Strands failing the stack or context check terminate
    /// instead of dispatching.
    pub fn dispatch(&mut self, log: &VoidLog) -> Option<StrandId> {
        self.process_lends(log);
        loop {
            let id = self.sched.pick_next()?;
            let Some(strand) = self.strand_mut(id) else {
                continue;
            };
            if strand.state != StrandState::Ready {
                continue;
            }
            if !strand.context.is_valid() {
                self.strand_fault(log, id, EXIT_BAD_CONTEXT);
                continue;
            }
            let (sp, base, size, stack_cap_ok) = {
                let s = self.strand(id)?;
                let ok = !matches!(
                    self.cdt.check(log, &s.stack.cap, Rights::RW),
                    crate::void::Vbit::Void
                );
                (s.stack.sp, s.stack.base, s.stack.size, ok)
            };
            if sp < base || sp > base + size as u64 || !stack_cap_ok {
                self.strand_fault(log, id, EXIT_STACK_VIOLATION);
                continue;
            }
            let strand = self.strand_mut(id)?;
            strand.state = StrandState::Running;
            self.current = Some(id);
            return Some(id);
        }
    }

    /// Quantum-end accounting for the current strand; reprioritizes from
    /// the Galactic feedback and re-queues it READY.
    pub fn quantum_end(&mut self, actual_ticks: u64, waited: u64, response: u64) {
        let Some(id) = self.current else { return };
        let Some(strand) = self.strand_mut(id) else {
            return;
        };
        let mut stats = core::mem::take(&mut strand.galactic);
        let priority = strand.priority;
        let new_priority =
            self.sched
                .quantum_end(&mut stats, priority, actual_ticks, waited, response);
        let Some(strand) = self.strand_mut(id) else {
            return;
        };
        strand.galactic = stats;
        strand.priority = new_priority;
        if strand.state == StrandState::Running {
            strand.state = StrandState::Ready;
            self.sched.enqueue(id, new_priority);
        }
        self.current = None;
    }

    // ──────────────────────── capability traffic ───────────────────────────────

    /// Move an owned capability: source slot empties, destination owns.
    pub fn grant(
        &mut self,
        from: StrandId,
        src_slot: usize,
        to: StrandId,
        dst_slot: usize,
    ) -> Result<(), StrandError> {
        let (src, dst) = self.strand_pair_mut(from, to).ok_or(StrandError::NotFound)?;
        let Some(CapSlot::Owned(cap)) = src.slot(src_slot).copied() else {
            return Err(StrandError::SlotEmpty);
        };
        if !matches!(dst.slot(dst_slot), Some(CapSlot::Empty)) {
            return Err(StrandError::SlotOccupied);
        }
        src.set_slot(src_slot, CapSlot::Empty)?;
        dst.set_slot(dst_slot, CapSlot::Owned(cap))?;
        Ok(())
    }

    /// Temporary loan with an absolute expiry.
    pub fn lend(
        &mut self,
        from: StrandId,
        src_slot: usize,
        to: StrandId,
        dst_slot: usize,
        timeout: u64,
    ) -> Result<(), StrandError> {
        let now = self.now;
        let (src, dst) = self.strand_pair_mut(from, to).ok_or(StrandError::NotFound)?;
        let Some(CapSlot::Owned(cap)) = src.slot(src_slot).copied() else {
            return Err(StrandError::SlotEmpty);
        };
        if !matches!(dst.slot(dst_slot), Some(CapSlot::Empty)) {
            return Err(StrandError::SlotOccupied);
        }
        let expiry = Chronon(now.0.saturating_add(timeout));
        src.set_slot(
            src_slot,
            CapSlot::Lent {
                cap,
                borrower: to,
                borrower_slot: dst_slot as u8,
                expiry,
            },
        )?;
        dst.set_slot(
            dst_slot,
            CapSlot::Borrowed {
                cap,
                lender: from,
                lender_slot: src_slot as u8,
                expiry,
            },
        )?;
        Ok(())
    }

    /// Immediate recall of a lend: the borrower's slot turns VOID, the
    /// lender owns again.
    pub fn revoke_slot(
        &mut self,
        log: &VoidLog,
        from: StrandId,
        src_slot: usize,
    ) -> Result<(), StrandError> {
        let lent = {
            let src = self.strand(from).ok_or(StrandError::NotFound)?;
            match src.slot(src_slot) {
                Some(CapSlot::Lent {
                    cap,
                    borrower,
                    borrower_slot,
                    ..
                }) => (*cap, *borrower, *borrower_slot),
                _ => return Err(StrandError::BadState),
            }
        };
        let (cap, borrower, borrower_slot) = lent;
        if let Some(b) = self.strand_mut(borrower) {
            let _ = b.set_slot(borrower_slot as usize, CapSlot::Voided);
        }
        let src = self.strand_mut(from).ok_or(StrandError::NotFound)?;
        src.set_slot(src_slot, CapSlot::Owned(cap))?;
        log.record(
            VoidReason::Revoked,
            "realm.revoke",
            [from.0 as u64, src_slot as u64],
            "lend recalled",
        );
        Ok(())
    }

    /// Borrower returns early; lender's slot goes back to OWNED.
    pub fn return_slot(
        &mut self,
        borrower: StrandId,
        slot: usize,
    ) -> Result<(), StrandError> {
        let borrowed = {
            let b = self.strand(borrower).ok_or(StrandError::NotFound)?;
            match b.slot(slot) {
                Some(CapSlot::Borrowed {
                    cap,
                    lender,
                    lender_slot,
                    ..
                }) => (*cap, *lender, *lender_slot),
                _ => return Err(StrandError::BadState),
            }
        };
        let (cap, lender, lender_slot) = borrowed;
        let b = self.strand_mut(borrower).ok_or(StrandError::NotFound)?;
        b.set_slot(slot, CapSlot::Empty)?;
        if let Some(l) = self.strand_mut(lender) {
            let _ = l.set_slot(lender_slot as usize, CapSlot::Owned(cap));
        }
        Ok(())
    }

    /// Scheduler pass: every borrow whose expiry has passed is cleared and
    /// its lender restored.
    pub fn process_lends(&mut self, _log: &VoidLog) {
        let now = self.now;
        let ids: Vec<StrandId> = (0..self.strands.len() as u32).map(StrandId).collect();
        for id in ids {
            let expired = match self.strand(id) {
                Some(s) => s.expired_borrows(now),
                None => continue,
            };
            for (slot, lender, lender_slot) in expired {
                if let Some(b) = self.strand_mut(id) {
                    let _ = b.set_slot(slot, CapSlot::Empty);
                }
                let restored = {
                    match self.strand(lender).and_then(|l| l.slot(lender_slot as usize)) {
                        Some(CapSlot::Lent { cap, .. }) => Some(*cap),
                        _ => None,
                    }
                };
                if let Some(cap) = restored {
                    if let Some(l) = self.strand_mut(lender) {
                        let _ = l.set_slot(lender_slot as usize, CapSlot::Owned(cap));
                    }
                }
            }
        }
    }

    // ───────────────────────────── mutexes ─────────────────────────────────────

    pub fn mutex_create(&mut self) -> MutexId {
        let id = MutexId(self.mutexes.len() as u32);
        self.mutexes.push(Some(KMutex::new(id)));
        id
    }

    /// Atomic holder swap. Contention blocks the caller unless the
    /// combined wait and join graph would close a cycle, in which case the
    /// call returns DEADLOCK and nobody blocks.
    pub fn mutex_acquire(
        &mut self,
        log: &VoidLog,
        caller: StrandId,
        mid: MutexId,
    ) -> Result<Option<Capability>, StrandError> {
        let holder = {
            let m = self.mutex(mid).ok_or(StrandError::NotFound)?;
            m.holder
        };
        match holder {
            None => {
                let m = self.mutex_mut(mid).ok_or(StrandError::NotFound)?;
                m.holder = Some(caller);
                Ok(Some(m.holder_cap()))
            }
            Some(h) if h == caller => Err(StrandError::BadState),
            Some(h) => {
                if self.wait_chain_reaches(h, caller) {
                    log.record(
                        VoidReason::Deadlock,
                        "realm.mutex_acquire",
                        [caller.0 as u64, mid.0 as u64],
                        "lock cycle",
                    );
                    return Err(StrandError::Deadlock);
                }
                let m = self.mutex_mut(mid).ok_or(StrandError::NotFound)?;
                m.waiters.push_back(caller);
                let strand = self.strand_mut(caller).ok_or(StrandError::NotFound)?;
                strand.state = StrandState::Blocked;
                strand.blocked_on = Some(mid);
                self.sched.remove(caller);
                if self.current == Some(caller) {
                    self.current = None;
                }
                Ok(None)
            }
        }
    }

    /// Only the current holder, proven by the capability minted at
    /// acquisition, may release. The head waiter inherits the lock.
    pub fn mutex_release(
        &mut self,
        log: &VoidLog,
        caller: StrandId,
        mid: MutexId,
        held: &Capability,
    ) -> Result<(), StrandError> {
        let next = {
            let m = self.mutex_mut(mid).ok_or(StrandError::NotFound)?;
            if m.holder != Some(caller) || !m.cap_matches(held) {
                log.record(
                    VoidReason::GenerationMismatch,
                    "realm.mutex_release",
                    [caller.0 as u64, mid.0 as u64],
                    "release without ownership proof",
                );
                return Err(StrandError::NoAuthority);
            }
            m.generation += 1;
            let next = m.waiters.pop_front();
            m.holder = next;
            next
        };
        if let Some(next) = next {
            if let Some(strand) = self.strand_mut(next) {
                strand.state = StrandState::Ready;
                strand.blocked_on = None;
                let priority = strand.priority;
                self.sched.enqueue(next, priority);
            }
        }
        Ok(())
    }

    /// Holder token for a strand that just inherited the lock.
    pub fn mutex_holder_cap(&self, mid: MutexId, holder: StrandId) -> Option<Capability> {
        let m = self.mutex(mid)?;
        (m.holder == Some(holder)).then(|| m.holder_cap())
    }
}

impl Default for Realm {
    fn default() -> Self {
        Realm::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::phys::testutil::TestRam;
    use crate::sovereign::{Authority, SovereignConfig};
    use crate::strand::CAP_TABLE_SIZE;
    use crate::void::Vbit;

    extern "C" fn nop_entry(_arg: u64) -> u32 {
        0
    }

    fn world() -> (TestRam, VoidLog, crate::memory::MemoryCore, Realm, SovereignId) {
        let ram = TestRam::new(256);
        let log = VoidLog::new();
        let mut mem = ram.core(&log);
        let mut realm = Realm::new();
        let root = realm
            .init_primordial(&mut mem, &log, 512 * 1024)
            .expect("primordial");
        (ram, log, mem, realm, root)
    }

    fn spawn_started(realm: &mut Realm, log: &VoidLog, owner: SovereignId) -> StrandId {
        let id = realm
            .strand_create(log, owner, nop_entry, 0, 8 * 1024, 16)
            .expect("strand");
        realm.strand_start(id).expect("start");
        id
    }

    #[test]
    fn lifecycle_nascent_ready_running_terminated() {
        let (_ram, log, _mem, mut realm, root) = world();
        let id = realm
            .strand_create(&log, root, nop_entry, 7, 8 * 1024, 16)
            .expect("strand");
        assert_eq!(realm.strand(id).map(|s| s.state), Some(StrandState::Nascent));
        // double start refused
        realm.strand_start(id).expect("start");
        assert_eq!(realm.strand_start(id), Err(StrandError::BadState));

        let picked = realm.dispatch(&log).expect("dispatch");
        assert_eq!(picked, id);
        assert_eq!(realm.strand(id).map(|s| s.state), Some(StrandState::Running));

        realm.strand_yield().expect("yield");
        assert_eq!(realm.strand(id).map(|s| s.state), Some(StrandState::Ready));
        assert_eq!(realm.dispatch(&log), Some(id));

        realm.strand_exit(id, 3).expect("exit");
        assert!(realm.strand(id).map(|s| s.is_terminal()).unwrap_or(false));
        assert_eq!(realm.join_result(id), Some(3));
    }

    #[test]
    fn join_wakes_on_exit() {
        let (_ram, log, _mem, mut realm, root) = world();
        let a = spawn_started(&mut realm, &log, root);
        let b = spawn_started(&mut realm, &log, root);

        assert_eq!(
            realm.strand_join(&log, a, b).expect("join"),
            JoinOutcome::Pending
        );
        assert_eq!(realm.strand(a).map(|s| s.state), Some(StrandState::Waiting));

        realm.strand_exit(b, 42).expect("exit");
        assert_eq!(realm.strand(a).map(|s| s.state), Some(StrandState::Ready));
        assert_eq!(realm.join_result(b), Some(42));

        // joining a terminated strand returns immediately
        assert_eq!(
            realm.strand_join(&log, a, b).expect("join"),
            JoinOutcome::Done(42)
        );
    }

    #[test]
    fn join_cycle_is_deadlock_and_nobody_blocks() {
        let (_ram, log, _mem, mut realm, root) = world();
        let a = spawn_started(&mut realm, &log, root);
        let b = spawn_started(&mut realm, &log, root);

        assert_eq!(
            realm.strand_join(&log, a, b).expect("join"),
            JoinOutcome::Pending
        );
        assert_eq!(realm.strand_join(&log, b, a), Err(StrandError::Deadlock));
        assert_ne!(realm.strand(b).map(|s| s.state), Some(StrandState::Waiting));
        assert!(log.has_reason(VoidReason::Deadlock));
        assert_eq!(realm.strand_join(&log, a, a), Err(StrandError::Deadlock));
    }

    #[test]
    fn mutex_contention_blocks_and_hands_off() {
        let (_ram, log, _mem, mut realm, root) = world();
        let a = spawn_started(&mut realm, &log, root);
        let b = spawn_started(&mut realm, &log, root);
        let m = realm.mutex_create();

        let cap = realm
            .mutex_acquire(&log, a, m)
            .expect("acquire")
            .expect("uncontended");
        // b contends and blocks
        assert_eq!(realm.mutex_acquire(&log, b, m).expect("acquire"), None);
        assert_eq!(realm.strand(b).map(|s| s.state), Some(StrandState::Blocked));

        // stale caps cannot release
        let mut stale = cap;
        stale.generation += 1;
        assert_eq!(
            realm.mutex_release(&log, a, m, &stale),
            Err(StrandError::NoAuthority)
        );

        realm.mutex_release(&log, a, m, &cap).expect("release");
        assert_eq!(realm.strand(b).map(|s| s.state), Some(StrandState::Ready));
        let cap_b = realm.mutex_holder_cap(m, b).expect("holder cap");
        realm.mutex_release(&log, b, m, &cap_b).expect("release");
        assert_eq!(realm.mutex(m).and_then(|m| m.holder), None);
    }

    #[test]
    fn crossed_mutexes_detect_deadlock() {
        // S2: A holds M1 and wants M2; B holds M2 and wants M1
        let (_ram, log, _mem, mut realm, root) = world();
        let a = spawn_started(&mut realm, &log, root);
        let b = spawn_started(&mut realm, &log, root);
        let m1 = realm.mutex_create();
        let m2 = realm.mutex_create();

        realm.mutex_acquire(&log, a, m1).expect("a m1");
        realm.mutex_acquire(&log, b, m2).expect("b m2");
        assert_eq!(realm.mutex_acquire(&log, a, m2).expect("a waits"), None);

        // the closing edge returns DEADLOCK; neither strand is blocked on it
        assert_eq!(realm.mutex_acquire(&log, b, m1), Err(StrandError::Deadlock));
        assert_ne!(realm.strand(b).map(|s| s.state), Some(StrandState::Blocked));
        assert!(log.has_reason(VoidReason::Deadlock));
    }

    #[test]
    fn grant_moves_lend_expires() {
        let (_ram, log, _mem, mut realm, root) = world();
        let a = spawn_started(&mut realm, &log, root);
        let b = spawn_started(&mut realm, &log, root);

        let cap = realm
            .cdt
            .mint(&log, 0x9000, 0x100, Rights::RW, CapTag::Raw)
            .expect("mint");
        realm
            .strand_mut(a)
            .expect("a")
            .cap_store(0, cap)
            .expect("store");

        // grant: source empties, destination owns
        realm.grant(a, 0, b, 1).expect("grant");
        assert_eq!(realm.strand(a).and_then(|s| s.cap_get(0, Chronon(0))), None);
        assert_eq!(
            realm.strand(b).and_then(|s| s.cap_get(1, Chronon(0))),
            Some(cap)
        );

        // grant back restores identical rights and bounds
        realm.grant(b, 1, a, 0).expect("grant back");
        let round = realm
            .strand(a)
            .and_then(|s| s.cap_get(0, Chronon(0)))
            .expect("cap");
        assert_eq!(round.base, cap.base);
        assert_eq!(round.len, cap.len);
        assert_eq!(round.rights, cap.rights);

        // lend with expiry: usable until the clock passes it
        realm.lend(a, 0, b, 2, 5).expect("lend");
        assert!(realm
            .strand(b)
            .and_then(|s| s.cap_get(2, realm.now))
            .is_some());
        for _ in 0..6 {
            realm.tick();
        }
        realm.process_lends(&log);
        assert!(matches!(
            realm.strand(b).and_then(|s| s.slot(2)),
            Some(CapSlot::Empty)
        ));
        assert!(matches!(
            realm.strand(a).and_then(|s| s.slot(0)),
            Some(CapSlot::Owned(_))
        ));
    }

    #[test]
    fn revoke_voids_borrower_return_restores_lender() {
        let (_ram, log, _mem, mut realm, root) = world();
        let a = spawn_started(&mut realm, &log, root);
        let b = spawn_started(&mut realm, &log, root);
        let cap = realm
            .cdt
            .mint(&log, 0xA000, 0x40, Rights::READ, CapTag::Raw)
            .expect("mint");
        realm
            .strand_mut(a)
            .expect("a")
            .cap_store(4, cap)
            .expect("store");

        realm.lend(a, 4, b, 7, 100).expect("lend");
        realm.revoke_slot(&log, a, 4).expect("revoke");
        assert!(matches!(
            realm.strand(b).and_then(|s| s.slot(7)),
            Some(CapSlot::Voided)
        ));
        assert_eq!(realm.strand(b).and_then(|s| s.cap_get(7, realm.now)), None);
        assert!(matches!(
            realm.strand(a).and_then(|s| s.slot(4)),
            Some(CapSlot::Owned(_))
        ));

        // early return path
        realm.lend(a, 4, b, 7, 100).expect("lend");
        realm.return_slot(b, 7).expect("return");
        assert!(matches!(
            realm.strand(a).and_then(|s| s.slot(4)),
            Some(CapSlot::Owned(_))
        ));
        assert!(matches!(
            realm.strand(b).and_then(|s| s.slot(7)),
            Some(CapSlot::Empty)
        ));
    }

    #[test]
    fn full_cap_table_reports_no_slot() {
        let (_ram, log, _mem, mut realm, root) = world();
        let a = spawn_started(&mut realm, &log, root);
        let cap = realm
            .cdt
            .mint(&log, 0, 0x10, Rights::READ, CapTag::Raw)
            .expect("mint");
        let strand = realm.strand_mut(a).expect("a");
        for slot in 0..CAP_TABLE_SIZE {
            strand.cap_store(slot, cap).expect("store");
        }
        assert_eq!(strand.cap_find_slot(), None);
    }

    #[test]
    fn stack_violation_terminates_on_dispatch() {
        let (_ram, log, _mem, mut realm, root) = world();
        let id = spawn_started(&mut realm, &log, root);
        realm.strand_mut(id).expect("strand").stack.sp = 0x1; // below base
        assert_eq!(realm.dispatch(&log), None);
        let s = realm.strand(id).expect("strand");
        assert!(s.is_terminal());
        assert_eq!(s.exit_code, Some(EXIT_STACK_VIOLATION));
    }

    #[test]
    fn conceive_respects_authority_subset() {
        let (_ram, log, mut mem, mut realm, root) = world();

        // cannot mint authority the parent lacks
        let child = realm.conceive(
            &mut mem,
            &log,
            root,
            SovereignConfig {
                authority: Authority::all(),
                memory_limit: 64 * 1024,
                priority: 16,
            },
        );
        assert!(child.is_ok(), "primordial holds full authority");

        let limited = realm
            .conceive(
                &mut mem,
                &log,
                child.expect("child"),
                SovereignConfig {
                    authority: Authority::SPAWN,
                    memory_limit: 32 * 1024,
                    priority: 16,
                },
            )
            .expect("grandchild");
        let g = realm.sovereign(limited).expect("sovereign");
        assert_eq!(g.authority, Authority::SPAWN);
        assert_eq!(
            g.authority.bits() & !realm.sovereign(root).expect("root").authority.bits(),
            0
        );
    }

    #[test]
    fn cdt_checks_flow_through_realm() {
        let (_ram, log, _mem, mut realm, _root) = world();
        let cap = realm
            .cdt
            .mint(&log, 0, 0x10, Rights::READ | Rights::REVOKE, CapTag::Raw)
            .expect("mint");
        assert_eq!(realm.cdt.check(&log, &cap, Rights::READ), Vbit::True);
        realm.cdt.revoke(&log, &cap).expect("revoke");
        assert_eq!(realm.cdt.check(&log, &cap, Rights::READ), Vbit::Void);
    }
}
