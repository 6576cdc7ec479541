//! Halcyon Sovereigns
//!
//! A sovereign is a process: the owner of strands, of three arenas
//! (primary, code, scratch) and of an authority mask that bounds every
//! privilege it can exercise or delegate. Children never exceed their
//! parent's authority. The Primordial sovereign is minted once at boot
//! with full authority, has a VOID parent and cannot exit.

use arrayvec::ArrayVec;
use core::ptr::NonNull;

use crate::capabilities::Capability;
use crate::memory::arena::{Arena, ArenaFlags};
use crate::memory::MemoryCore;
use crate::realm::Realm;
use crate::strand::context::EntryFn;
use crate::strand::StrandId;
use crate::time::Chronon;
use crate::void::{VoidLog, VoidReason, VOID_U32};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Authority: u64 {
        const SPAWN   = 1 << 0;
        const KILL    = 1 << 1;
        const SUSPEND = 1 << 2;
        const GRANT   = 1 << 3;
        const REVOKE  = 1 << 4;
        const ATLAS   = 1 << 5;
        const AETHER  = 1 << 6;
        const MEMORY  = 1 << 7;
        const SCHED   = 1 << 8;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct SovereignId(pub u32);

impl SovereignId {
    pub const VOID: SovereignId = SovereignId(u32::MAX);

    #[inline]
    pub fn is_void(self) -> bool {
        self == SovereignId::VOID
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SovereignState {
    Nascent = 0,
    Running = 1,
    Waiting = 2,
    Suspended = 3,
    Exiting = 4,
    Killed = 5,
    Void = 6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SovereignError {
    NotFound,
    NoAuthority,
    AuthorityEscalation,
    BadState,
    NotAChild,
    Primordial,
    NoMemory,
    PoolExhausted,
    CodeTooLarge,
}

impl core::fmt::Display for SovereignError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SovereignConfig {
    pub authority: Authority,
    pub memory_limit: usize,
    pub priority: u8,
}

/// Result of polling a child's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Exited(u32),
    Pending,
}

pub const SOVEREIGN_CAP_SLOTS: usize = 64;
pub const MIN_MEMORY_LIMIT: usize = 16 * 1024;
const DEFAULT_MAIN_STACK: usize = 32 * 1024;

/// The three arenas every sovereign owns. Taken (None) once freed.
pub struct SovereignArenas {
    pub primary: Option<Arena>,
    pub code: Option<Arena>,
    pub scratch: Option<Arena>,
}

pub struct Sovereign {
    pub id: SovereignId,
    pub parent: SovereignId,
    pub authority: Authority,
    pub state: SovereignState,
    pub cap_table: ArrayVec<Capability, SOVEREIGN_CAP_SLOTS>,
    pub children: ArrayVec<SovereignId, 32>,
    pub strands: alloc::vec::Vec<StrandId>,
    pub arenas: SovereignArenas,
    pub memory_limit: usize,
    pub memory_used: usize,
    pub birth: Chronon,
    pub exit_code: u32,
    pub code_base: Option<NonNull<u8>>,
    pub code_len: usize,
    pub load_addr: u64,
}

// The code-arena pointer is only touched under the kernel lock.
unsafe impl Send for Sovereign {}

impl Sovereign {
    pub fn is_primordial(&self) -> bool {
        self.parent.is_void()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            SovereignState::Killed | SovereignState::Void | SovereignState::Exiting
        )
    }
}

// arena carving ratios out of the configured memory limit
fn arena_split(limit: usize) -> (usize, usize, usize) {
    let primary = limit / 2;
    let code = limit / 4;
    (primary, code, limit - primary - code)
}

impl Realm {
    fn build_sovereign(
        &mut self,
        mem: &mut MemoryCore,
        log: &VoidLog,
        parent: SovereignId,
        authority: Authority,
        memory_limit: usize,
    ) -> Result<SovereignId, SovereignError> {
        let (primary_sz, code_sz, scratch_sz) = arena_split(memory_limit);
        let primary = mem
            .arena_create(log, primary_sz, ArenaFlags::empty())
            .ok_or(SovereignError::NoMemory)?;
        let code = mem
            .arena_create(log, code_sz, ArenaFlags::ZERO_ON_ALLOC)
            .ok_or(SovereignError::NoMemory)?;
        let scratch = mem
            .arena_create(log, scratch_sz, ArenaFlags::empty())
            .ok_or(SovereignError::NoMemory)?;

        let id = SovereignId(self.sovereigns.len() as u32);
        self.sovereigns.push(Some(Sovereign {
            id,
            parent,
            authority,
            state: SovereignState::Nascent,
            cap_table: ArrayVec::new(),
            children: ArrayVec::new(),
            strands: alloc::vec::Vec::new(),
            arenas: SovereignArenas {
                primary: Some(primary),
                code: Some(code),
                scratch: Some(scratch),
            },
            memory_limit,
            memory_used: 0,
            birth: self.now,
            exit_code: VOID_U32,
            code_base: None,
            code_len: 0,
            load_addr: 0,
        }));
        Ok(id)
    }

    /// Boot-time root: full authority, VOID parent, immediately RUNNING.
    pub fn init_primordial(
        &mut self,
        mem: &mut MemoryCore,
        log: &VoidLog,
        memory_limit: usize,
    ) -> Result<SovereignId, SovereignError> {
        if self.sovereigns.iter().any(|s| {
            s.as_ref()
                .map(|sov| sov.is_primordial() && !matches!(sov.state, SovereignState::Void))
                .unwrap_or(false)
        }) {
            return Err(SovereignError::BadState);
        }
        let id = self.build_sovereign(mem, log, SovereignId::VOID, Authority::all(), memory_limit)?;
        if let Some(sov) = self.sovereign_mut(id) {
            sov.state = SovereignState::Running;
        }
        log::info!("primordial sovereign {:?} online", id);
        Ok(id)
    }

    /// Child creation: SPAWN authority plus the subset rule
    /// `config.authority ⊆ parent.authority`.
    pub fn conceive(
        &mut self,
        mem: &mut MemoryCore,
        log: &VoidLog,
        parent: SovereignId,
        config: SovereignConfig,
    ) -> Result<SovereignId, SovereignError> {
        let parent_authority = {
            let p = self.sovereign(parent).ok_or(SovereignError::NotFound)?;
            if p.is_terminal() {
                return Err(SovereignError::BadState);
            }
            p.authority
        };
        if !parent_authority.contains(Authority::SPAWN) {
            return Err(SovereignError::NoAuthority);
        }
        if !parent_authority.contains(config.authority) {
            log.record(
                VoidReason::StateViolation,
                "sovereign.conceive",
                [config.authority.bits(), parent_authority.bits()],
                "authority escalation refused",
            );
            return Err(SovereignError::AuthorityEscalation);
        }
        if config.memory_limit < MIN_MEMORY_LIMIT {
            return Err(SovereignError::NoMemory);
        }
        let id = self.build_sovereign(mem, log, parent, config.authority, config.memory_limit)?;
        if let Some(p) = self.sovereign_mut(parent) {
            let _ = p.children.try_push(id);
        }
        Ok(id)
    }

    /// Seed a NASCENT child's capability table. The transfer flag removes
    /// the token from the parent's table.
    pub fn grant_cap(
        &mut self,
        log: &VoidLog,
        parent: SovereignId,
        child: SovereignId,
        cap: Capability,
        transfer: bool,
    ) -> Result<(), SovereignError> {
        {
            let p = self.sovereign(parent).ok_or(SovereignError::NotFound)?;
            if !p.authority.contains(Authority::GRANT) {
                return Err(SovereignError::NoAuthority);
            }
        }
        {
            let c = self.sovereign(child).ok_or(SovereignError::NotFound)?;
            if c.parent != parent {
                return Err(SovereignError::NotAChild);
            }
            if c.state != SovereignState::Nascent {
                return Err(SovereignError::BadState);
            }
        }
        if transfer {
            let p = self.sovereign_mut(parent).ok_or(SovereignError::NotFound)?;
            if let Some(pos) = p.cap_table.iter().position(|c| *c == cap) {
                p.cap_table.remove(pos);
            }
        }
        let c = self.sovereign_mut(child).ok_or(SovereignError::NotFound)?;
        if c.cap_table.try_push(cap).is_err() {
            log.record(
                VoidReason::PoolExhausted,
                "sovereign.grant_cap",
                [child.0 as u64, SOVEREIGN_CAP_SLOTS as u64],
                "sovereign cap table full",
            );
            return Err(SovereignError::PoolExhausted);
        }
        Ok(())
    }

    /// Copy a code image into the child's code arena.
    pub fn load_code(
        &mut self,
        child: SovereignId,
        image: &[u8],
        load_addr: u64,
    ) -> Result<(), SovereignError> {
        let c = self.sovereign_mut(child).ok_or(SovereignError::NotFound)?;
        if c.state != SovereignState::Nascent {
            return Err(SovereignError::BadState);
        }
        let code = c.arenas.code.as_mut().ok_or(SovereignError::BadState)?;
        let dst = code
            .alloc(image.len(), 16)
            .ok_or(SovereignError::CodeTooLarge)?;
        // SAFETY: dst points at image.len() freshly carved arena bytes
        unsafe {
            core::ptr::copy_nonoverlapping(image.as_ptr(), dst.as_ptr(), image.len());
        }
        c.memory_used += image.len();
        c.code_base = Some(dst);
        c.code_len = image.len();
        c.load_addr = load_addr;
        Ok(())
    }

    /// NASCENT → RUNNING: build the main strand over `entry` and enqueue
    /// it.
    pub fn vivify(
        &mut self,
        log: &VoidLog,
        child: SovereignId,
        entry: EntryFn,
        arg: u64,
    ) -> Result<StrandId, SovereignError> {
        let priority = {
            let c = self.sovereign(child).ok_or(SovereignError::NotFound)?;
            if c.state != SovereignState::Nascent {
                return Err(SovereignError::BadState);
            }
            crate::sched::DEFAULT_PRIORITY
        };
        let main = self
            .strand_create(log, child, entry, arg, DEFAULT_MAIN_STACK, priority)
            .map_err(|_| SovereignError::NoMemory)?;
        self.strand_start(main).map_err(|_| SovereignError::BadState)?;
        if let Some(c) = self.sovereign_mut(child) {
            c.state = SovereignState::Running;
        }
        Ok(main)
    }

    /// KILL authority, parentage, and never the Primordial. Strands
    /// terminate with the VOID exit code, arenas return to the frame pool,
    /// the slot ends VOID.
    pub fn kill(
        &mut self,
        mem: &mut MemoryCore,
        log: &VoidLog,
        killer: SovereignId,
        victim: SovereignId,
    ) -> Result<(), SovereignError> {
        {
            let k = self.sovereign(killer).ok_or(SovereignError::NotFound)?;
            if !k.authority.contains(Authority::KILL) {
                return Err(SovereignError::NoAuthority);
            }
        }
        {
            let v = self.sovereign(victim).ok_or(SovereignError::NotFound)?;
            if v.is_primordial() {
                return Err(SovereignError::Primordial);
            }
            if v.parent != killer {
                return Err(SovereignError::NotAChild);
            }
            if matches!(v.state, SovereignState::Void) {
                return Err(SovereignError::BadState);
            }
        }
        if let Some(v) = self.sovereign_mut(victim) {
            v.state = SovereignState::Killed;
        }
        self.reap(mem, log, victim, VOID_U32);
        Ok(())
    }

    /// Poll a child's lifecycle. Terminal children report their exit code;
    /// a VOID timeout means poll-once.
    pub fn sovereign_wait(
        &self,
        parent: SovereignId,
        child: SovereignId,
    ) -> Result<WaitOutcome, SovereignError> {
        let c = self.sovereign(child).ok_or(SovereignError::NotFound)?;
        if c.parent != parent {
            return Err(SovereignError::NotAChild);
        }
        if c.is_terminal() {
            Ok(WaitOutcome::Exited(c.exit_code))
        } else {
            Ok(WaitOutcome::Pending)
        }
    }

    /// SUSPEND authority; pulls the target's ready strands off the queues.
    pub fn suspend(
        &mut self,
        actor: SovereignId,
        target: SovereignId,
    ) -> Result<(), SovereignError> {
        self.gate_suspend(actor, target)?;
        let strands = {
            let t = self.sovereign_mut(target).ok_or(SovereignError::NotFound)?;
            if t.state != SovereignState::Running {
                return Err(SovereignError::BadState);
            }
            t.state = SovereignState::Suspended;
            t.strands.clone()
        };
        for sid in strands {
            self.sched.remove(sid);
        }
        Ok(())
    }

    /// Inverse of `suspend`: ready strands go back on the queues.
    pub fn resume(
        &mut self,
        actor: SovereignId,
        target: SovereignId,
    ) -> Result<(), SovereignError> {
        self.gate_suspend(actor, target)?;
        let strands = {
            let t = self.sovereign_mut(target).ok_or(SovereignError::NotFound)?;
            if t.state != SovereignState::Suspended {
                return Err(SovereignError::BadState);
            }
            t.state = SovereignState::Running;
            t.strands.clone()
        };
        for sid in strands {
            let ready = self
                .strand(sid)
                .map(|s| s.state == crate::strand::StrandState::Ready)
                .unwrap_or(false);
            if ready && !self.sched.contains(sid) {
                if let Some(priority) = self.strand(sid).map(|s| s.priority) {
                    self.sched.enqueue(sid, priority);
                }
            }
        }
        Ok(())
    }

    fn gate_suspend(
        &self,
        actor: SovereignId,
        target: SovereignId,
    ) -> Result<(), SovereignError> {
        let a = self.sovereign(actor).ok_or(SovereignError::NotFound)?;
        if !a.authority.contains(Authority::SUSPEND) {
            return Err(SovereignError::NoAuthority);
        }
        let t = self.sovereign(target).ok_or(SovereignError::NotFound)?;
        if t.parent != actor && actor != target {
            return Err(SovereignError::NotAChild);
        }
        Ok(())
    }

    /// Voluntary exit. A no-op for the Primordial.
    pub fn sovereign_exit(
        &mut self,
        mem: &mut MemoryCore,
        log: &VoidLog,
        id: SovereignId,
        code: u32,
    ) -> Result<(), SovereignError> {
        {
            let s = self.sovereign(id).ok_or(SovereignError::NotFound)?;
            if s.is_primordial() {
                return Ok(());
            }
            if s.is_terminal() {
                return Err(SovereignError::BadState);
            }
        }
        if let Some(s) = self.sovereign_mut(id) {
            s.state = SovereignState::Exiting;
        }
        self.reap(mem, log, id, code);
        Ok(())
    }

    /// Shared teardown: terminate strands, release arenas, land in VOID.
    fn reap(&mut self, mem: &mut MemoryCore, log: &VoidLog, id: SovereignId, code: u32) {
        let strands = self
            .sovereign(id)
            .map(|s| s.strands.clone())
            .unwrap_or_default();
        for sid in strands {
            let _ = self.strand_exit(sid, code);
        }
        if let Some(s) = self.sovereign_mut(id) {
            s.exit_code = code;
        }
        let arenas = self.sovereign_mut(id).map(|s| {
            (
                s.arenas.primary.take(),
                s.arenas.code.take(),
                s.arenas.scratch.take(),
            )
        });
        if let Some((primary, code_arena, scratch)) = arenas {
            for arena in [primary, code_arena, scratch].into_iter().flatten() {
                mem.arena_destroy(log, arena);
            }
        }
        if let Some(s) = self.sovereign_mut(id) {
            s.state = SovereignState::Void;
        }
    }
}
