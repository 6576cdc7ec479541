//! Halcyon VOID Algebra
//!
//! Canonical absence values for every unsigned width, the ternary boolean
//! `Vbit`, and the bounded post-mortem record ring. Any arithmetic or lookup
//! whose input or result is unrepresentable yields the width-appropriate
//! VOID and appends a record; nothing in the core traps on these paths.

use arrayvec::ArrayVec;
use spin::Mutex;

/// All-ones sentinels, one per unsigned width.
pub const VOID_U8: u8 = u8::MAX;
pub const VOID_U16: u16 = u16::MAX;
pub const VOID_U32: u32 = u32::MAX;
pub const VOID_U64: u64 = u64::MAX;

/// Tagged non-null sentinel for address-valued fields and wire slots.
/// Distinguishable from both null and any mappable canonical address.
pub const VOID_ADDR: u64 = 0xFFFF_FFFF_FFFF_FFF0;

#[inline]
pub fn is_void_u8(x: u8) -> bool {
    x == VOID_U8
}
#[inline]
pub fn is_void_u16(x: u16) -> bool {
    x == VOID_U16
}
#[inline]
pub fn is_void_u32(x: u32) -> bool {
    x == VOID_U32
}
#[inline]
pub fn is_void_u64(x: u64) -> bool {
    x == VOID_U64
}
#[inline]
pub fn is_void_addr(x: u64) -> bool {
    x == VOID_ADDR
}

// ───────────────────────────── Ternary boolean ────────────────────────────────

/// Three-valued boolean. Identities: `Void & x = Void`, `Void | True = True`,
/// `!Void = Void`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Vbit {
    False = 0,
    True = 1,
    Void = 2,
}

impl Vbit {
    #[inline]
    pub fn and(self, rhs: Vbit) -> Vbit {
        match (self, rhs) {
            (Vbit::Void, _) | (_, Vbit::Void) => Vbit::Void,
            (Vbit::True, Vbit::True) => Vbit::True,
            _ => Vbit::False,
        }
    }

    #[inline]
    pub fn or(self, rhs: Vbit) -> Vbit {
        match (self, rhs) {
            (Vbit::True, _) | (_, Vbit::True) => Vbit::True,
            (Vbit::Void, _) | (_, Vbit::Void) => Vbit::Void,
            _ => Vbit::False,
        }
    }

    #[inline]
    pub fn not(self) -> Vbit {
        match self {
            Vbit::True => Vbit::False,
            Vbit::False => Vbit::True,
            Vbit::Void => Vbit::Void,
        }
    }

    #[inline]
    pub fn is_true(self) -> bool {
        self == Vbit::True
    }

    #[inline]
    pub fn is_void(self) -> bool {
        self == Vbit::Void
    }
}

impl From<bool> for Vbit {
    #[inline]
    fn from(b: bool) -> Vbit {
        if b {
            Vbit::True
        } else {
            Vbit::False
        }
    }
}

impl core::ops::BitAnd for Vbit {
    type Output = Vbit;
    fn bitand(self, rhs: Vbit) -> Vbit {
        self.and(rhs)
    }
}

impl core::ops::BitOr for Vbit {
    type Output = Vbit;
    fn bitor(self, rhs: Vbit) -> Vbit {
        self.or(rhs)
    }
}

impl core::ops::Not for Vbit {
    type Output = Vbit;
    fn not(self) -> Vbit {
        Vbit::not(self)
    }
}

// ───────────────────────────── Record ring ─────────────────────────────────────

/// Why a VOID was produced. Indexes the per-reason counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VoidReason {
    Overflow = 0,
    DivideByZero = 1,
    LookupMiss = 2,
    GenerationMismatch = 3,
    Revoked = 4,
    OutOfRange = 5,
    PoolExhausted = 6,
    Malformed = 7,
    Deadlock = 8,
    OutOfMemory = 9,
    StateViolation = 10,
    Propagated = 11,
}

pub const VOID_REASON_COUNT: usize = 12;

/// One post-mortem entry: what failed, where, and an operand snapshot.
#[derive(Debug, Clone, Copy)]
pub struct VoidRecord {
    pub reason: VoidReason,
    pub site: &'static str,
    pub operands: [u64; 2],
    pub note: &'static str,
    pub seq: u64,
}

pub const VOID_LOG_CAP: usize = 256;

struct LogInner {
    ring: ArrayVec<VoidRecord, VOID_LOG_CAP>,
    head: usize,
    next_seq: u64,
    counts: [u32; VOID_REASON_COUNT],
}

/// Bounded record ring; oldest entries are overwritten once full.
/// Updates are serialized by the internal lock, reads take snapshots.
pub struct VoidLog {
    inner: Mutex<LogInner>,
}

impl VoidLog {
    pub fn new() -> Self {
        VoidLog {
            inner: Mutex::new(LogInner {
                ring: ArrayVec::new(),
                head: 0,
                next_seq: 0,
                counts: [0; VOID_REASON_COUNT],
            }),
        }
    }

    /// Append a record. Never fails; the ring wraps.
    pub fn record(
        &self,
        reason: VoidReason,
        site: &'static str,
        operands: [u64; 2],
        note: &'static str,
    ) {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.counts[reason as usize] += 1;
        let rec = VoidRecord {
            reason,
            site,
            operands,
            note,
            seq,
        };
        if inner.ring.is_full() {
            let head = inner.head;
            inner.ring[head] = rec;
            inner.head = (head + 1) % VOID_LOG_CAP;
        } else {
            inner.ring.push(rec);
        }
        log::debug!("void: {:?} at {} {:x?}", reason, site, operands);
    }

    /// Total records ever produced (including overwritten ones).
    pub fn total(&self) -> u64 {
        self.inner.lock().next_seq
    }

    pub fn count(&self, reason: VoidReason) -> u32 {
        self.inner.lock().counts[reason as usize]
    }

    pub fn has_reason(&self, reason: VoidReason) -> bool {
        self.count(reason) > 0
    }

    /// Snapshot of the most recent `n` records, newest last.
    pub fn recent(&self, n: usize) -> alloc::vec::Vec<VoidRecord> {
        let inner = self.inner.lock();
        let len = inner.ring.len();
        let take = n.min(len);
        let mut out = alloc::vec::Vec::with_capacity(take);
        for i in (len - take)..len {
            let idx = (inner.head + i) % len.max(1);
            out.push(inner.ring[idx]);
        }
        out.sort_by_key(|r| r.seq);
        out
    }
}

impl Default for VoidLog {
    fn default() -> Self {
        VoidLog::new()
    }
}

// ───────────────────────────── Checked arithmetic ──────────────────────────────

/// u64 addition under VOID propagation.
pub fn vadd(log: &VoidLog, site: &'static str, a: u64, b: u64) -> u64 {
    if is_void_u64(a) || is_void_u64(b) {
        log.record(VoidReason::Propagated, site, [a, b], "add on void operand");
        return VOID_U64;
    }
    match a.checked_add(b) {
        // the sum may itself land on the sentinel
        Some(v) if !is_void_u64(v) => v,
        _ => {
            log.record(VoidReason::Overflow, site, [a, b], "add overflow");
            VOID_U64
        }
    }
}

pub fn vsub(log: &VoidLog, site: &'static str, a: u64, b: u64) -> u64 {
    if is_void_u64(a) || is_void_u64(b) {
        log.record(VoidReason::Propagated, site, [a, b], "sub on void operand");
        return VOID_U64;
    }
    match a.checked_sub(b) {
        Some(v) => v,
        None => {
            log.record(VoidReason::Overflow, site, [a, b], "sub underflow");
            VOID_U64
        }
    }
}

pub fn vmul(log: &VoidLog, site: &'static str, a: u64, b: u64) -> u64 {
    if is_void_u64(a) || is_void_u64(b) {
        log.record(VoidReason::Propagated, site, [a, b], "mul on void operand");
        return VOID_U64;
    }
    match a.checked_mul(b) {
        Some(v) if !is_void_u64(v) => v,
        _ => {
            log.record(VoidReason::Overflow, site, [a, b], "mul overflow");
            VOID_U64
        }
    }
}

/// Division returns VOID on a zero divisor, it does not trap.
pub fn vdiv(log: &VoidLog, site: &'static str, a: u64, b: u64) -> u64 {
    if is_void_u64(a) || is_void_u64(b) {
        log.record(VoidReason::Propagated, site, [a, b], "div on void operand");
        return VOID_U64;
    }
    if b == 0 {
        log.record(VoidReason::DivideByZero, site, [a, b], "divide by zero");
        return VOID_U64;
    }
    a / b
}
