//! End-to-end scenarios across subsystem boundaries: the slab round
//! trip, deadlock detection, optimistic commit conflicts, causal
//! snapshot restore, frame validation and cyclic-list auto-recovery.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

use halcyon_kernel::aether::frame::{encode_frame, FrameFlags, FrameHeader, MsgType, ETH_HEADER_LEN};
use halcyon_kernel::aether::security::{AetherSecurity, NodePerms, Reject};
use halcyon_kernel::atlas::backend::MemBackend;
use halcyon_kernel::atlas::checkpoint::{Invariant, InvariantVerdict, ValidationReport};
use halcyon_kernel::atlas::Atlas;
use halcyon_kernel::capabilities::Rights;
use halcyon_kernel::memory::kmalloc::KernelHeap;
use halcyon_kernel::memory::layout::PAGE_SIZE;
use halcyon_kernel::memory::phys::PhysMemory;
use halcyon_kernel::memory::MemoryCore;
use halcyon_kernel::realm::Realm;
use halcyon_kernel::sovereign::SovereignId;
use halcyon_kernel::strand::{StrandError, StrandState};
use halcyon_kernel::void::{Vbit, VoidLog, VoidReason};
use halcyon_kernel::Core;

/// Page-aligned backing region standing in for physical RAM.
struct Ram {
    ptr: NonNull<u8>,
    layout: Layout,
    len: usize,
}

impl Ram {
    fn new(pages: usize) -> Ram {
        let len = pages * PAGE_SIZE;
        let layout = Layout::from_size_align(len, PAGE_SIZE).expect("layout");
        let raw = unsafe { alloc_zeroed(layout) };
        Ram {
            ptr: NonNull::new(raw).expect("ram"),
            layout,
            len,
        }
    }

    fn phys(&self) -> PhysMemory {
        unsafe { PhysMemory::new(self.ptr, 0x10_0000, self.len) }
    }

    fn core(&self, log: &VoidLog) -> MemoryCore {
        unsafe { MemoryCore::new(self.ptr, 0x10_0000, self.len, log) }.expect("memory core")
    }
}

impl Drop for Ram {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

extern "C" fn nop_entry(_arg: u64) -> u32 {
    0
}

fn spawn_started(realm: &mut Realm, log: &VoidLog, owner: SovereignId) -> halcyon_kernel::strand::StrandId {
    let id = realm
        .strand_create(log, owner, nop_entry, 0, 8 * 1024, 16)
        .expect("strand");
    realm.strand_start(id).expect("start");
    id
}

// ───────────────────────────── S1: slab round trip ─────────────────────────────

#[test]
fn s1_slab_roundtrip() {
    let ram = Ram::new(64);
    let mut phys = ram.phys();
    let mut heap = KernelHeap::new();
    let log = VoidLog::new();

    let p = heap.kmalloc(&mut phys, &log, 48).expect("kmalloc");
    assert_eq!(heap.usable_size(p), 64, "48 bytes land in the 64-byte class");

    heap.kfree(&mut phys, &log, p);
    let q = heap.kmalloc(&mut phys, &log, 48).expect("kmalloc");
    assert_eq!(q, p, "LIFO reuse within the slab");

    assert_eq!(heap.stats.slab_allocations, 2);
    assert_eq!(heap.stats.slab_frees, 1);
    assert!(heap.check_invariants(&log));
}

// ───────────────────────────── S2: deadlock detection ──────────────────────────

#[test]
fn s2_crossed_mutexes_deadlock() {
    let ram = Ram::new(256);
    let log = VoidLog::new();
    let mut mem = ram.core(&log);
    let mut realm = Realm::new();
    let root = realm
        .init_primordial(&mut mem, &log, 512 * 1024)
        .expect("primordial");

    let a = spawn_started(&mut realm, &log, root);
    let b = spawn_started(&mut realm, &log, root);
    let m1 = realm.mutex_create();
    let m2 = realm.mutex_create();

    // A takes M1, B takes M2
    realm.mutex_acquire(&log, a, m1).expect("a m1").expect("uncontended");
    realm.mutex_acquire(&log, b, m2).expect("b m2").expect("uncontended");

    // A waits on M2
    assert_eq!(realm.mutex_acquire(&log, a, m2).expect("a waits"), None);
    assert_eq!(realm.strand(a).map(|s| s.state), Some(StrandState::Blocked));

    // B closing the cycle gets DEADLOCK; nobody new blocks
    assert_eq!(realm.mutex_acquire(&log, b, m1), Err(StrandError::Deadlock));
    assert_ne!(realm.strand(b).map(|s| s.state), Some(StrandState::Blocked));
    assert!(log.has_reason(VoidReason::Deadlock));
}

// ───────────────────────── S3: optimistic commit conflict ──────────────────────

#[test]
fn s3_first_committer_wins() {
    let log = VoidLog::new();
    let mut atlas = Atlas::init(Box::new(MemBackend::new()), 64 * PAGE_SIZE, 0, &log)
        .expect("atlas");
    let g = atlas.generation();

    let t1 = atlas.tx_begin(&log).expect("t1");
    let t2 = atlas.tx_begin(&log).expect("t2");

    let off = atlas.alloc(32, &log);
    assert!(atlas.tx_mark_dirty(t1, off, 32));
    assert!(atlas.tx_commit(t1, &log));
    assert_eq!(atlas.generation(), g + 1);

    assert!(!atlas.tx_commit(t2, &log), "second committer loses");
    assert_eq!(atlas.abort_count(), 1);
    assert_eq!(atlas.generation(), g + 1);
}

// ───────────────────────── S4: causal snapshot restore ─────────────────────────

#[test]
fn s4_snapshot_restore_returns_the_pattern() {
    let log = VoidLog::new();
    let mut atlas = Atlas::init(Box::new(MemBackend::new()), 64 * PAGE_SIZE, 0, &log)
        .expect("atlas");
    let page = atlas.alloc_pages(PAGE_SIZE as u64, &log);

    let v0 = atlas.vclock;
    let snap = atlas.snapshot_begin(Some(&v0), &log).expect("begin");
    assert_eq!(atlas.snapshot_include_all(snap, &log), Vbit::True);
    assert_eq!(atlas.snapshot_activate(snap, &log), Vbit::True);

    atlas.bytes_mut(page, PAGE_SIZE).expect("bytes").fill(0xAB);
    assert_eq!(atlas.snapshot_cow_page(snap, page, &log), Vbit::True);
    assert_eq!(atlas.snapshot_commit(snap, &log), Vbit::True);

    atlas.bytes_mut(page, PAGE_SIZE).expect("bytes").fill(0xCD);
    let clock_after_overwrite = atlas.vclock;

    assert_eq!(atlas.snapshot_restore(snap, &log), Vbit::True);
    assert!(
        atlas
            .bytes(page, PAGE_SIZE)
            .expect("bytes")
            .iter()
            .all(|&b| b == 0xAB),
        "restored page carries the captured pattern"
    );
    // componentwise at least both clocks, strictly greater locally
    for node in 0..halcyon_kernel::time::MAX_NODES {
        assert!(atlas.vclock.get(node) >= v0.get(node));
        assert!(atlas.vclock.get(node) >= clock_after_overwrite.get(node));
    }
    assert!(atlas.vclock.get(0) > clock_after_overwrite.get(0));
}

// ───────────────────────── S5: aether frame validation ─────────────────────────

#[test]
fn s5_frame_validation_pipeline() {
    const KEY: [u8; 32] = [0x3C; 32];
    let mut security = AetherSecurity::new();
    security.set_key(3, KEY);
    security.set_perms(3, NodePerms::READ | NodePerms::WRITE);
    let log = VoidLog::new();

    let header = FrameHeader {
        msg_type: MsgType::PageRequest,
        flags: FrameFlags::WRITE,
        seq: 7,
        src_node: 3,
        dst_node: 0,
        offset: 0x6000,
        data_len: 8,
        generation: 1,
    };
    let full = encode_frame([0xFF; 6], [0x02; 6], &header, b"payload!", &KEY);
    let aether = &full[ETH_HEADER_LEN..];

    // accepted: window bit 0 set, last_seq lands on 7
    let accepted = security.validate(&log, aether, 1).expect("accept");
    assert_eq!(accepted.header.seq, 7);
    let node = security.node(3).expect("node");
    assert_eq!(node.last_seq, 7);
    assert_eq!(node.window & 1, 1);

    // identical frame is a replay
    assert_eq!(security.validate(&log, aether, 2), Err(Reject::Duplicate));

    // flipping any payload byte fails the MAC, not the replay gate
    for i in 0..8 {
        let mut tampered = full.clone();
        tampered[ETH_HEADER_LEN + 40 + i] ^= 0x01;
        assert_eq!(
            security.validate(&log, &tampered[ETH_HEADER_LEN..], 3),
            Err(Reject::HmacFail)
        );
    }
}

// ───────────────────────── S6: cyclic list auto-recovery ───────────────────────

#[test]
fn s6_cycle_detected_and_broken() {
    let core = Core::new();
    let log = VoidLog::new();
    let mut atlas = Atlas::init(Box::new(MemBackend::new()), 64 * PAGE_SIZE, 0, &log)
        .expect("atlas");

    let ty = {
        let mut types = core.types.lock();
        let ty = types.register("cyclic_node", 16).expect("type");
        assert!(types.add_invariant(ty, Invariant::NoCycle { next_offset: 8 }));
        ty
    };

    // four nodes, next pointer at offset 8, last one closes the cycle
    let nodes: Vec<u64> = (0..4).map(|_| atlas.alloc(16, &core.void)).collect();
    for pair in nodes.windows(2) {
        assert!(atlas.write_u64(pair[0] + 8, pair[1]));
    }
    assert!(atlas.write_u64(nodes[3] + 8, nodes[0]));

    let cp = atlas.checkpoint_create(&core, "lists", 4).expect("checkpoint");
    assert_eq!(
        atlas.checkpoint_add_entry(&core, cp, nodes[0], ty, 16),
        Vbit::True
    );

    let mut report = ValidationReport::default();
    atlas.checkpoint_validate(&core, cp, &mut report);
    assert_eq!(report.violations, 1);
    assert_eq!(
        report.failures.first().map(|f| f.1),
        Some(InvariantVerdict::CycleDetected)
    );

    let mut recovery = ValidationReport::default();
    atlas.checkpoint_recover(&core, cp, &mut recovery);
    assert!(recovery.clean(), "re-validation passes after the break");
    assert_eq!(atlas.read_u64(nodes[3] + 8), Some(0));
}

// ─────────────────────── capability grant round trip ───────────────────────────

#[test]
fn grant_roundtrip_preserves_the_token() {
    let ram = Ram::new(256);
    let log = VoidLog::new();
    let mut mem = ram.core(&log);
    let mut realm = Realm::new();
    let root = realm
        .init_primordial(&mut mem, &log, 512 * 1024)
        .expect("primordial");
    let a = spawn_started(&mut realm, &log, root);
    let b = spawn_started(&mut realm, &log, root);

    let cap = realm
        .cdt
        .mint(&log, 0x7000, 0x80, Rights::RW, halcyon_kernel::capabilities::CapTag::Raw)
        .expect("mint");
    realm.strand_mut(a).expect("a").cap_store(2, cap).expect("store");

    realm.grant(a, 2, b, 5).expect("grant");
    realm.grant(b, 5, a, 2).expect("grant back");

    let round = realm
        .strand(a)
        .and_then(|s| s.cap_get(2, halcyon_kernel::time::Chronon(0)))
        .expect("cap");
    assert_eq!((round.base, round.len, round.rights), (cap.base, cap.len, cap.rights));
    assert_eq!(realm.cdt.check(&log, &round, Rights::WRITE), Vbit::True);
}
