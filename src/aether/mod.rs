//! Halcyon Aether — distributed shared memory
//!
//! Pages live with an owning node; remote faults turn into authenticated
//! PAGE_REQUEST frames and resolve when the matching PAGE_RESPONSE
//! arrives with the page bytes and its generation. Local writes publish
//! INVALIDATE to every caching peer; REVOKE bumps a page's generation so
//! stale dereferences read VOID. Every inbound frame crosses the
//! five-gate security pipeline before its semantics run.

pub mod frame;
pub mod security;

use alloc::boxed::Box;
use alloc::vec::Vec;
use hashbrown::HashMap;

use crate::time::MAX_NODES;
use crate::void::{Vbit, VoidLog, VoidReason};
use frame::{encode_frame, FrameFlags, FrameHeader, MsgType, MAX_PAYLOAD};
use security::{AetherSecurity, Reject};

pub const AETHER_PAGE: usize = 4096;

/// Outbound frame sink; the NIC driver in kernel builds, a recorder in
/// tests.
pub trait FrameTransport {
    fn send(&mut self, dst_node: u16, bytes: &[u8]);
}

struct PageState {
    owner: u16,
    data: Option<Box<[u8; AETHER_PAGE]>>,
    generation: u64,
    /// Bitmask of nodes holding cached copies (owner side).
    cached_by: u16,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AetherStats {
    pub faults: u64,
    pub requests_sent: u64,
    pub responses_sent: u64,
    pub responses_applied: u64,
    pub invalidations_sent: u64,
    pub invalidations_applied: u64,
    pub acks: u64,
}

pub struct AetherEngine {
    pub node_id: u16,
    pub security: AetherSecurity,
    local_key: [u8; 32],
    mac: [u8; 6],
    pages: HashMap<u64, PageState>,
    /// offset → seq of the outstanding PAGE_REQUEST
    pending: HashMap<u64, u64>,
    next_seq: u64,
    pub stats: AetherStats,
}

impl AetherEngine {
    pub fn new(node_id: u16, local_key: [u8; 32], mac: [u8; 6]) -> AetherEngine {
        AetherEngine {
            node_id,
            security: AetherSecurity::new(),
            local_key,
            mac,
            pages: HashMap::new(),
            pending: HashMap::new(),
            next_seq: 1,
            stats: AetherStats::default(),
        }
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Declare a page owned here, seeded with `data`.
    pub fn adopt_page(&mut self, offset: u64, data: &[u8]) -> Vbit {
        if data.len() > AETHER_PAGE {
            return Vbit::Void;
        }
        let mut page = Box::new([0u8; AETHER_PAGE]);
        page[..data.len()].copy_from_slice(data);
        self.pages.insert(
            offset,
            PageState {
                owner: self.node_id,
                data: Some(page),
                generation: 1,
                cached_by: 0,
            },
        );
        Vbit::True
    }

    /// Register a remote owner for a page; faults route there.
    pub fn track_remote_page(&mut self, offset: u64, owner: u16) -> Vbit {
        if owner as usize >= MAX_NODES {
            return Vbit::Void;
        }
        self.pages.insert(
            offset,
            PageState {
                owner,
                data: None,
                generation: 0,
                cached_by: 0,
            },
        );
        Vbit::True
    }

    pub fn is_resident(&self, offset: u64) -> bool {
        self.pages
            .get(&offset)
            .map(|p| p.data.is_some())
            .unwrap_or(false)
    }

    pub fn page_generation(&self, offset: u64) -> Option<u64> {
        self.pages.get(&offset).map(|p| p.generation)
    }

    /// Generation-checked read. A stale or missing generation reads VOID.
    pub fn read(
        &self,
        log: &VoidLog,
        offset: u64,
        expected_generation: u64,
    ) -> Option<&[u8; AETHER_PAGE]> {
        let page = self.pages.get(&offset)?;
        if page.generation != expected_generation {
            log.record(
                VoidReason::GenerationMismatch,
                "aether.read",
                [offset, expected_generation],
                "stale page generation",
            );
            return None;
        }
        page.data.as_deref()
    }

    /// Demand fault in the AETHER range: emit a PAGE_REQUEST to the owner
    /// and wait for the response to land. True when already resident.
    pub fn fault(
        &mut self,
        log: &VoidLog,
        transport: &mut dyn FrameTransport,
        offset: u64,
        write: bool,
    ) -> Vbit {
        self.stats.faults += 1;
        let Some(page) = self.pages.get(&offset) else {
            log.record(
                VoidReason::LookupMiss,
                "aether.fault",
                [offset, 0],
                "fault outside the page directory",
            );
            return Vbit::Void;
        };
        if page.data.is_some() {
            return Vbit::True;
        }
        let owner = page.owner;
        if self.pending.contains_key(&offset) {
            // request already in flight
            return Vbit::False;
        }
        let seq = self.bump_seq();
        let header = FrameHeader {
            msg_type: MsgType::PageRequest,
            flags: if write {
                FrameFlags::WRITE
            } else {
                FrameFlags::empty()
            },
            seq,
            src_node: self.node_id,
            dst_node: owner,
            offset,
            data_len: 0,
            generation: 0,
        };
        let bytes = encode_frame([0xFF; 6], self.mac, &header, &[], &self.local_key);
        transport.send(owner, &bytes);
        self.pending.insert(offset, seq);
        self.stats.requests_sent += 1;
        Vbit::False
    }

    /// Local write into an owned page; caching peers get INVALIDATE.
    pub fn local_write(
        &mut self,
        log: &VoidLog,
        transport: &mut dyn FrameTransport,
        offset: u64,
        at: usize,
        bytes: &[u8],
    ) -> Vbit {
        let node_id = self.node_id;
        let Some(page) = self.pages.get_mut(&offset) else {
            return Vbit::Void;
        };
        if page.owner != node_id {
            log.record(
                VoidReason::StateViolation,
                "aether.local_write",
                [offset, page.owner as u64],
                "write to a remote-owned page",
            );
            return Vbit::False;
        }
        let Some(data) = page.data.as_mut() else {
            return Vbit::Void;
        };
        if at + bytes.len() > AETHER_PAGE {
            return Vbit::Void;
        }
        data[at..at + bytes.len()].copy_from_slice(bytes);
        let generation = page.generation;
        let cached = page.cached_by;

        for peer in 0..MAX_NODES as u16 {
            if peer != node_id && cached & (1 << peer) != 0 {
                let seq = self.bump_seq();
                let header = FrameHeader {
                    msg_type: MsgType::Invalidate,
                    flags: FrameFlags::empty(),
                    seq,
                    src_node: node_id,
                    dst_node: peer,
                    offset,
                    data_len: 0,
                    generation,
                };
                let frame = encode_frame([0xFF; 6], self.mac, &header, &[], &self.local_key);
                transport.send(peer, &frame);
                self.stats.invalidations_sent += 1;
            }
        }
        Vbit::True
    }

    /// Inbound frame: validate, then run the message semantics.
    pub fn handle_frame(
        &mut self,
        log: &VoidLog,
        transport: &mut dyn FrameTransport,
        aether: &[u8],
        now: u64,
    ) -> Result<MsgType, Reject> {
        let accepted = self.security.validate(log, aether, now)?;
        let header = accepted.header;
        let payload =
            &aether[accepted.payload_start..accepted.payload_start + accepted.payload_len];

        match header.msg_type {
            MsgType::PageRequest => self.serve_page(log, transport, &header),
            MsgType::PageResponse => self.apply_response(log, &header, payload),
            MsgType::Invalidate => self.apply_invalidate(log, &header),
            MsgType::Generation => {
                if let Some(page) = self.pages.get_mut(&header.offset) {
                    page.generation = page.generation.max(header.generation) + 1;
                }
            }
            MsgType::Revoke => self.apply_revoke(log, &header),
            MsgType::Ack => {
                self.stats.acks += 1;
            }
        }
        Ok(header.msg_type)
    }

    fn serve_page(
        &mut self,
        log: &VoidLog,
        transport: &mut dyn FrameTransport,
        request: &FrameHeader,
    ) {
        let node_id = self.node_id;
        let Some(page) = self.pages.get_mut(&request.offset) else {
            log.record(
                VoidReason::LookupMiss,
                "aether.serve",
                [request.offset, request.src_node as u64],
                "request for unknown page",
            );
            return;
        };
        if page.owner != node_id || page.data.is_none() {
            return;
        }
        page.cached_by |= 1 << request.src_node;
        let generation = page.generation;
        // single-fragment responses; jumbo frames would lift this cap
        let payload: Vec<u8> = page
            .data
            .as_ref()
            .map(|d| d[..MAX_PAYLOAD.min(AETHER_PAGE)].to_vec())
            .unwrap_or_default();

        let seq = self.bump_seq();
        let header = FrameHeader {
            msg_type: MsgType::PageResponse,
            flags: FrameFlags::empty(),
            seq,
            src_node: node_id,
            dst_node: request.src_node,
            offset: request.offset,
            data_len: payload.len() as u16,
            generation,
        };
        let frame = encode_frame([0xFF; 6], self.mac, &header, &payload, &self.local_key);
        transport.send(request.src_node, &frame);
        self.stats.responses_sent += 1;
    }

    fn apply_response(&mut self, log: &VoidLog, header: &FrameHeader, payload: &[u8]) {
        if self.pending.remove(&header.offset).is_none() {
            log.record(
                VoidReason::StateViolation,
                "aether.response",
                [header.offset, header.src_node as u64],
                "response without a pending request",
            );
            return;
        }
        let Some(page) = self.pages.get_mut(&header.offset) else {
            return;
        };
        let mut data = Box::new([0u8; AETHER_PAGE]);
        let take = payload.len().min(AETHER_PAGE);
        data[..take].copy_from_slice(&payload[..take]);
        page.data = Some(data);
        page.generation = header.generation;
        self.stats.responses_applied += 1;
    }

    fn apply_invalidate(&mut self, _log: &VoidLog, header: &FrameHeader) {
        if let Some(page) = self.pages.get_mut(&header.offset) {
            if page.owner != self.node_id {
                page.data = None;
                self.stats.invalidations_applied += 1;
            }
        }
    }

    fn apply_revoke(&mut self, log: &VoidLog, header: &FrameHeader) {
        if let Some(page) = self.pages.get_mut(&header.offset) {
            page.generation += 1;
            log.record(
                VoidReason::Revoked,
                "aether.revoke",
                [header.offset, header.src_node as u64],
                "page generation revoked",
            );
        }
    }

    /// Sign an outbound frame for tests and peers.
    pub fn seal(&mut self, mut header: FrameHeader, payload: &[u8]) -> Vec<u8> {
        header.seq = self.bump_seq();
        header.src_node = self.node_id;
        encode_frame([0xFF; 6], self.mac, &header, payload, &self.local_key)
    }
}

#[cfg(test)]
mod tests {
    use super::frame::strip_ethernet;
    use super::security::NodePerms;
    use super::*;

    struct Wire {
        sent: Vec<(u16, Vec<u8>)>,
    }

    impl Wire {
        fn new() -> Wire {
            Wire { sent: Vec::new() }
        }
    }

    impl FrameTransport for Wire {
        fn send(&mut self, dst_node: u16, bytes: &[u8]) {
            self.sent.push((dst_node, bytes.to_vec()));
        }
    }

    const KEY_A: [u8; 32] = [0xA1; 32];
    const KEY_B: [u8; 32] = [0xB2; 32];

    /// Two engines that trust each other with full permissions.
    fn mesh() -> (AetherEngine, AetherEngine, VoidLog) {
        let mut a = AetherEngine::new(0, KEY_A, [0x02, 0, 0, 0, 0, 0xA]);
        let mut b = AetherEngine::new(1, KEY_B, [0x02, 0, 0, 0, 0, 0xB]);
        a.security.set_key(1, KEY_B);
        a.security.set_perms(1, NodePerms::all());
        b.security.set_key(0, KEY_A);
        b.security.set_perms(0, NodePerms::all());
        (a, b, VoidLog::new())
    }

    #[test]
    fn fault_request_response_roundtrip() {
        let (mut a, mut b, log) = mesh();
        let mut wire = Wire::new();

        // b owns the page; a tracks it remotely
        let mut content = [0u8; 64];
        content[0] = 0x5E;
        assert_eq!(b.adopt_page(0x8000, &content), Vbit::True);
        assert_eq!(a.track_remote_page(0x8000, 1), Vbit::True);

        // a faults: request goes out, page not yet resident
        assert_eq!(a.fault(&log, &mut wire, 0x8000, false), Vbit::False);
        assert!(!a.is_resident(0x8000));
        let (dst, request) = wire.sent.pop().expect("request");
        assert_eq!(dst, 1);

        // b serves the request
        let aether = strip_ethernet(&request).expect("strip");
        assert_eq!(
            b.handle_frame(&log, &mut wire, aether, 1),
            Ok(MsgType::PageRequest)
        );
        let (dst, response) = wire.sent.pop().expect("response");
        assert_eq!(dst, 0);

        // a applies the response and the page is readable
        let aether = strip_ethernet(&response).expect("strip");
        assert_eq!(
            a.handle_frame(&log, &mut wire, aether, 2),
            Ok(MsgType::PageResponse)
        );
        assert!(a.is_resident(0x8000));
        let generation = a.page_generation(0x8000).expect("generation");
        let page = a.read(&log, 0x8000, generation).expect("read");
        assert_eq!(page[0], 0x5E);

        // repeated fault is now a hit
        assert_eq!(a.fault(&log, &mut wire, 0x8000, false), Vbit::True);
    }

    #[test]
    fn owner_write_invalidates_cached_copies() {
        let (mut a, mut b, log) = mesh();
        let mut wire = Wire::new();

        b.adopt_page(0x9000, &[1, 2, 3]);
        a.track_remote_page(0x9000, 1);

        // pull the page into a's cache
        a.fault(&log, &mut wire, 0x9000, false);
        let (_, request) = wire.sent.pop().expect("request");
        b.handle_frame(&log, &mut wire, strip_ethernet(&request).expect("strip"), 1)
            .expect("serve");
        let (_, response) = wire.sent.pop().expect("response");
        a.handle_frame(&log, &mut wire, strip_ethernet(&response).expect("strip"), 2)
            .expect("apply");
        assert!(a.is_resident(0x9000));

        // owner writes; a's copy dies on the invalidate
        assert_eq!(
            b.local_write(&log, &mut wire, 0x9000, 0, &[9]),
            Vbit::True
        );
        let (dst, invalidate) = wire.sent.pop().expect("invalidate");
        assert_eq!(dst, 0);
        a.handle_frame(
            &log,
            &mut wire,
            strip_ethernet(&invalidate).expect("strip"),
            3,
        )
        .expect("invalidate");
        assert!(!a.is_resident(0x9000));
        assert_eq!(a.stats.invalidations_applied, 1);
    }

    #[test]
    fn revoke_makes_stale_reads_void() {
        let (mut a, mut b, log) = mesh();
        let mut wire = Wire::new();

        a.adopt_page(0xA000, &[7; 16]);
        let generation = a.page_generation(0xA000).expect("generation");
        assert!(a.read(&log, 0xA000, generation).is_some());

        // b revokes the page's capability generation
        let revoke = b.seal(
            FrameHeader {
                msg_type: MsgType::Revoke,
                flags: FrameFlags::empty(),
                seq: 0,
                src_node: 1,
                dst_node: 0,
                offset: 0xA000,
                data_len: 0,
                generation: 0,
            },
            &[],
        );
        a.handle_frame(&log, &mut wire, strip_ethernet(&revoke).expect("strip"), 1)
            .expect("revoke");

        // the old generation now dereferences to VOID
        assert!(a.read(&log, 0xA000, generation).is_none());
        assert!(log.has_reason(VoidReason::GenerationMismatch));
        assert!(a.read(&log, 0xA000, generation + 1).is_some());
    }

    #[test]
    fn unsolicited_responses_are_dropped() {
        let (mut a, mut b, log) = mesh();
        let mut wire = Wire::new();
        a.track_remote_page(0xB000, 1);

        let rogue = b.seal(
            FrameHeader {
                msg_type: MsgType::PageResponse,
                flags: FrameFlags::empty(),
                seq: 0,
                src_node: 1,
                dst_node: 0,
                offset: 0xB000,
                data_len: 4,
                generation: 5,
            },
            b"evil",
        );
        a.handle_frame(&log, &mut wire, strip_ethernet(&rogue).expect("strip"), 1)
            .expect("frame passes security");
        // but the payload is never installed
        assert!(!a.is_resident(0xB000));
        assert!(log.has_reason(VoidReason::StateViolation));
    }

    #[test]
    fn tampered_frames_never_reach_semantics() {
        let (mut a, mut b, log) = mesh();
        let mut wire = Wire::new();
        a.adopt_page(0xC000, &[3; 8]);

        let mut request = b.seal(
            FrameHeader {
                msg_type: MsgType::PageRequest,
                flags: FrameFlags::empty(),
                seq: 0,
                src_node: 1,
                dst_node: 0,
                offset: 0xC000,
                data_len: 0,
                generation: 0,
            },
            &[],
        );
        let tail = request.len() - 1;
        request[tail] ^= 0x80; // corrupt the MAC
        let aether = strip_ethernet(&request).expect("strip");
        assert_eq!(
            a.handle_frame(&log, &mut wire, aether, 1),
            Err(Reject::HmacFail)
        );
        assert_eq!(a.stats.responses_sent, 0);
    }
}
