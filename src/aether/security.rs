// aether/security.rs — per-node frame validation.
//
// Five gates in strict order: structural, rate limit, HMAC, replay,
// permission. Each gate can reject and is logged by kind; acceptance is
// the only path that consumes a rate token and commits the replay-window
// update. The MAC comparison is constant time; the window is a 64-bit
// sliding bitmap keyed on sequence numbers.

use arrayvec::ArrayVec;

use crate::crypto::{hmac_sha256, verify_digest, DIGEST_LEN};
use crate::fixed::Fx;
use crate::time::MAX_NODES;
use crate::void::{VoidLog, VoidReason};

use super::frame::{FrameFlags, FrameHeader, MsgType, AETHER_HEADER_LEN, MAX_OFFSET};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NodePerms: u8 {
        const READ       = 1 << 0;
        const WRITE      = 1 << 1;
        const INVALIDATE = 1 << 2;
        const GENERATION = 1 << 3;
        const REVOKE     = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reject {
    BadSize = 0,
    BadMagic = 1,
    BadVersion = 2,
    BadType = 3,
    BadNode = 4,
    BadLength = 5,
    BadOffset = 6,
    RateLimited = 7,
    Backoff = 8,
    NotAuthenticated = 9,
    HmacFail = 10,
    Duplicate = 11,
    TooOld = 12,
    PermissionDenied = 13,
}

pub const REJECT_KINDS: usize = 14;

#[derive(Debug, Clone, Copy)]
pub struct SecurityEvent {
    pub node: u16,
    pub seq: u64,
    pub at: u64,
    pub outcome: Result<MsgType, Reject>,
}

pub const EVENT_LOG_CAP: usize = 32;

/// Replay-window width in sequence numbers.
pub const REPLAY_WINDOW: u64 = 64;

// token-bucket time base, ticks per second
pub const TICKS_PER_SECOND: u64 = 1000;
const BACKOFF_AFTER_REJECTS: u32 = 8;
const BACKOFF_TICKS: u64 = 5 * TICKS_PER_SECOND;

/// 16.16 fixed-point token bucket.
#[derive(Debug, Clone, Copy)]
pub struct TokenBucket {
    tokens: Fx,
    pub rate_pps: u32,
    pub burst: u32,
    last_refill: u64,
}

impl TokenBucket {
    pub fn new(rate_pps: u32, burst: u32) -> TokenBucket {
        TokenBucket {
            tokens: Fx::from_int(burst as i64),
            rate_pps,
            burst,
            last_refill: 0,
        }
    }

    /// tokens += elapsed * pps / tps, clamped to the burst size.
    fn refill(&mut self, now: u64) {
        if now <= self.last_refill {
            return;
        }
        let elapsed = now - self.last_refill;
        self.last_refill = now;
        let gained = Fx::from_ratio(
            elapsed as i64 * self.rate_pps as i64,
            TICKS_PER_SECOND as i64,
        );
        self.tokens = (self.tokens + gained).min(Fx::from_int(self.burst as i64));
    }

    fn available(&mut self, now: u64) -> bool {
        self.refill(now);
        self.tokens >= Fx::ONE
    }

    fn consume(&mut self) {
        self.tokens = (self.tokens - Fx::ONE).max(Fx::ZERO);
    }

    pub fn tokens_milli(&self) -> i64 {
        (self.tokens * Fx::from_int(1000)).floor()
    }
}

/// Security state for one peer node.
pub struct NodeSecurity {
    key: [u8; 32],
    key_set: bool,
    pub perms: NodePerms,
    pub last_seq: u64,
    pub window: u64,
    pub bucket: TokenBucket,
    reject_streak: u32,
    backoff_until: u64,
}

impl NodeSecurity {
    fn new() -> NodeSecurity {
        NodeSecurity {
            key: [0; 32],
            key_set: false,
            perms: NodePerms::empty(),
            last_seq: 0,
            window: 0,
            bucket: TokenBucket::new(100, 16),
            reject_streak: 0,
            backoff_until: 0,
        }
    }

    pub fn authenticated(&self) -> bool {
        self.key_set
    }
}

/// Frame accepted by the pipeline: header plus payload bounds inside the
/// caller's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accepted {
    pub header: FrameHeader,
    pub payload_start: usize,
    pub payload_len: usize,
}

pub struct AetherSecurity {
    nodes: [NodeSecurity; MAX_NODES],
    events: ArrayVec<SecurityEvent, EVENT_LOG_CAP>,
    event_head: usize,
    pub reject_counts: [u32; REJECT_KINDS],
    pub accepted: u64,
}

impl AetherSecurity {
    pub fn new() -> AetherSecurity {
        AetherSecurity {
            nodes: core::array::from_fn(|_| NodeSecurity::new()),
            events: ArrayVec::new(),
            event_head: 0,
            reject_counts: [0; REJECT_KINDS],
            accepted: 0,
        }
    }

    pub fn node(&self, id: u16) -> Option<&NodeSecurity> {
        self.nodes.get(id as usize)
    }

    pub fn set_key(&mut self, node: u16, key: [u8; 32]) -> bool {
        match self.nodes.get_mut(node as usize) {
            Some(n) => {
                n.key = key;
                n.key_set = true;
                true
            }
            None => false,
        }
    }

    pub fn set_perms(&mut self, node: u16, perms: NodePerms) -> bool {
        match self.nodes.get_mut(node as usize) {
            Some(n) => {
                n.perms = perms;
                true
            }
            None => false,
        }
    }

    pub fn set_rate(&mut self, node: u16, rate_pps: u32, burst: u32) -> bool {
        match self.nodes.get_mut(node as usize) {
            Some(n) => {
                n.bucket = TokenBucket::new(rate_pps, burst);
                true
            }
            None => false,
        }
    }

    fn push_event(&mut self, event: SecurityEvent) {
        if self.events.is_full() {
            let head = self.event_head;
            self.events[head] = event;
            self.event_head = (head + 1) % EVENT_LOG_CAP;
        } else {
            self.events.push(event);
        }
    }

    pub fn recent_events(&self) -> &[SecurityEvent] {
        &self.events
    }

    fn reject(
        &mut self,
        log: &VoidLog,
        node: u16,
        seq: u64,
        now: u64,
        reason: Reject,
    ) -> Reject {
        self.reject_counts[reason as usize] += 1;
        self.push_event(SecurityEvent {
            node,
            seq,
            at: now,
            outcome: Err(reason),
        });
        if let Some(n) = self.nodes.get_mut(node as usize) {
            n.reject_streak += 1;
            if n.reject_streak >= BACKOFF_AFTER_REJECTS {
                n.backoff_until = now + BACKOFF_TICKS;
                n.reject_streak = 0;
            }
        }
        log.record(
            VoidReason::Malformed,
            "aether.validate",
            [node as u64, seq],
            reject_note(reason),
        );
        reason
    }

    /// The full pipeline over one Aether region (header + payload + MAC).
    pub fn validate(
        &mut self,
        log: &VoidLog,
        aether: &[u8],
        now: u64,
    ) -> Result<Accepted, Reject> {
        // 1. structural
        if aether.len() < AETHER_HEADER_LEN + DIGEST_LEN {
            return Err(self.reject(log, u16::MAX, 0, now, Reject::BadSize));
        }
        let magic = u32::from_le_bytes([aether[0], aether[1], aether[2], aether[3]]);
        if magic != super::frame::AETHER_MAGIC {
            return Err(self.reject(log, u16::MAX, 0, now, Reject::BadMagic));
        }
        if aether[4] != super::frame::AETHER_VERSION {
            return Err(self.reject(log, u16::MAX, 0, now, Reject::BadVersion));
        }
        if MsgType::from_wire(aether[5]).is_none() {
            return Err(self.reject(log, u16::MAX, 0, now, Reject::BadType));
        }
        let Some(header) = FrameHeader::from_wire(aether) else {
            return Err(self.reject(log, u16::MAX, 0, now, Reject::BadMagic));
        };
        if header.src_node as usize >= MAX_NODES {
            return Err(self.reject(log, header.src_node, header.seq, now, Reject::BadNode));
        }
        let expected = AETHER_HEADER_LEN + header.data_len as usize + DIGEST_LEN;
        if aether.len() != expected {
            return Err(self.reject(log, header.src_node, header.seq, now, Reject::BadLength));
        }
        if header.offset > MAX_OFFSET {
            return Err(self.reject(log, header.src_node, header.seq, now, Reject::BadOffset));
        }
        let node_id = header.src_node;
        let seq = header.seq;

        // 2. rate limit
        if now < self.nodes[node_id as usize].backoff_until {
            return Err(self.reject(log, node_id, seq, now, Reject::Backoff));
        }
        let has_token = self.nodes[node_id as usize].bucket.available(now);
        if !has_token {
            return Err(self.reject(log, node_id, seq, now, Reject::RateLimited));
        }

        // 3. HMAC, constant-time comparison
        if !self.nodes[node_id as usize].key_set {
            return Err(self.reject(log, node_id, seq, now, Reject::NotAuthenticated));
        }
        let key = self.nodes[node_id as usize].key;
        let mac_start = aether.len() - DIGEST_LEN;
        let computed = hmac_sha256(&key, &[&aether[..mac_start]]);
        let mut presented = [0u8; DIGEST_LEN];
        presented.copy_from_slice(&aether[mac_start..]);
        if !verify_digest(&computed, &presented) {
            return Err(self.reject(log, node_id, seq, now, Reject::HmacFail));
        }

        // 4. replay window
        enum Plan {
            Shift(u64),
            SetBit(u64),
        }
        let (last_seq, window) = {
            let node = &self.nodes[node_id as usize];
            (node.last_seq, node.window)
        };
        let plan = if seq > last_seq {
            Plan::Shift(seq - last_seq)
        } else {
            let diff = last_seq - seq;
            if diff >= REPLAY_WINDOW {
                return Err(self.reject(log, node_id, seq, now, Reject::TooOld));
            }
            if window & (1u64 << diff) != 0 {
                return Err(self.reject(log, node_id, seq, now, Reject::Duplicate));
            }
            Plan::SetBit(diff)
        };

        // 5. permission
        let needed = match header.msg_type {
            MsgType::PageRequest => {
                if header.flags.contains(FrameFlags::WRITE) {
                    NodePerms::WRITE
                } else {
                    NodePerms::READ
                }
            }
            MsgType::PageResponse => NodePerms::READ,
            MsgType::Invalidate => NodePerms::INVALIDATE,
            MsgType::Generation => NodePerms::GENERATION,
            MsgType::Revoke => NodePerms::REVOKE,
            MsgType::Ack => NodePerms::empty(),
        };
        let perms = self.nodes[node_id as usize].perms;
        if !perms.contains(needed) {
            return Err(self.reject(log, node_id, seq, now, Reject::PermissionDenied));
        }

        // acceptance: consume a token, commit the window
        {
            let node = &mut self.nodes[node_id as usize];
            node.bucket.consume();
            match plan {
                Plan::Shift(delta) => {
                    node.window = if delta >= REPLAY_WINDOW {
                        0
                    } else {
                        node.window << delta
                    };
                    node.window |= 1;
                    node.last_seq = seq;
                }
                Plan::SetBit(diff) => {
                    node.window |= 1u64 << diff;
                }
            }
            node.reject_streak = 0;
        }
        self.accepted += 1;
        self.push_event(SecurityEvent {
            node: node_id,
            seq,
            at: now,
            outcome: Ok(header.msg_type),
        });
        Ok(Accepted {
            header,
            payload_start: AETHER_HEADER_LEN,
            payload_len: header.data_len as usize,
        })
    }
}

impl Default for AetherSecurity {
    fn default() -> Self {
        AetherSecurity::new()
    }
}

fn reject_note(reason: Reject) -> &'static str {
    match reason {
        Reject::BadSize => "frame shorter than header",
        Reject::BadMagic => "magic mismatch",
        Reject::BadVersion => "version mismatch",
        Reject::BadType => "unknown message type",
        Reject::BadNode => "source node out of range",
        Reject::BadLength => "data_len inconsistent",
        Reject::BadOffset => "offset beyond 48 bits",
        Reject::RateLimited => "token bucket empty",
        Reject::Backoff => "node in backoff",
        Reject::NotAuthenticated => "no key for node",
        Reject::HmacFail => "digest mismatch",
        Reject::Duplicate => "replayed sequence",
        Reject::TooOld => "sequence behind window",
        Reject::PermissionDenied => "missing permission",
    }
}
