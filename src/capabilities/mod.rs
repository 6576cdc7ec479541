//! Halcyon Capability System
//!
//! Unforgeable fat tokens are the only way across isolation boundaries:
//! a capability names a contiguous region, the rights over it, and the
//! issuer generation it was minted under. Derivation narrows; revocation
//! bumps a generation and takes the whole subtree with it.

use core::fmt;

use arrayvec::ArrayVec;

use crate::void::{Vbit, VoidLog, VoidReason};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Rights: u8 {
        const READ   = 1 << 0;
        const WRITE  = 1 << 1;
        const EXEC   = 1 << 2;
        const DERIVE = 1 << 3;
        const REVOKE = 1 << 4;
    }
}

impl Rights {
    pub const RW: Rights = Rights::READ.union(Rights::WRITE);
    pub const FULL: Rights = Rights::all();
}

/// What kind of object a capability governs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CapTag {
    Raw = 0,
    Arena = 1,
    Stack = 2,
    Code = 3,
    Mutex = 4,
    AtlasObject = 5,
    AetherPage = 6,
}

/// Slot in the derivation tree. The all-ones value is the VOID slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct CdtNodeId(pub u32);

impl CdtNodeId {
    pub const VOID: CdtNodeId = CdtNodeId(u32::MAX);

    #[inline]
    pub fn is_void(self) -> bool {
        self == CdtNodeId::VOID
    }
}

/// Immutable fat token. Copies are as good as the original; validity is
/// decided by the issuer generation, never by possession.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    pub base: u64,
    pub len: u64,
    pub generation: u64,
    pub rights: Rights,
    pub tag: CapTag,
    pub node: CdtNodeId,
}

impl Capability {
    /// Generation-and-rights check against an issuer generation the caller
    /// already holds (arena-bound tokens check their arena this way).
    pub fn check_against(&self, issuer_generation: u64, needed: Rights) -> Vbit {
        if self.generation != issuer_generation {
            return Vbit::Void;
        }
        Vbit::from(self.rights.contains(needed))
    }

    #[inline]
    pub fn covers(&self, base: u64, len: u64) -> bool {
        base >= self.base && base.saturating_add(len) <= self.base.saturating_add(self.len)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cap[{:?} {:#x}+{:#x} g{} {:?}]",
            self.tag, self.base, self.len, self.generation, self.rights
        )
    }
}

// ───────────────────────── Derivation tree (CDT) ───────────────────────────────

pub const CDT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy)]
struct CdtNode {
    parent: CdtNodeId,
    generation: u64,
    live: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapError {
    PoolExhausted,
    RightsEscalation,
    OutOfBounds,
    Revoked,
    NoAuthority,
    BadNode,
}

impl fmt::Display for CapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Bounded table of derivation nodes. Slots are reused after revocation;
/// the generation keeps climbing so stale tokens stay dead.
pub struct DerivationTree {
    nodes: ArrayVec<CdtNode, CDT_CAPACITY>,
}

impl DerivationTree {
    pub fn new() -> DerivationTree {
        DerivationTree {
            nodes: ArrayVec::new(),
        }
    }

    fn alloc_node(&mut self, parent: CdtNodeId) -> Option<CdtNodeId> {
        if let Some(idx) = self.nodes.iter().position(|n| !n.live) {
            let node = &mut self.nodes[idx];
            node.parent = parent;
            node.generation += 1;
            node.live = true;
            return Some(CdtNodeId(idx as u32));
        }
        if self.nodes.is_full() {
            return None;
        }
        self.nodes.push(CdtNode {
            parent,
            generation: 1,
            live: true,
        });
        Some(CdtNodeId(self.nodes.len() as u32 - 1))
    }

    fn node(&self, id: CdtNodeId) -> Option<&CdtNode> {
        self.nodes.get(id.0 as usize)
    }

    /// Root a fresh capability tree over `[base, base+len)`.
    pub fn mint(
        &mut self,
        log: &VoidLog,
        base: u64,
        len: u64,
        rights: Rights,
        tag: CapTag,
    ) -> Result<Capability, CapError> {
        let Some(node) = self.alloc_node(CdtNodeId::VOID) else {
            log.record(
                VoidReason::PoolExhausted,
                "cdt.mint",
                [base, len],
                "derivation table full",
            );
            return Err(CapError::PoolExhausted);
        };
        // node() can't miss right after alloc_node
        let generation = self.node(node).map(|n| n.generation).unwrap_or(1);
        Ok(Capability {
            base,
            len,
            generation,
            rights,
            tag,
            node,
        })
    }

    /// Child capability with narrowed bounds and rights. Requires DERIVE on
    /// the parent, `new_rights ⊆ parent.rights`, and containment.
    pub fn derive(
        &mut self,
        log: &VoidLog,
        parent: &Capability,
        new_base: u64,
        new_len: u64,
        new_rights: Rights,
    ) -> Result<Capability, CapError> {
        match self.check(log, parent, Rights::DERIVE) {
            Vbit::Void => return Err(CapError::Revoked),
            Vbit::False => return Err(CapError::NoAuthority),
            Vbit::True => {}
        }
        if !parent.rights.contains(new_rights) {
            return Err(CapError::RightsEscalation);
        }
        if !parent.covers(new_base, new_len) {
            return Err(CapError::OutOfBounds);
        }
        let Some(node) = self.alloc_node(parent.node) else {
            log.record(
                VoidReason::PoolExhausted,
                "cdt.derive",
                [new_base, new_len],
                "derivation table full",
            );
            return Err(CapError::PoolExhausted);
        };
        let generation = self.node(node).map(|n| n.generation).unwrap_or(1);
        Ok(Capability {
            base: new_base,
            len: new_len,
            generation,
            rights: new_rights,
            tag: parent.tag,
            node,
        })
    }

    /// Invalidate a capability and every descendant. Requires REVOKE.
    pub fn revoke(&mut self, log: &VoidLog, cap: &Capability) -> Result<(), CapError> {
        match self.check(log, cap, Rights::REVOKE) {
            Vbit::Void => return Err(CapError::Revoked),
            Vbit::False => return Err(CapError::NoAuthority),
            Vbit::True => {}
        }
        self.revoke_subtree(cap.node);
        log.record(
            VoidReason::Revoked,
            "cdt.revoke",
            [cap.base, cap.len],
            "capability subtree revoked",
        );
        Ok(())
    }

    fn revoke_subtree(&mut self, root: CdtNodeId) {
        // worklist over the bounded table; parents die before children
        let mut frontier: ArrayVec<CdtNodeId, CDT_CAPACITY> = ArrayVec::new();
        let _ = frontier.try_push(root);
        while let Some(id) = frontier.pop() {
            if let Some(node) = self.nodes.get_mut(id.0 as usize) {
                if node.live {
                    node.generation += 1;
                    node.live = false;
                }
            }
            for (idx, node) in self.nodes.iter().enumerate() {
                if node.live && node.parent == id {
                    let _ = frontier.try_push(CdtNodeId(idx as u32));
                }
            }
        }
    }

    /// Ternary validity: True when live and sufficient, False when rights
    /// are missing, Void when the generation no longer matches (revoked).
    pub fn check(&self, log: &VoidLog, cap: &Capability, needed: Rights) -> Vbit {
        let Some(node) = self.node(cap.node) else {
            log.record(
                VoidReason::GenerationMismatch,
                "cdt.check",
                [cap.node.0 as u64, cap.generation],
                "unknown derivation node",
            );
            return Vbit::Void;
        };
        if !node.live || node.generation != cap.generation {
            log.record(
                VoidReason::GenerationMismatch,
                "cdt.check",
                [node.generation, cap.generation],
                "stale capability",
            );
            return Vbit::Void;
        }
        Vbit::from(cap.rights.contains(needed))
    }

    pub fn live_nodes(&self) -> usize {
        self.nodes.iter().filter(|n| n.live).count()
    }
}

impl Default for DerivationTree {
    fn default() -> Self {
        DerivationTree::new()
    }
}
