// strand/mutex.rs — kernel mutex records.
//
// Plain data; acquisition and release logic lives with the realm, which
// owns the wait graph and can run deadlock detection before anyone blocks.
// The holder is identified by a capability minted per acquisition; the
// generation bump on release kills stale holder tokens.

use alloc::collections::VecDeque;

use crate::capabilities::{CapTag, Capability, CdtNodeId, Rights};
use crate::strand::{MutexId, StrandId};

pub struct KMutex {
    pub id: MutexId,
    pub holder: Option<StrandId>,
    pub waiters: VecDeque<StrandId>,
    pub generation: u64,
}

impl KMutex {
    pub fn new(id: MutexId) -> KMutex {
        KMutex {
            id,
            holder: None,
            waiters: VecDeque::new(),
            generation: 1,
        }
    }

    /// Token proving current ownership; valid until the next release.
    pub fn holder_cap(&self) -> Capability {
        Capability {
            base: self.id.0 as u64,
            len: 1,
            generation: self.generation,
            rights: Rights::WRITE,
            tag: CapTag::Mutex,
            node: CdtNodeId::VOID,
        }
    }

    /// A release is only honored with the capability minted at acquisition.
    pub fn cap_matches(&self, cap: &Capability) -> bool {
        cap.tag == CapTag::Mutex && cap.base == self.id.0 as u64 && cap.generation == self.generation
    }
}
