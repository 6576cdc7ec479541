// atlas/tx.rs — optimistic transactions.
//
// A transaction snapshots the Genesis generation at begin. Commit wins
// only if nobody else committed in between: first-committer-wins on the
// generation counter, losers abort and retry. Aborted dirty pages are
// garbage until a compaction pass; the Genesis itself never carries
// uncommitted state, which is what makes crash recovery validation-only.

use arrayvec::ArrayVec;

use super::Atlas;
use crate::void::{VoidLog, VoidReason, VOID_U64};

pub const MAX_DIRTY_PAGES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Active,
    Committed,
    Aborted,
    Void,
}

/// Slot index into the bounded transaction pool.
pub type TxId = usize;

pub struct Transaction {
    pub id: u64,
    pub epoch: u64,
    pub start_generation: u64,
    pub state: TxState,
    pub(crate) dirty: ArrayVec<(u64, u32), MAX_DIRTY_PAGES>,
}

impl Transaction {
    fn renew(&mut self, id: u64, epoch: u64, generation: u64) {
        self.id = id;
        self.epoch = epoch;
        self.start_generation = generation;
        self.state = TxState::Active;
        self.dirty.clear();
    }
}

impl Atlas {
    /// Open a transaction in the next free pool slot. VOID (None) when the
    /// bounded pool is exhausted.
    pub fn tx_begin(&mut self, log: &VoidLog) -> Option<TxId> {
        let id = self.genesis().commit_count + self.genesis().abort_count + self.tx_active() as u64;
        let epoch = self.genesis().epoch;
        let generation = self.genesis().generation;

        if let Some(slot) = self
            .tx_pool
            .iter()
            .position(|t| t.state != TxState::Active)
        {
            self.tx_pool[slot].renew(id, epoch, generation);
            return Some(slot);
        }
        if self.tx_pool.is_full() {
            log.record(
                VoidReason::PoolExhausted,
                "atlas.tx_begin",
                [self.tx_pool.len() as u64, 0],
                "transaction pool full",
            );
            return None;
        }
        let mut tx = Transaction {
            id: 0,
            epoch: 0,
            start_generation: 0,
            state: TxState::Void,
            dirty: ArrayVec::new(),
        };
        tx.renew(id, epoch, generation);
        self.tx_pool.push(tx);
        Some(self.tx_pool.len() - 1)
    }

    pub fn tx(&self, tx: TxId) -> Option<&Transaction> {
        self.tx_pool.get(tx)
    }

    fn tx_active(&self) -> usize {
        self.tx_pool
            .iter()
            .filter(|t| t.state == TxState::Active)
            .count()
    }

    /// Record a mutated region; the covering pages are what a write-ahead
    /// pass would flush. FALSE on table overflow.
    pub fn tx_mark_dirty(&mut self, tx: TxId, offset: u64, size: u32) -> bool {
        if !self.contains(offset, size as u64) {
            return false;
        }
        let Some(t) = self.tx_pool.get_mut(tx) else {
            return false;
        };
        if t.state != TxState::Active {
            return false;
        }
        t.dirty.try_push((offset, size)).is_ok()
    }

    /// Optimistic commit: succeeds only if the Genesis generation still
    /// matches the one seen at begin.
    pub fn tx_commit(&mut self, tx: TxId, log: &VoidLog) -> bool {
        let start_generation = match self.tx_pool.get(tx) {
            Some(t) if t.state == TxState::Active => t.start_generation,
            _ => {
                log.record(
                    VoidReason::StateViolation,
                    "atlas.tx_commit",
                    [tx as u64, VOID_U64],
                    "commit on non-active transaction",
                );
                return false;
            }
        };

        if self.genesis().generation != start_generation {
            // first committer won; this one retries
            self.genesis_mut().abort_count += 1;
            if let Some(t) = self.tx_pool.get_mut(tx) {
                t.state = TxState::Aborted;
            }
            return false;
        }

        let stamp = self.stamp();
        let dirty: ArrayVec<(u64, u32), MAX_DIRTY_PAGES> = self
            .tx_pool
            .get(tx)
            .map(|t| t.dirty.clone())
            .unwrap_or_default();
        {
            let genesis = self.genesis_mut();
            genesis.generation += 1;
            genesis.commit_count += 1;
            genesis.modified_at = stamp;
        }
        for (offset, size) in dirty {
            let page_start = offset & !(super::PAGE - 1);
            let page_end = (offset + size as u64 + super::PAGE - 1) & !(super::PAGE - 1);
            let _ = self.sync_range(page_start, (page_end - page_start) as usize);
        }
        let _ = self.sync_range(0, super::GENESIS_SIZE);
        if let Some(t) = self.tx_pool.get_mut(tx) {
            t.state = TxState::Committed;
        }
        true
    }

    /// Abandon the transaction; its dirty pages become garbage.
    pub fn tx_abort(&mut self, tx: TxId) -> bool {
        let Some(t) = self.tx_pool.get_mut(tx) else {
            return false;
        };
        if t.state != TxState::Active {
            return false;
        }
        t.state = TxState::Aborted;
        self.genesis_mut().abort_count += 1;
        true
    }
}
