//! Outstanding block requests
//!
//! A bidirectional multimap between blocks and the transfers we asked for
//! them, tagged with send times. Used to cancel requests that linger past
//! their TTL, to avoid duplicate requests outside endgame, and to fan out
//! cancels when a block arrives from someone else.

use std::collections::{HashMap, HashSet};

use crate::peer::TransferId;
use crate::torrent::BlockIndex;

/// Block-to-transfer request ledger for one swarm.
#[derive(Debug, Default)]
pub struct ActiveRequests {
    by_block: HashMap<BlockIndex, HashMap<TransferId, u64>>,
    by_transfer: HashMap<TransferId, HashSet<BlockIndex>>,
    len: usize,
}

impl ActiveRequests {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `transfer` was asked for `block` at `now_secs`.
    ///
    /// Returns false when the pair was already recorded.
    pub fn add(&mut self, block: BlockIndex, transfer: TransferId, now_secs: u64) -> bool {
        let slot = self.by_block.entry(block).or_default();
        if slot.contains_key(&transfer) {
            return false;
        }
        slot.insert(transfer, now_secs);
        self.by_transfer.entry(transfer).or_default().insert(block);
        self.len += 1;
        true
    }

    /// Removes one (block, transfer) pair.
    pub fn remove(&mut self, block: BlockIndex, transfer: TransferId) -> bool {
        let removed = match self.by_block.get_mut(&block) {
            Some(slot) => slot.remove(&transfer).is_some(),
            None => false,
        };
        if !removed {
            return false;
        }
        if self.by_block.get(&block).is_some_and(HashMap::is_empty) {
            self.by_block.remove(&block);
        }
        if let Some(blocks) = self.by_transfer.get_mut(&transfer) {
            blocks.remove(&block);
            if blocks.is_empty() {
                self.by_transfer.remove(&transfer);
            }
        }
        self.len -= 1;
        true
    }

    /// Removes every request for `block`, returning who held one.
    pub fn remove_block(&mut self, block: BlockIndex) -> Vec<TransferId> {
        let Some(slot) = self.by_block.remove(&block) else {
            return Vec::new();
        };
        let mut holders: Vec<TransferId> = slot.into_keys().collect();
        holders.sort_unstable();
        for transfer in &holders {
            if let Some(blocks) = self.by_transfer.get_mut(transfer) {
                blocks.remove(&block);
                if blocks.is_empty() {
                    self.by_transfer.remove(transfer);
                }
            }
        }
        self.len -= holders.len();
        holders
    }

    /// Removes every request held by `transfer`, returning the blocks.
    pub fn remove_transfer(&mut self, transfer: TransferId) -> Vec<BlockIndex> {
        let Some(blocks) = self.by_transfer.remove(&transfer) else {
            return Vec::new();
        };
        let mut removed: Vec<BlockIndex> = blocks.into_iter().collect();
        removed.sort_unstable();
        for block in &removed {
            if let Some(slot) = self.by_block.get_mut(block) {
                slot.remove(&transfer);
                if slot.is_empty() {
                    self.by_block.remove(block);
                }
            }
        }
        self.len -= removed.len();
        removed
    }

    /// Pairs whose request was sent at or before `cutoff_secs`.
    pub fn sent_before(&self, cutoff_secs: u64) -> Vec<(BlockIndex, TransferId)> {
        let mut stale: Vec<(BlockIndex, TransferId)> = self
            .by_block
            .iter()
            .flat_map(|(block, slot)| {
                slot.iter()
                    .filter(move |(_, sent)| **sent <= cutoff_secs)
                    .map(move |(transfer, _)| (*block, *transfer))
            })
            .collect();
        stale.sort_unstable();
        stale
    }

    /// Whether the exact pair is recorded.
    pub fn has(&self, block: BlockIndex, transfer: TransferId) -> bool {
        self.by_block
            .get(&block)
            .is_some_and(|slot| slot.contains_key(&transfer))
    }

    /// Number of transfers asked for `block`.
    pub fn count_for_block(&self, block: BlockIndex) -> usize {
        self.by_block.get(&block).map_or(0, HashMap::len)
    }

    /// Number of blocks requested from `transfer`.
    pub fn count_for_transfer(&self, transfer: TransferId) -> usize {
        self.by_transfer.get(&transfer).map_or(0, HashSet::len)
    }

    /// Total outstanding requests.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no requests are outstanding.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
