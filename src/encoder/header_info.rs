// Copyright 2022 - 2024 Wenmeng See the COPYRIGHT
// file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
//
// Header-info ledger: one entry per outstanding header block, grounded
// on `lsqpack.c`'s `header_info` struct and `lsqpack_enc_start_header`.
// Entries live in a slab-of-64 pool; a `VecDeque` of allocated ids
// front-to-back in allocation order stands in for the FIFO thread, since
// the live population is small enough (hundreds at most) that linear
// removal is cheap.

use std::collections::VecDeque;
use std::rc::Rc;

use crate::table::Entry;

const BLOCK_LEN: usize = 64;

struct Block<T> {
    slots: Vec<Option<T>>,
    occupancy: u64,
}

impl<T> Block<T> {
    fn new() -> Self {
        let mut slots = Vec::with_capacity(BLOCK_LEN);
        slots.resize_with(BLOCK_LEN, || None);
        Block { slots, occupancy: 0 }
    }
}

/// Slab pool, 64 entries per block, lowest-clear-bit allocation.
struct Pool<T> {
    blocks: Vec<Block<T>>,
}

impl<T> Pool<T> {
    fn new() -> Self {
        Pool { blocks: Vec::new() }
    }

    fn alloc(&mut self, value: T) -> usize {
        for (bi, block) in self.blocks.iter_mut().enumerate() {
            if block.occupancy != u64::MAX {
                let bit = (!block.occupancy).trailing_zeros() as usize;
                block.occupancy |= 1 << bit;
                block.slots[bit] = Some(value);
                return bi * BLOCK_LEN + bit;
            }
        }
        let mut block = Block::new();
        block.occupancy = 1;
        block.slots[0] = Some(value);
        self.blocks.push(block);
        (self.blocks.len() - 1) * BLOCK_LEN
    }

    fn free(&mut self, id: usize) {
        let (bi, bit) = (id / BLOCK_LEN, id % BLOCK_LEN);
        if let Some(block) = self.blocks.get_mut(bi) {
            block.slots[bit] = None;
            block.occupancy &= !(1u64 << bit);
        }
    }

    fn get(&self, id: usize) -> Option<&T> {
        self.blocks.get(id / BLOCK_LEN)?.slots[id % BLOCK_LEN].as_ref()
    }

    fn get_mut(&mut self, id: usize) -> Option<&mut T> {
        self.blocks.get_mut(id / BLOCK_LEN)?.slots[id % BLOCK_LEN].as_mut()
    }
}

/// One outstanding header block.
pub struct HeaderInfo {
    pub stream_id: u64,
    pub seqno: u64,
    pub base_idx: u64,
    pub min_id: u64,
    pub max_id: u64,
    pub ids_set: bool,
    pub bytes_inserted: usize,
    /// Supplemental bookkeeping from `lsqpack_enc_start_header`: true if
    /// another outstanding block on the same stream is already at risk
    /// when this one starts.
    pub others_at_risk: bool,
    /// Extra `Rc` clones holding every entry this block referenced,
    /// keeping them pinned (refcount > 0, see `table::is_pinned`) for
    /// the block's lifetime.
    pinned: Vec<Rc<Entry>>,
}

impl HeaderInfo {
    /// Records a reference to `abs_id`, widening the `[min_id, max_id]`
    /// window.
    pub fn reference(&mut self, abs_id: u64) {
        if !self.ids_set {
            self.min_id = abs_id;
            self.max_id = abs_id;
            self.ids_set = true;
        } else {
            self.min_id = self.min_id.min(abs_id);
            self.max_id = self.max_id.max(abs_id);
        }
    }

    /// Pins `entry` for the lifetime of this block and records the
    /// reference.
    pub fn pin(&mut self, entry: Rc<Entry>) {
        self.reference(entry.abs_id);
        self.pinned.push(entry);
    }
}

pub struct HeaderInfoLedger {
    pool: Pool<HeaderInfo>,
    fifo: VecDeque<usize>,
}

impl HeaderInfoLedger {
    pub fn new() -> Self {
        HeaderInfoLedger { pool: Pool::new(), fifo: VecDeque::new() }
    }

    pub fn start_header(&mut self, stream_id: u64, seqno: u64, base_idx: u64, max_acked_id: u64) -> usize {
        let others_at_risk = self
            .fifo
            .iter()
            .filter_map(|&id| self.pool.get(id))
            .any(|info| info.stream_id == stream_id && info.max_id < max_acked_id && info.ids_set);
        let info = HeaderInfo {
            stream_id,
            seqno,
            base_idx,
            min_id: 0,
            max_id: 0,
            ids_set: false,
            bytes_inserted: 0,
            others_at_risk,
            pinned: Vec::new(),
        };
        let id = self.pool.alloc(info);
        self.fifo.push_back(id);
        id
    }

    pub fn get(&self, id: usize) -> Option<&HeaderInfo> {
        self.pool.get(id)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut HeaderInfo> {
        self.pool.get_mut(id)
    }

    pub fn free(&mut self, id: usize) {
        self.pool.free(id);
        self.fifo.retain(|&x| x != id);
    }

    /// Linear scan over all live header-infos.
    pub fn min_referenced_id(&self) -> Option<u64> {
        self.fifo
            .iter()
            .filter_map(|&id| self.pool.get(id))
            .filter(|info| info.ids_set)
            .map(|info| info.min_id)
            .min()
    }

    /// Finds the lowest-seqno live info for `stream_id` (section-ack
    /// processing).
    pub fn lowest_seqno_for_stream(&self, stream_id: u64) -> Option<usize> {
        self.fifo
            .iter()
            .copied()
            .filter(|&id| self.pool.get(id).map(|i| i.stream_id) == Some(stream_id))
            .min_by_key(|&id| self.pool.get(id).unwrap().seqno)
    }

    /// Drops every live info for `stream_id` (cancel-stream), returning
    /// their ids for callers that need to unpin table entries first.
    pub fn cancel_stream(&mut self, stream_id: u64) -> Vec<usize> {
        let ids: Vec<usize> = self
            .fifo
            .iter()
            .copied()
            .filter(|&id| self.pool.get(id).map(|i| i.stream_id) == Some(stream_id))
            .collect();
        for &id in &ids {
            self.free(id);
        }
        ids
    }

    pub fn live_count(&self) -> usize {
        self.fifo.len()
    }
}

impl Default for HeaderInfoLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_reuses_lowest_clear_bit() {
        let mut ledger = HeaderInfoLedger::new();
        let a = ledger.start_header(1, 0, 0, 0);
        let b = ledger.start_header(1, 1, 0, 0);
        ledger.free(a);
        let c = ledger.start_header(1, 2, 0, 0);
        assert_eq!(a, c);
        assert_ne!(b, c);
    }

    #[test]
    fn min_referenced_id_ignores_unset_infos() {
        let mut ledger = HeaderInfoLedger::new();
        let a = ledger.start_header(1, 0, 0, 0);
        let b = ledger.start_header(1, 1, 0, 0);
        ledger.get_mut(a).unwrap().reference(5);
        ledger.get_mut(b).unwrap().reference(2);
        assert_eq!(ledger.min_referenced_id(), Some(2));
    }

    #[test]
    fn lowest_seqno_for_stream_picks_earliest() {
        let mut ledger = HeaderInfoLedger::new();
        ledger.start_header(7, 3, 0, 0);
        let earliest = ledger.start_header(7, 1, 0, 0);
        ledger.start_header(7, 2, 0, 0);
        assert_eq!(ledger.lowest_seqno_for_stream(7), Some(earliest));
    }

    #[test]
    fn cancel_stream_drops_only_matching_stream() {
        let mut ledger = HeaderInfoLedger::new();
        ledger.start_header(1, 0, 0, 0);
        ledger.start_header(2, 0, 0, 0);
        let dropped = ledger.cancel_stream(1);
        assert_eq!(dropped.len(), 1);
        assert_eq!(ledger.live_count(), 1);
    }

    #[test]
    fn others_at_risk_detects_unacked_sibling() {
        let mut ledger = HeaderInfoLedger::new();
        let a = ledger.start_header(1, 0, 0, 0);
        ledger.get_mut(a).unwrap().reference(5);
        let b = ledger.start_header(1, 1, 0, 3);
        assert!(ledger.get(b).unwrap().others_at_risk);
    }

    #[test]
    fn allocation_spans_multiple_blocks() {
        let mut ledger = HeaderInfoLedger::new();
        let mut ids = Vec::new();
        for i in 0..130 {
            ids.push(ledger.start_header(1, i, 0, 0));
        }
        assert_eq!(ids.len(), ids.iter().collect::<std::collections::HashSet<_>>().len());
    }
}
