// Copyright 2022 - 2024 Wenmeng See the COPYRIGHT
// file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
//
// Encoder-side dynamic table + hash index. Grounded on
// `hpack::header_index::HeaderIndex` (insertion-ordered deque, FIFO
// eviction, running size total), extended with two hash indices (by
// name, by name+value), absolute IDs, `MaxAckedId`, and the draining
// index. Bucket growth is left to `std`'s `HashMap` rather than
// hand-rolled, which gives the same O(1)-average lookup without
// reimplementing what the standard library already does well.

use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use crate::table::{is_pinned, ref_count, Entry};

/// Tuning constant, not a protocol requirement.
const DUP_FILL_THRESHOLD: f64 = 0.8;
/// Tuning constant, not a protocol requirement.
const DUP_HEAD_FRACTION: f64 = 0.2;

pub struct EncoderTable {
    /// Insertion order, front = oldest.
    entries: VecDeque<Rc<Entry>>,
    by_name: HashMap<u64, Vec<Rc<Entry>>>,
    by_nameval: HashMap<u64, Vec<Rc<Entry>>>,
    total_size: usize,
    max_capacity: usize,
    ins_count: u64,
    max_acked_id: u64,
    last_tss: u64,
    drain_idx: u64,
}

impl EncoderTable {
    pub fn new(max_capacity: usize) -> Self {
        EncoderTable {
            entries: VecDeque::new(),
            by_name: HashMap::new(),
            by_nameval: HashMap::new(),
            total_size: 0,
            max_capacity,
            ins_count: 0,
            max_acked_id: 0,
            last_tss: 0,
            drain_idx: 1,
        }
    }

    pub fn ins_count(&self) -> u64 {
        self.ins_count
    }

    pub fn max_acked_id(&self) -> u64 {
        self.max_acked_id
    }

    pub fn last_tss(&self) -> u64 {
        self.last_tss
    }

    pub fn drain_idx(&self) -> u64 {
        self.drain_idx
    }

    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Advances `MaxAckedId`. Invariant 1: never exceeds `InsCount`.
    pub fn advance_acked_id(&mut self, id: u64) {
        if id > self.max_acked_id && id <= self.ins_count {
            self.max_acked_id = id;
        }
    }

    pub fn set_last_tss(&mut self, v: u64) {
        self.last_tss = v;
    }

    pub fn get_by_abs_id(&self, abs_id: u64) -> Option<&Rc<Entry>> {
        let oldest = self.entries.front()?.abs_id;
        if abs_id < oldest || abs_id > self.ins_count {
            return None;
        }
        self.entries.get((abs_id - oldest) as usize)
    }

    /// Entries whose name+value hash matches, verified against the
    /// actual bytes (hash collisions are possible).
    pub fn find_full_candidates(&self, name: &[u8], value: &[u8], hash: u64) -> Vec<Rc<Entry>> {
        self.by_nameval
            .get(&hash)
            .into_iter()
            .flatten()
            .filter(|e| &*e.name == name && &*e.value == value)
            .cloned()
            .collect()
    }

    /// Entries whose name hash matches, verified against the actual
    /// bytes.
    pub fn find_name_candidates(&self, name: &[u8], hash: u64) -> Vec<Rc<Entry>> {
        self.by_name
            .get(&hash)
            .into_iter()
            .flatten()
            .filter(|e| &*e.name == name)
            .cloned()
            .collect()
    }

    /// Simulates evicting the currently-evictable prefix and reports
    /// whether `added_size` more bytes would then fit.
    pub fn has_room(&self, added_size: usize) -> bool {
        let evictable = self.evictable_prefix_size();
        self.total_size.saturating_sub(evictable) + added_size <= self.max_capacity
    }

    fn evictable_prefix_size(&self) -> usize {
        let mut acc = 0;
        for e in self.entries.iter() {
            if is_pinned(e) || e.abs_id > self.max_acked_id {
                break;
            }
            acc += e.size();
        }
        acc
    }

    /// Duplicate-admission rule: only worth it once the table is mostly
    /// full and the entry sits near the evictable head.
    pub fn is_duplicable(&self, entry: &Rc<Entry>, use_dup: bool) -> bool {
        if !use_dup || self.max_capacity == 0 {
            return false;
        }
        let projected_fill =
            (self.total_size + entry.size()) as f64 / self.max_capacity as f64;
        if projected_fill < DUP_FILL_THRESHOLD {
            return false;
        }
        let pos = match self.entries.iter().position(|e| Rc::ptr_eq(e, entry)) {
            Some(p) => p,
            None => return false,
        };
        if (pos as f64) >= self.entries.len() as f64 * DUP_HEAD_FRACTION {
            return false;
        }
        self.has_room(entry.size())
    }

    fn push_entry(&mut self, name: Vec<u8>, value: Vec<u8>) -> Rc<Entry> {
        self.ins_count += 1;
        let entry = Entry::new(name, value, self.ins_count);
        self.total_size += entry.size();
        self.by_name.entry(entry.name_hash).or_default().push(entry.clone());
        self.by_nameval.entry(entry.nameval_hash).or_default().push(entry.clone());
        self.entries.push_back(entry.clone());
        entry
    }

    /// Inserts a brand-new name+value entry. Caller must already have
    /// checked `has_room`.
    pub fn insert(&mut self, name: Vec<u8>, value: Vec<u8>) -> Rc<Entry> {
        let entry = self.push_entry(name, value);
        self.evict();
        entry
    }

    /// Re-inserts an existing entry under a fresh absolute ID.
    pub fn duplicate(&mut self, entry: &Rc<Entry>) -> Rc<Entry> {
        let dup = self.push_entry(entry.name.to_vec(), entry.value.to_vec());
        self.evict();
        dup
    }

    pub fn set_max_capacity(&mut self, cap: usize) {
        self.max_capacity = cap;
        self.evict();
    }

    fn remove_from_maps(&mut self, e: &Rc<Entry>) {
        if let Some(bucket) = self.by_name.get_mut(&e.name_hash) {
            bucket.retain(|x| !Rc::ptr_eq(x, e));
            if bucket.is_empty() {
                self.by_name.remove(&e.name_hash);
            }
        }
        if let Some(bucket) = self.by_nameval.get_mut(&e.nameval_hash) {
            bucket.retain(|x| !Rc::ptr_eq(x, e));
            if bucket.is_empty() {
                self.by_nameval.remove(&e.nameval_hash);
            }
        }
    }

    /// Drops entries from the tail while oversize, refcount 0, and
    /// already acknowledged. Leaves the table transiently over capacity
    /// if the oldest entry is pinned.
    pub fn evict(&mut self) {
        let mut evicted_any = false;
        while self.total_size > self.max_capacity {
            let evictable = match self.entries.front() {
                Some(e) => !is_pinned(e) && e.abs_id <= self.max_acked_id,
                None => break,
            };
            if !evictable {
                break;
            }
            let e = self.entries.pop_front().unwrap();
            self.total_size -= e.size();
            self.remove_from_maps(&e);
            evicted_any = true;
        }
        self.recompute_drain_idx(evicted_any);
    }

    fn recompute_drain_idx(&mut self, evicted_any: bool) {
        let fill = if self.max_capacity == 0 {
            0.0
        } else {
            self.total_size as f64 / self.max_capacity as f64
        };
        if !evicted_any && fill <= 0.75 {
            return;
        }
        let target = self.max_capacity / 4;
        let mut acc = self.max_capacity.saturating_sub(self.total_size);
        let mut drain_idx = self.entries.front().map(|e| e.abs_id).unwrap_or(self.ins_count + 1);
        for e in self.entries.iter() {
            if acc >= target {
                break;
            }
            acc += e.size();
            drain_idx = e.abs_id + 1;
        }
        self.drain_idx = drain_idx;
    }

    pub fn ref_count_of(&self, entry: &Rc<Entry>) -> usize {
        ref_count(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_find_full_match() {
        let mut t = EncoderTable::new(4096);
        let e = t.insert(b"custom".to_vec(), b"v1".to_vec());
        let hash = e.nameval_hash;
        let found = t.find_full_candidates(b"custom", b"v1", hash);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].abs_id, 1);
    }

    #[test]
    fn eviction_respects_capacity() {
        let mut t = EncoderTable::new(64);
        t.advance_acked_id(100);
        t.insert(b"a".to_vec(), b"1".to_vec()); // size 32+1+1=34
        assert_eq!(t.total_size(), 34);
        t.insert(b"b".to_vec(), b"2".to_vec()); // would be 68 > 64, evicts first
        assert_eq!(t.len(), 1);
        assert!(t.total_size() <= 64);
    }

    #[test]
    fn pinned_entry_blocks_eviction() {
        let mut t = EncoderTable::new(40);
        t.advance_acked_id(100);
        let e = t.insert(b"a".to_vec(), b"1".to_vec());
        let _pin = e.clone();
        t.insert(b"b".to_vec(), b"2".to_vec());
        // first entry pinned, so table is transiently over capacity
        assert_eq!(t.len(), 2);
        assert!(t.total_size() > 40);
    }

    #[test]
    fn has_room_accounts_for_evictable_prefix() {
        let mut t = EncoderTable::new(40);
        t.advance_acked_id(100);
        t.insert(b"a".to_vec(), b"1".to_vec()); // size 34
        assert!(t.has_room(6)); // evicting "a" frees exactly enough
        assert!(!t.has_room(7));
    }

    #[test]
    fn duplicate_gets_a_fresh_absolute_id() {
        let mut t = EncoderTable::new(4096);
        let e = t.insert(b"a".to_vec(), b"1".to_vec());
        let dup = t.duplicate(&e);
        assert_eq!(dup.abs_id, 2);
        assert_eq!(&*dup.name, &*e.name);
    }
}
