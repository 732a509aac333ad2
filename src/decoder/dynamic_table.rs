// Copyright 2022 - 2024 Wenmeng See the COPYRIGHT
// file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
//
// Decoder-side dynamic table (C4, decoder half): grounded on
// `hpack::header_index::HeaderIndex`'s size accounting and FIFO
// eviction, reshaped into a power-of-two ring buffer since the decoder
// only ever looks an entry up by absolute ID (no name/value hash index
// needed on this side, unlike the encoder's `EncoderTable`).

use std::rc::Rc;

use crate::table::{is_pinned, Entry};

const MIN_CAPACITY: usize = 16;

pub struct DecoderTable {
    buf: Vec<Option<Rc<Entry>>>,
    head: usize,
    len: usize,
    /// Absolute ID of the entry at `buf[head]`.
    base_abs_id: u64,
    total_size: usize,
    max_capacity: usize,
    last_id: u64,
    largest_known_id: u64,
}

impl DecoderTable {
    pub fn new(max_capacity: usize) -> Self {
        DecoderTable {
            buf: Vec::new(),
            head: 0,
            len: 0,
            base_abs_id: 1,
            total_size: 0,
            max_capacity,
            last_id: 0,
            largest_known_id: 0,
        }
    }

    pub fn last_id(&self) -> u64 {
        self.last_id
    }

    pub fn largest_known_id(&self) -> u64 {
        self.largest_known_id
    }

    pub fn note_largest_known(&mut self, id: u64) {
        self.largest_known_id = self.largest_known_id.max(id);
    }

    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn grow(&mut self) {
        let new_cap = (self.buf.len() * 2).max(MIN_CAPACITY);
        let mut new_buf: Vec<Option<Rc<Entry>>> = Vec::with_capacity(new_cap);
        for i in 0..self.len {
            new_buf.push(self.buf[(self.head + i) % self.buf.len().max(1)].clone());
        }
        new_buf.resize(new_cap, None);
        self.buf = new_buf;
        self.head = 0;
    }

    pub fn get_by_abs_id(&self, abs_id: u64) -> Option<&Rc<Entry>> {
        if self.len == 0 || abs_id < self.base_abs_id {
            return None;
        }
        let offset = (abs_id - self.base_abs_id) as usize;
        if offset >= self.len {
            return None;
        }
        self.buf[(self.head + offset) % self.buf.len()].as_ref()
    }

    fn push(&mut self, entry: Rc<Entry>) {
        if self.len == self.buf.len() {
            self.grow();
        }
        if self.len == 0 {
            self.base_abs_id = entry.abs_id;
        }
        let idx = (self.head + self.len) % self.buf.len();
        self.total_size += entry.size();
        self.last_id = entry.abs_id;
        self.buf[idx] = Some(entry);
        self.len += 1;
    }

    /// Inserts an entry carried on the peer's encoder stream. Triggers
    /// eviction. Returns the new entry so callers can pin it for any
    /// header block already waiting on it.
    pub fn insert(&mut self, name: Vec<u8>, value: Vec<u8>, abs_id: u64) -> Rc<Entry> {
        let entry = Entry::new(name, value, abs_id);
        self.push(entry.clone());
        self.evict();
        entry
    }

    pub fn duplicate(&mut self, source: &Rc<Entry>, new_abs_id: u64) -> Rc<Entry> {
        self.insert(source.name.to_vec(), source.value.to_vec(), new_abs_id)
    }

    pub fn set_max_capacity(&mut self, cap: usize) {
        self.max_capacity = cap;
        self.evict();
    }

    pub fn evict(&mut self) {
        while self.total_size > self.max_capacity && self.len > 0 {
            let front = self.buf[self.head].as_ref().unwrap();
            if is_pinned(front) {
                break;
            }
            let removed = self.buf[self.head].take().unwrap();
            self.total_size -= removed.size();
            self.head = (self.head + 1) % self.buf.len();
            self.len -= 1;
            self.base_abs_id = removed.abs_id + 1;
        }
    }
}
