// Copyright 2022 - 2024 Wenmeng See the COPYRIGHT
// file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
//
// Circular record of recently-seen field hashes, queried with a
// sentinel-terminated scan so a header never needs two separate passes.
// Shape follows `lsqpack.c`'s `qenc_hist_*` family: two parallel "seen"
// queries plus an "always yes" aggressive-indexing bypass, dispatched
// through a two-variant enum rather than a function-pointer hot path.

/// Growth increment when a single header block exceeds the window. A
/// heuristic, not a protocol requirement.
const HISTORY_GROW_STEP: usize = 4;

/// Circular `{name_hash, nameval_hash}` window with one extra slot that
/// always holds the in-progress query as a scan sentinel.
pub struct History {
    buf: Vec<(u64, u64)>,
    head: usize,
    filled: usize,
}

impl History {
    /// Window size is `max_table_size / 32`, floored at 1 slot.
    pub fn new(max_table_size: usize) -> Self {
        let cap = (max_table_size / 32).max(1);
        History { buf: vec![(0, 0); cap + 1], head: 0, filled: 0 }
    }

    fn cap(&self) -> usize {
        self.buf.len() - 1
    }

    fn tail(&self) -> usize {
        let len = self.buf.len();
        (self.head + len - self.filled) % len
    }

    /// Records a field as having been encoded.
    pub fn advance(&mut self, name_hash: u64, nameval_hash: u64) {
        self.buf[self.head] = (name_hash, nameval_hash);
        self.head = (self.head + 1) % self.buf.len();
        self.filled = (self.filled + 1).min(self.cap());
    }

    /// Writes `sentinel` into the free slot past the head, then scans
    /// from the tail forward. The scan always terminates: either a real
    /// entry matches first, or the sentinel itself does.
    fn scan(&mut self, sentinel: (u64, u64), matches: impl Fn((u64, u64)) -> bool) -> bool {
        self.buf[self.head] = sentinel;
        let len = self.buf.len();
        let mut idx = self.tail();
        loop {
            if matches(self.buf[idx]) {
                return idx != self.head;
            }
            if idx == self.head {
                return false;
            }
            idx = (idx + 1) % len;
        }
    }

    pub fn seen_nameval(&mut self, nameval_hash: u64) -> bool {
        self.scan((0, nameval_hash), |(_, nv)| nv == nameval_hash)
    }

    pub fn seen_name(&mut self, name_hash: u64) -> bool {
        self.scan((name_hash, 0), |(n, _)| n == name_hash)
    }

    /// Grows the window by [`HISTORY_GROW_STEP`] slots at a time until
    /// it can hold `needed` entries, flattening the circular layout in
    /// logical (oldest-first) order before extending it.
    pub fn grow_for_block(&mut self, needed: usize) {
        while self.cap() < needed {
            let new_cap = self.cap() + HISTORY_GROW_STEP;
            let tail = self.tail();
            let len = self.buf.len();
            let mut flattened = Vec::with_capacity(new_cap + 1);
            for i in 0..self.filled {
                flattened.push(self.buf[(tail + i) % len]);
            }
            flattened.resize(new_cap + 1, (0, 0));
            self.head = self.filled;
            self.buf = flattened;
        }
    }
}

/// Wraps [`History`] with the `IndexAggressive` bypass, which always
/// answers "seen" so every header is indexed from its first sighting.
pub enum EncoderHistory {
    Tracking(History),
    AlwaysYes,
}

impl EncoderHistory {
    pub fn new(max_table_size: usize, aggressive: bool) -> Self {
        if aggressive {
            EncoderHistory::AlwaysYes
        } else {
            EncoderHistory::Tracking(History::new(max_table_size))
        }
    }

    pub fn seen_nameval(&mut self, nameval_hash: u64) -> bool {
        match self {
            EncoderHistory::Tracking(h) => h.seen_nameval(nameval_hash),
            EncoderHistory::AlwaysYes => true,
        }
    }

    pub fn seen_name(&mut self, name_hash: u64) -> bool {
        match self {
            EncoderHistory::Tracking(h) => h.seen_name(name_hash),
            EncoderHistory::AlwaysYes => true,
        }
    }

    pub fn advance(&mut self, name_hash: u64, nameval_hash: u64) {
        if let EncoderHistory::Tracking(h) = self {
            h.advance(name_hash, nameval_hash);
        }
    }

    pub fn grow_for_block(&mut self, needed: usize) {
        if let EncoderHistory::Tracking(h) = self {
            h.grow_for_block(needed);
        }
    }
}
