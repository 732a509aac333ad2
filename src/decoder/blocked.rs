// Copyright 2022 - 2024 Wenmeng See the COPYRIGHT
// file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
//
// Blocking queue for header blocks waiting on a future dynamic-table
// insertion. Grounded on `lsqpack.c`'s bucket array keyed by
// `LSQPACK_DEC_BLOCKED_BITS = 3` low bits of `LargestRef`.

use std::collections::VecDeque;

const BLOCKED_BITS: u32 = 3;
const BUCKET_COUNT: usize = 1 << BLOCKED_BITS;

/// One parked header block, identified by the opaque handle the caller
/// (`decoder::mod`) uses to look its `BlockReader` back up.
struct Parked<H> {
    handle: H,
    largest_ref: u64,
}

/// Bucket array of FIFO lists keyed by `largest_ref & (BUCKET_COUNT-1)`.
pub struct BlockedQueue<H> {
    buckets: [VecDeque<Parked<H>>; BUCKET_COUNT],
    count: usize,
    max_blocked: usize,
}

impl<H> BlockedQueue<H> {
    pub fn new(max_blocked: usize) -> Self {
        BlockedQueue { buckets: Default::default(), count: 0, max_blocked }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Admits a context to the queue. Returns `false` (and does not
    /// enqueue) if the queue is already at `max_blocked` - the caller
    /// must then fail the header block outright rather than park it.
    pub fn admit(&mut self, handle: H, largest_ref: u64) -> bool {
        if self.count >= self.max_blocked {
            return false;
        }
        let bucket = (largest_ref as usize) & (BUCKET_COUNT - 1);
        self.buckets[bucket].push_back(Parked { handle, largest_ref });
        self.count += 1;
        true
    }

    /// Called after an insertion bumps the table's `LastId` to `last_id`.
    /// Drains every parked context whose `largest_ref == last_id` from
    /// the bucket `last_id & (BUCKET_COUNT-1)` and returns their handles
    /// for the caller to resume.
    pub fn unblock(&mut self, last_id: u64) -> Vec<H> {
        let bucket = (last_id as usize) & (BUCKET_COUNT - 1);
        let mut ready = Vec::new();
        let mut still_waiting = VecDeque::new();
        for parked in self.buckets[bucket].drain(..) {
            if parked.largest_ref == last_id {
                ready.push(parked.handle);
            } else {
                still_waiting.push_back(parked);
            }
        }
        self.count -= ready.len();
        self.buckets[bucket] = still_waiting;
        ready
    }
}

impl<H> Default for BlockedQueue<H> {
    fn default() -> Self {
        Self::new(usize::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_is_capped_by_max_blocked() {
        let mut q: BlockedQueue<u32> = BlockedQueue::new(1);
        assert!(q.admit(1, 5));
        assert!(!q.admit(2, 6));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn unblock_only_matches_exact_largest_ref() {
        let mut q: BlockedQueue<u32> = BlockedQueue::new(16);
        q.admit(1, 5);
        q.admit(2, 5 + BUCKET_COUNT as u64); // same bucket, different largest_ref
        let ready = q.unblock(5);
        assert_eq!(ready, vec![1]);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn unblock_drains_every_match_in_bucket() {
        let mut q: BlockedQueue<u32> = BlockedQueue::new(16);
        q.admit(1, 5);
        q.admit(2, 5);
        let ready = q.unblock(5);
        assert_eq!(ready.len(), 2);
        assert!(q.is_empty());
    }
}
