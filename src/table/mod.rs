// Copyright 2022 - 2024 Wenmeng See the COPYRIGHT
// file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
//
// Shared dynamic-table entry type used by both the encoder's and the
// decoder's tables. Grounded on `hpack::header_index::HeaderIndex`'s
// element shape, generalized with absolute IDs and cached hashes and
// given `Rc` shared ownership so the refcounting a table entry needs
// (shared between the table and every header set / header info that
// references it) comes from the language rather than a hand-rolled
// counter.

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash, Hasher};
use std::rc::Rc;

use lazy_static::lazy_static;

lazy_static! {
    /// Process-local hash seed, to thwart hash-flooding attacks against
    /// the name/name-value indices.
    static ref HASH_SEED: RandomState = RandomState::new();
}

pub(crate) fn hash_name(name: &[u8]) -> u64 {
    let mut h = HASH_SEED.build_hasher();
    name.hash(&mut h);
    h.finish()
}

pub(crate) fn hash_name_value(name: &[u8], value: &[u8]) -> u64 {
    let mut h = HASH_SEED.build_hasher();
    name.hash(&mut h);
    0xffu8.hash(&mut h); // separator: avoids ("ab","c") colliding with ("a","bc")
    value.hash(&mut h);
    h.finish()
}

/// A single dynamic-table entry. Size is `32 + name.len() + value.len()`
/// per RFC 9204 §3.2.1's accounting rule.
#[derive(Debug)]
pub struct Entry {
    pub name: Box<[u8]>,
    pub value: Box<[u8]>,
    pub abs_id: u64,
    pub name_hash: u64,
    pub nameval_hash: u64,
}

impl Entry {
    pub fn new(name: Vec<u8>, value: Vec<u8>, abs_id: u64) -> Rc<Entry> {
        let name_hash = hash_name(&name);
        let nameval_hash = hash_name_value(&name, &value);
        Rc::new(Entry {
            name: name.into_boxed_slice(),
            value: value.into_boxed_slice(),
            abs_id,
            name_hash,
            nameval_hash,
        })
    }

    pub fn size(&self) -> usize {
        32 + self.name.len() + self.value.len()
    }
}

/// Live references from outstanding header blocks, derived from the
/// `Rc` strong count rather than a hand-maintained counter: the table
/// itself holds one strong reference, so any extra holder is a pin.
pub fn ref_count(entry: &Rc<Entry>) -> usize {
    Rc::strong_count(entry) - 1
}

pub fn is_pinned(entry: &Rc<Entry>) -> bool {
    ref_count(entry) > 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_accounts_for_32_byte_overhead() {
        let e = Entry::new(b"name".to_vec(), b"value".to_vec(), 1);
        assert_eq!(e.size(), 32 + 4 + 5);
    }

    #[test]
    fn ref_count_tracks_extra_clones() {
        let e = Entry::new(b"a".to_vec(), b"b".to_vec(), 1);
        assert_eq!(ref_count(&e), 0);
        assert!(!is_pinned(&e));
        let pin = e.clone();
        assert_eq!(ref_count(&e), 1);
        assert!(is_pinned(&e));
        drop(pin);
        assert_eq!(ref_count(&e), 0);
    }

    #[test]
    fn separator_prevents_name_value_boundary_collision() {
        let a = Entry::new(b"ab".to_vec(), b"c".to_vec(), 1);
        let b = Entry::new(b"a".to_vec(), b"bc".to_vec(), 2);
        assert_ne!(a.nameval_hash, b.nameval_hash);
    }
}
