// Copyright 2022 - 2024 Wenmeng See the COPYRIGHT
// file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
//
// Encoder planner: the decision tree choosing how to represent one field
// line, grounded on `lsqpack_enc_encode`'s branch structure in
// `lsqpack.c`. This module is deliberately pure: it consumes
// pre-looked-up candidates and booleans and returns a [`Decision`]
// describing what to do; `encoder::mod` performs the actual table
// mutation, pinning, and wire emission so this file stays a single
// readable decision tree instead of threading mutable
// table/history/header-info state through every branch.
//
// The static-name-match step's third decision axis is whether a
// nameval full-match candidate existed in step 2 but was excluded there
// by drain/risk/ack gating (`Signals::full_candidate_excluded`), not
// whether a dynamic name-only candidate exists: inserting a second,
// redundant name+value entry when one already sits in the table
// (merely unusable right now) is never worthwhile. Once a static name
// hit exists the decision is always made here; it never falls through
// to the dynamic name bucket (step 4), which only runs when there was
// no static name match at all.

use std::rc::Rc;

use crate::table::Entry;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RefFlags: u8 {
        const REF_FOUND = 0b01;
        const REF_NEW   = 0b10;
    }
}

/// Inputs the decision tree needs, already resolved by the caller
/// against the dynamic table, history, and risk bookkeeping.
pub struct Signals {
    pub static_full: Option<u32>,
    /// 0-2 candidates sharing a nameval hash bucket, oldest first,
    /// already filtered by `id >= DrainIdx` and `(risk_allowed or
    /// id <= MaxAckedId)` the same way `dyn_name` is.
    pub dyn_full: Vec<Rc<Entry>>,
    /// True when a nameval-hash full-match candidate existed before
    /// that filtering ran but was excluded by it - a full match exists
    /// in the table, just not one this block may reference yet.
    pub full_candidate_excluded: bool,
    pub static_name: Option<u32>,
    /// Candidates sharing a name hash bucket, already filtered by
    /// `id >= DrainIdx` and `(risk_allowed or id <= MaxAckedId)`.
    pub dyn_name: Vec<Rc<Entry>>,
    pub seen_nameval: bool,
    pub seen_name: bool,
    pub risk_allowed: bool,
    pub has_room_full: bool,
    pub indexing_enabled: bool,
    pub duplicable: Option<Rc<Entry>>,
    pub max_acked_id: u64,
    /// Lowest absolute id this block may still reference; entries below
    /// it are draining and must not be cited even if still present.
    pub drain_idx: u64,
}

pub enum Decision {
    /// `(None, IndexedStat, NoOp)`.
    StaticFull { idx: u32 },
    /// `(None, IndexedDyn, NoOp, RefFound)`.
    DynFullReuse { entry: Rc<Entry> },
    /// `(Dup, IndexedNew, NewEntry, RefFound|RefNew)`.
    DynFullDuplicate { entry: Rc<Entry> },
    /// `(None, LitWithNameStat, NoOp, RefFound)`.
    StaticNameLiteral { idx: u32 },
    /// `(InsNameRefStatic, LitWithNameNew, NewEntry, RefNew)`.
    StaticNameInsert { idx: u32 },
    /// `(None, LitWithNameDyn, NoOp, RefFound)`.
    DynNameLiteral { entry: Rc<Entry> },
    /// `(InsNameRefDynamic, LitWithNameNew, NewEntry, RefNew|RefFound)`.
    DynNameInsert { entry: Rc<Entry> },
    /// `(InsLit, IndexedNew, NewEntry, RefNew)`.
    FullInsert,
    /// `(InsLitName, LitWithNameNew or Lit, NewEntryNameOnly, RefNew)`.
    NameOnlyInsert,
    /// `(None, Lit, NoOp)`.
    Literal,
}

impl Decision {
    pub fn ref_flags(&self) -> RefFlags {
        match self {
            Decision::StaticFull { .. } | Decision::Literal => RefFlags::empty(),
            Decision::DynFullReuse { .. }
            | Decision::StaticNameLiteral { .. }
            | Decision::DynNameLiteral { .. } => RefFlags::REF_FOUND,
            Decision::DynFullDuplicate { .. } | Decision::DynNameInsert { .. } => {
                RefFlags::REF_FOUND | RefFlags::REF_NEW
            }
            Decision::StaticNameInsert { .. }
            | Decision::FullInsert
            | Decision::NameOnlyInsert => RefFlags::REF_NEW,
        }
    }

    /// Would this plan write a literal on *both* the encoder stream and
    /// the header block?
    pub fn is_double_literal(&self) -> bool {
        matches!(self, Decision::FullInsert | Decision::NameOnlyInsert)
    }
}

/// Picks one of the 1-2 candidates sharing a nameval bucket per step 2's
/// rule: if risk is disallowed, prefer the already-acknowledged one;
/// otherwise prefer the newer one.
fn pick_full_candidate(candidates: &[Rc<Entry>], risk_allowed: bool, max_acked_id: u64) -> Rc<Entry> {
    if candidates.len() == 1 {
        return candidates[0].clone();
    }
    if !risk_allowed {
        if let Some(acked) = candidates.iter().find(|e| e.abs_id <= max_acked_id) {
            return acked.clone();
        }
    }
    candidates
        .iter()
        .max_by_key(|e| e.abs_id)
        .cloned()
        .unwrap_or_else(|| candidates[0].clone())
}

pub fn decide(s: &Signals) -> Decision {
    // 1. Static full match.
    if let Some(idx) = s.static_full {
        return Decision::StaticFull { idx };
    }

    // 2. Dynamic full match. The caller has already excluded any
    // candidate with `id < drain_idx` or that fails the risk/ack gate
    // (same filter `dyn_name` gets) - an empty `dyn_full` here means
    // either no full match exists, or one exists but none qualified
    // (`full_candidate_excluded`), and either way we fall through.
    debug_assert!(s.dyn_full.iter().all(|e| e.abs_id >= s.drain_idx));
    if !s.dyn_full.is_empty() {
        if s.dyn_full.len() == 1 {
            let entry = s.dyn_full[0].clone();
            if s.duplicable.as_ref().map(|d| Rc::ptr_eq(d, &entry)).unwrap_or(false) {
                return Decision::DynFullDuplicate { entry };
            }
            return Decision::DynFullReuse { entry };
        }
        let entry = pick_full_candidate(&s.dyn_full, s.risk_allowed, s.max_acked_id);
        return Decision::DynFullReuse { entry };
    }

    // 3. Static name match. Always decided here once a static name hit
    // exists - it never falls through to step 4. Inserting a new
    // name+value entry is skipped when one already exists in the table
    // but was excluded from step 2 (`full_candidate_excluded`), since a
    // second entry for the same pair would be redundant.
    if let Some(idx) = s.static_name {
        if s.seen_nameval
            && s.risk_allowed
            && s.indexing_enabled
            && s.has_room_full
            && !s.full_candidate_excluded
        {
            return Decision::StaticNameInsert { idx };
        }
        return Decision::StaticNameLiteral { idx };
    }

    // 4. Dynamic name match.
    if !s.dyn_name.is_empty() {
        let entry = s.dyn_name.iter().max_by_key(|e| e.abs_id).cloned().unwrap();
        if s.seen_nameval && s.has_room_full {
            return Decision::DynNameInsert { entry };
        }
        return Decision::DynNameLiteral { entry };
    }

    // 5. No match.
    if s.indexing_enabled && s.seen_nameval && s.has_room_full {
        if s.risk_allowed {
            return Decision::FullInsert;
        }
        return Decision::Literal;
    }
    if s.indexing_enabled && s.seen_name && s.has_room_full {
        return Decision::NameOnlyInsert;
    }
    Decision::Literal
}

/// Risk gate: may this block reference unacknowledged entries?
pub fn risk_allowed(
    block_already_risked: bool,
    other_block_on_stream_at_risk: bool,
    streams_at_risk: usize,
    max_risked_streams: usize,
) -> bool {
    block_already_risked || other_block_on_stream_at_risk || streams_at_risk < max_risked_streams
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Entry;

    fn entry(id: u64) -> Rc<Entry> {
        Entry::new(b"x-test".to_vec(), b"v".to_vec(), id)
    }

    fn base_signals() -> Signals {
        Signals {
            static_full: None,
            dyn_full: Vec::new(),
            full_candidate_excluded: false,
            static_name: None,
            dyn_name: Vec::new(),
            seen_nameval: false,
            seen_name: false,
            risk_allowed: true,
            has_room_full: true,
            indexing_enabled: true,
            duplicable: None,
            max_acked_id: 0,
            drain_idx: 0,
        }
    }

    #[test]
    fn static_full_match_wins_immediately() {
        let mut s = base_signals();
        s.static_full = Some(17);
        s.dyn_full.push(entry(1));
        match decide(&s) {
            Decision::StaticFull { idx } => assert_eq!(idx, 17),
            _ => panic!("expected StaticFull"),
        }
    }

    #[test]
    fn single_dynamic_full_candidate_is_reused() {
        let mut s = base_signals();
        s.dyn_full.push(entry(3));
        match decide(&s) {
            Decision::DynFullReuse { entry } => assert_eq!(entry.abs_id, 3),
            _ => panic!("expected DynFullReuse"),
        }
    }

    #[test]
    fn excluded_full_candidate_falls_through_to_static_name() {
        // The caller already filtered the unacked/unrisked candidate out
        // of dyn_full (so it is empty here) but recorded that one existed.
        let mut s = base_signals();
        s.full_candidate_excluded = true;
        s.static_name = Some(9);
        match decide(&s) {
            Decision::StaticNameLiteral { idx } => assert_eq!(idx, 9),
            _ => panic!("expected fallthrough to static name match"),
        }
    }

    #[test]
    fn excluded_full_candidate_blocks_static_name_insert() {
        let mut s = base_signals();
        s.full_candidate_excluded = true;
        s.static_name = Some(9);
        s.seen_nameval = true;
        match decide(&s) {
            Decision::StaticNameLiteral { idx } => assert_eq!(idx, 9),
            _ => panic!("expected StaticNameLiteral, not a redundant insert"),
        }
    }

    #[test]
    fn duplicable_full_candidate_triggers_duplicate() {
        let mut s = base_signals();
        let e = entry(2);
        s.dyn_full.push(e.clone());
        s.duplicable = Some(e);
        match decide(&s) {
            Decision::DynFullDuplicate { entry } => assert_eq!(entry.abs_id, 2),
            _ => panic!("expected DynFullDuplicate"),
        }
    }

    #[test]
    fn static_name_with_seen_nameval_and_risk_inserts() {
        let mut s = base_signals();
        s.static_name = Some(4);
        s.seen_nameval = true;
        match decide(&s) {
            Decision::StaticNameInsert { idx } => assert_eq!(idx, 4),
            _ => panic!("expected StaticNameInsert"),
        }
    }

    #[test]
    fn static_name_without_seen_nameval_is_literal_only() {
        let mut s = base_signals();
        s.static_name = Some(4);
        match decide(&s) {
            Decision::StaticNameLiteral { idx } => assert_eq!(idx, 4),
            _ => panic!("expected StaticNameLiteral"),
        }
    }

    #[test]
    fn static_name_hit_is_decided_even_with_a_dynamic_name_candidate() {
        // A dynamic name-only candidate must not divert the decision away
        // from the static name match - step 3 always executes here.
        let mut s = base_signals();
        s.static_name = Some(4);
        s.seen_nameval = true;
        s.dyn_name.push(entry(6));
        match decide(&s) {
            Decision::StaticNameInsert { idx } => assert_eq!(idx, 4),
            _ => panic!("expected StaticNameInsert, not a fallthrough to the dynamic name bucket"),
        }
    }

    #[test]
    fn dynamic_name_match_only_considered_without_a_static_name_hit() {
        let mut s = base_signals();
        s.seen_nameval = true;
        s.dyn_name.push(entry(6));
        match decide(&s) {
            Decision::DynNameInsert { entry } => assert_eq!(entry.abs_id, 6),
            _ => panic!("expected DynNameInsert"),
        }
    }

    #[test]
    fn no_match_with_room_and_risk_inserts_full_entry() {
        let mut s = base_signals();
        s.seen_nameval = true;
        match decide(&s) {
            Decision::FullInsert => {}
            _ => panic!("expected FullInsert"),
        }
    }

    #[test]
    fn no_match_without_risk_stays_literal() {
        let mut s = base_signals();
        s.seen_nameval = true;
        s.risk_allowed = false;
        match decide(&s) {
            Decision::Literal => {}
            _ => panic!("expected Literal"),
        }
    }

    #[test]
    fn no_match_name_only_seen_inserts_name_only() {
        let mut s = base_signals();
        s.seen_name = true;
        match decide(&s) {
            Decision::NameOnlyInsert => {}
            _ => panic!("expected NameOnlyInsert"),
        }
    }

    #[test]
    fn risk_gate_allows_when_sibling_already_risked() {
        assert!(risk_allowed(false, true, 5, 1));
        assert!(!risk_allowed(false, false, 5, 1));
        assert!(risk_allowed(false, false, 0, 1));
    }
}
