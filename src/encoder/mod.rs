// Copyright 2022 - 2024 Wenmeng See the COPYRIGHT
// file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
//
// Encoder public API, grounded on `hpack::encoder::HpackEncoder`'s
// struct shape. Ties together the dynamic table, history tracker,
// header-info ledger, planner, and the two wire emitters.

pub mod block;
pub mod dynamic_table;
pub mod header_info;
pub mod history;
pub mod planner;
pub mod stream;

use std::collections::HashSet;

use bitflags::bitflags;
use log::{debug, trace, warn};

use crate::error::{ErrorContext, ErrorLocation, ProtocolError, QpackError, QpackResult};
use crate::static_table;
use crate::table::{hash_name, hash_name_value};
use dynamic_table::EncoderTable;
use header_info::HeaderInfoLedger;
use history::EncoderHistory;
use planner::{Decision, Signals};

/// `LSQPACK_MAX_DYN_TABLE_SIZE`.
pub const MAX_DYN_TABLE_SIZE: usize = (1 << 30) - 1;
/// `LSQPACK_MAX_MAX_RISKED_STREAMS`.
pub const MAX_MAX_RISKED_STREAMS: usize = (1 << 16) - 1;
/// `LSQPACK_LONGEST_TSU`: longest table-size-update instruction.
pub const LONGEST_TSU: usize = 6;

bitflags! {
    /// Encoder behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EncoderOpts: u8 {
        const SERVER            = 0b0001;
        const USE_DUP           = 0b0010;
        const INDEX_AGGRESSIVE  = 0b0100;
        const PREINITED         = 0b1000;
    }
}

pub struct EncoderConfig {
    pub max_table_size: usize,
    pub dyn_table_size: usize,
    pub max_risked_streams: usize,
    pub opts: EncoderOpts,
}

impl Default for EncoderConfig {
    /// `LSQPACK_DEF_DYN_TABLE_SIZE` / `LSQPACK_DEF_MAX_RISKED_STREAMS`:
    /// a fully non-indexing, non-risking codec until the caller opts in.
    fn default() -> Self {
        EncoderConfig {
            max_table_size: 0,
            dyn_table_size: 0,
            max_risked_streams: 0,
            opts: EncoderOpts::empty(),
        }
    }
}

fn ctx(location: ErrorLocation, stream_id: u64) -> ErrorContext {
    ErrorContext::new(location, line!(), 0, stream_id)
}

pub struct Encoder {
    table: EncoderTable,
    history: EncoderHistory,
    header_info: HeaderInfoLedger,
    opts: EncoderOpts,
    max_table_size: usize,
    max_risked_streams: usize,
    streams_at_risk: HashSet<u64>,
    bytes_in: u64,
    bytes_out: u64,
    cur_block: Option<usize>,
    cur_block_fields: usize,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder {
    /// An empty, unconfigured instance. Call [`Encoder::init`] before
    /// use.
    pub fn new() -> Self {
        Encoder {
            table: EncoderTable::new(0),
            history: EncoderHistory::new(1, false),
            header_info: HeaderInfoLedger::new(),
            opts: EncoderOpts::empty(),
            max_table_size: 0,
            max_risked_streams: 0,
            streams_at_risk: HashSet::new(),
            bytes_in: 0,
            bytes_out: 0,
            cur_block: None,
            cur_block_fields: 0,
        }
    }

    pub fn init(&mut self, cfg: EncoderConfig, tsu_out: &mut Vec<u8>) -> QpackResult<()> {
        if cfg.max_table_size > MAX_DYN_TABLE_SIZE || cfg.dyn_table_size > MAX_DYN_TABLE_SIZE {
            return Err(QpackError::Protocol(ProtocolError::CapacityTooLarge, ctx(ErrorLocation::EncStream, 0)));
        }
        if cfg.max_risked_streams > MAX_MAX_RISKED_STREAMS {
            return Err(QpackError::Protocol(ProtocolError::CapacityTooLarge, ctx(ErrorLocation::EncStream, 0)));
        }
        self.max_table_size = cfg.max_table_size;
        self.max_risked_streams = cfg.max_risked_streams;
        self.opts = cfg.opts;
        self.history = EncoderHistory::new(cfg.max_table_size.max(1), cfg.opts.contains(EncoderOpts::INDEX_AGGRESSIVE));
        self.table = EncoderTable::new(cfg.dyn_table_size);
        if cfg.dyn_table_size < cfg.max_table_size {
            stream::emit_capacity(tsu_out, cfg.dyn_table_size as u64);
        }
        debug!("qpack encoder init: max_table_size={} dyn_table_size={}", cfg.max_table_size, cfg.dyn_table_size);
        Ok(())
    }

    pub fn set_max_capacity(&mut self, cap: usize, tsu_out: &mut Vec<u8>) -> QpackResult<()> {
        if cap > self.max_table_size {
            return Err(QpackError::Protocol(ProtocolError::CapacityTooLarge, ctx(ErrorLocation::EncStream, 0)));
        }
        stream::emit_capacity(tsu_out, cap as u64);
        self.table.set_max_capacity(cap);
        debug!("qpack encoder capacity change: {}", cap);
        Ok(())
    }

    fn max_entries(&self) -> u64 {
        (self.table.max_capacity() / 32).max(1) as u64
    }

    /// `StartHeader(stream_id, seqno)`.
    pub fn start_header(&mut self, stream_id: u64, seqno: u64) -> usize {
        let base_idx = self.table.ins_count();
        let id = self.header_info.start_header(stream_id, seqno, base_idx, self.table.max_acked_id());
        self.cur_block = Some(id);
        self.cur_block_fields = 0;
        id
    }

    fn current_block_risked(&self) -> bool {
        match self.cur_block.and_then(|id| self.header_info.get(id)) {
            Some(info) => info.ids_set && info.max_id > self.table.max_acked_id(),
            None => false,
        }
    }

    /// `Encode(name, value, flags)`: plans and emits one field, writing
    /// into the caller's encoder-stream and header-block buffers.
    pub fn encode(
        &mut self,
        name: &[u8],
        value: &[u8],
        never_index: bool,
        enc_buf: &mut Vec<u8>,
        enc_budget: usize,
        hea_buf: &mut Vec<u8>,
        hea_budget: usize,
    ) -> QpackResult<()> {
        let cur_id = self.cur_block.expect("encode called without an open header block");
        let stream_id = self.header_info.get(cur_id).unwrap().stream_id;
        self.bytes_in += (name.len() + value.len()) as u64;

        self.cur_block_fields += 1;
        self.history.grow_for_block(self.cur_block_fields);

        let name_hash = hash_name(name);
        let nameval_hash = hash_name_value(name, value);
        let entry_size = 32 + name.len() + value.len();

        let (static_full, static_name) = match (std::str::from_utf8(name), std::str::from_utf8(value)) {
            (Ok(n), Ok(v)) => (static_table::find_full(n, v), static_table::find_name(n)),
            (Ok(n), Err(_)) => (None, static_table::find_name(n)),
            _ => (None, None),
        };

        let dyn_full_raw = self.table.find_full_candidates(name, value, nameval_hash);
        let drain_idx = self.table.drain_idx();
        let max_acked_id = self.table.max_acked_id();
        let risk_allowed_now = planner::risk_allowed(
            self.current_block_risked(),
            self.header_info.get(cur_id).map(|i| i.others_at_risk).unwrap_or(false),
            self.streams_at_risk.len(),
            self.max_risked_streams,
        );
        // Entries below DrainIdx are about to be evicted and must never be
        // cited even if still physically present; the risk/ack gate is the
        // same one `dyn_name` is filtered by below.
        let dyn_full: Vec<_> = dyn_full_raw
            .iter()
            .filter(|e| e.abs_id >= drain_idx && (risk_allowed_now || e.abs_id <= max_acked_id))
            .cloned()
            .collect();
        let full_candidate_excluded = !dyn_full_raw.is_empty() && dyn_full.is_empty();
        let dyn_name: Vec<_> = self
            .table
            .find_name_candidates(name, name_hash)
            .into_iter()
            .filter(|e| e.abs_id >= drain_idx && (risk_allowed_now || e.abs_id <= max_acked_id))
            .collect();

        let duplicable = dyn_full
            .iter()
            .find(|e| self.table.is_duplicable(e, self.opts.contains(EncoderOpts::USE_DUP)))
            .cloned();

        let seen_nameval = self.history.seen_nameval(nameval_hash);
        let seen_name = self.history.seen_name(name_hash);

        let signals = Signals {
            static_full,
            dyn_full,
            full_candidate_excluded,
            static_name,
            dyn_name,
            seen_nameval,
            seen_name,
            risk_allowed: risk_allowed_now,
            has_room_full: self.table.has_room(entry_size),
            indexing_enabled: !never_index,
            duplicable,
            max_acked_id,
            drain_idx,
        };

        let mut decision = planner::decide(&signals);

        // Double-literal guardrail: once the ratio gets this bad, stop
        // writing to both streams at once and fall back to a plain literal.
        if decision.is_double_literal() && self.ratio() > 0.95 {
            let forced = Signals { indexing_enabled: false, ..rebuild_signals(&signals) };
            decision = planner::decide(&forced);
        }

        self.history.advance(name_hash, nameval_hash);

        let base_idx = self.header_info.get(cur_id).unwrap().base_idx;
        self.apply_decision(cur_id, stream_id, decision, name, value, never_index, base_idx, enc_buf, enc_budget, hea_buf, hea_budget)
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_decision(
        &mut self,
        cur_id: usize,
        stream_id: u64,
        decision: Decision,
        name: &[u8],
        value: &[u8],
        never_index: bool,
        base_idx: u64,
        enc_buf: &mut Vec<u8>,
        enc_budget: usize,
        hea_buf: &mut Vec<u8>,
        hea_budget: usize,
    ) -> QpackResult<()> {
        match decision {
            Decision::StaticFull { idx } => {
                self.check_hea_budget(hea_buf, hea_budget, block::len_indexed_static(idx as u64))?;
                block::emit_indexed_static(hea_buf, idx as u64);
                trace!("qpack encode: static full match idx={}", idx);
            }
            Decision::DynFullReuse { entry } => {
                let len = if entry.abs_id <= base_idx {
                    block::len_indexed_dynamic_pre_base(base_idx, entry.abs_id)
                } else {
                    block::len_indexed_post_base(base_idx, entry.abs_id)
                };
                self.check_hea_budget(hea_buf, hea_budget, len)?;
                if entry.abs_id <= base_idx {
                    block::emit_indexed_dynamic_pre_base(hea_buf, base_idx, entry.abs_id);
                } else {
                    block::emit_indexed_post_base(hea_buf, base_idx, entry.abs_id);
                }
                self.note_risk(cur_id, stream_id, entry.abs_id);
                self.header_info.get_mut(cur_id).unwrap().pin(entry);
            }
            Decision::DynFullDuplicate { entry } => {
                let relative_index = self.table.ins_count() - entry.abs_id;
                let dup_len = stream::len_duplicate(relative_index);
                self.check_enc_budget(enc_buf, enc_budget, dup_len)?;
                let new_entry = self.table.duplicate(&entry);
                stream::emit_duplicate(enc_buf, relative_index);
                let hea_len = block::len_indexed_post_base(base_idx, new_entry.abs_id);
                self.check_hea_budget(hea_buf, hea_budget, hea_len)?;
                block::emit_indexed_post_base(hea_buf, base_idx, new_entry.abs_id);
                self.note_risk(cur_id, stream_id, new_entry.abs_id);
                self.header_info.get_mut(cur_id).unwrap().pin(new_entry);
                debug!("qpack encoder: duplicated entry {}", entry.abs_id);
            }
            Decision::StaticNameLiteral { idx } => {
                let len = block::len_lit_with_name_static(idx as u64, value);
                self.check_hea_budget(hea_buf, hea_budget, len)?;
                block::emit_lit_with_name_static(hea_buf, idx as u64, value, never_index);
            }
            Decision::StaticNameInsert { idx } => {
                let enc_len = stream::len_insert_with_name_ref(idx as u64, value);
                self.check_enc_budget(enc_buf, enc_budget, enc_len)?;
                let entry = self.table.insert(name.to_vec(), value.to_vec());
                stream::emit_insert_with_name_ref(enc_buf, true, idx as u64, value);
                let hea_len = block::len_lit_with_name_new(base_idx, entry.abs_id, value);
                self.check_hea_budget(hea_buf, hea_budget, hea_len)?;
                block::emit_lit_with_name_new(hea_buf, base_idx, entry.abs_id, value);
                self.note_risk(cur_id, stream_id, entry.abs_id);
                self.header_info.get_mut(cur_id).unwrap().pin(entry);
            }
            Decision::DynNameLiteral { entry } => {
                let len = block::len_lit_with_name_dynamic(base_idx, entry.abs_id, value);
                self.check_hea_budget(hea_buf, hea_budget, len)?;
                block::emit_lit_with_name_dynamic(hea_buf, base_idx, entry.abs_id, value, never_index);
                self.note_risk(cur_id, stream_id, entry.abs_id);
                self.header_info.get_mut(cur_id).unwrap().pin(entry);
            }
            Decision::DynNameInsert { entry } => {
                let name_rel = self.table.ins_count() - entry.abs_id;
                let enc_len = stream::len_insert_with_name_ref(name_rel, value);
                self.check_enc_budget(enc_buf, enc_budget, enc_len)?;
                let new_entry = self.table.insert(name.to_vec(), value.to_vec());
                stream::emit_insert_with_name_ref(enc_buf, false, name_rel, value);
                let hea_len = block::len_lit_with_name_new(base_idx, new_entry.abs_id, value);
                self.check_hea_budget(hea_buf, hea_budget, hea_len)?;
                block::emit_lit_with_name_new(hea_buf, base_idx, new_entry.abs_id, value);
                self.note_risk(cur_id, stream_id, new_entry.abs_id);
                self.header_info.get_mut(cur_id).unwrap().pin(new_entry);
            }
            Decision::FullInsert => {
                let enc_len = stream::len_insert_without_name_ref(name, value);
                self.check_enc_budget(enc_buf, enc_budget, enc_len)?;
                let entry = self.table.insert(name.to_vec(), value.to_vec());
                stream::emit_insert_without_name_ref(enc_buf, name, value);
                let hea_len = block::len_indexed_post_base(base_idx, entry.abs_id);
                self.check_hea_budget(hea_buf, hea_budget, hea_len)?;
                block::emit_indexed_post_base(hea_buf, base_idx, entry.abs_id);
                self.note_risk(cur_id, stream_id, entry.abs_id);
                self.header_info.get_mut(cur_id).unwrap().pin(entry);
            }
            Decision::NameOnlyInsert => {
                let enc_len = stream::len_insert_without_name_ref(name, value);
                self.check_enc_budget(enc_buf, enc_budget, enc_len)?;
                self.table.insert(name.to_vec(), value.to_vec());
                stream::emit_insert_without_name_ref(enc_buf, name, value);
                let hea_len = block::len_literal(name, value);
                self.check_hea_budget(hea_buf, hea_budget, hea_len)?;
                block::emit_literal(hea_buf, name, value, never_index);
            }
            Decision::Literal => {
                let len = block::len_literal(name, value);
                self.check_hea_budget(hea_buf, hea_budget, len)?;
                block::emit_literal(hea_buf, name, value, never_index);
            }
        }
        self.bytes_out += (hea_buf.len() + enc_buf.len()) as u64;
        Ok(())
    }

    fn note_risk(&mut self, cur_id: usize, stream_id: u64, abs_id: u64) {
        if abs_id > self.table.max_acked_id() {
            self.streams_at_risk.insert(stream_id);
        }
        let _ = cur_id;
    }

    fn check_enc_budget(&self, buf: &Vec<u8>, budget: usize, additional: usize) -> QpackResult<()> {
        if buf.len() + additional > budget {
            return Err(QpackError::NoBufEnc);
        }
        Ok(())
    }

    fn check_hea_budget(&self, buf: &Vec<u8>, budget: usize, additional: usize) -> QpackResult<()> {
        if buf.len() + additional > budget {
            return Err(QpackError::NoBufHead);
        }
        Ok(())
    }

    /// `EndHeader(buf)`: writes the Header Data Prefix and, if the block
    /// touched no dynamic entries, frees the header info immediately.
    pub fn end_header(&mut self, buf: &mut Vec<u8>) -> QpackResult<usize> {
        let id = self.cur_block.take().expect("end_header called without an open header block");
        let info = self.header_info.get(id).unwrap();
        let start_len = buf.len();
        if !info.ids_set {
            block::emit_empty_prefix(buf);
            self.header_info.free(id);
        } else {
            let max_entries = self.max_entries();
            block::emit_prefix(buf, info.max_id, info.base_idx, max_entries);
            debug!("qpack end_header: stream={} base_idx={} max_id={}", info.stream_id, info.base_idx, info.max_id);
        }
        Ok(buf.len() - start_len)
    }

    /// `CancelHeader`: only legal if no dynamic entries were touched.
    pub fn cancel_header(&mut self) -> QpackResult<()> {
        let id = self.cur_block.take().expect("cancel_header called without an open header block");
        let touched = self.header_info.get(id).map(|i| i.ids_set).unwrap_or(false);
        if touched {
            self.cur_block = Some(id);
            return Err(QpackError::Protocol(
                ProtocolError::BadIndex,
                ctx(ErrorLocation::HeaderBlock, self.header_info.get(id).unwrap().stream_id),
            ));
        }
        self.header_info.free(id);
        Ok(())
    }

    /// `DecoderStreamIn(bytes)`: processes the peer's decoder stream.
    pub fn decoder_stream_in(&mut self, bytes: &[u8]) -> QpackResult<()> {
        let mut i = 0;
        while i < bytes.len() {
            let first = bytes[i];
            if first & 0x80 != 0 {
                let (stream_id, consumed) = crate::varint::decode(&bytes[i..], 7)
                    .map_err(|_| QpackError::Protocol(ProtocolError::IntegerOverflow, ctx(ErrorLocation::DecStream, 0)))?;
                i += consumed;
                self.section_ack(stream_id);
            } else if first & 0x40 != 0 {
                let (stream_id, consumed) = crate::varint::decode(&bytes[i..], 6)
                    .map_err(|_| QpackError::Protocol(ProtocolError::IntegerOverflow, ctx(ErrorLocation::DecStream, 0)))?;
                i += consumed;
                self.header_info.cancel_stream(stream_id);
            } else {
                let (count, consumed) = crate::varint::decode(&bytes[i..], 6)
                    .map_err(|_| QpackError::Protocol(ProtocolError::IntegerOverflow, ctx(ErrorLocation::DecStream, 0)))?;
                i += consumed;
                let new_acked = self.table.last_tss() + count;
                if new_acked > self.table.ins_count() {
                    return Err(QpackError::Protocol(ProtocolError::BadTss, ctx(ErrorLocation::DecStream, 0)));
                }
                self.table.advance_acked_id(new_acked);
                self.table.set_last_tss(new_acked);
            }
        }
        Ok(())
    }

    fn section_ack(&mut self, stream_id: u64) {
        if let Some(id) = self.header_info.lowest_seqno_for_stream(stream_id) {
            let max_id = self.header_info.get(id).unwrap().max_id;
            if max_id > self.table.max_acked_id() {
                self.table.advance_acked_id(max_id);
            }
            self.streams_at_risk.remove(&stream_id);
            self.header_info.free(id);
        } else {
            warn!("qpack encoder: section-ack for unknown stream {}", stream_id);
        }
    }

    /// `Ratio()`: running compression ratio, output/input.
    pub fn ratio(&self) -> f64 {
        if self.bytes_in == 0 {
            0.0
        } else {
            1.0 - (self.bytes_out as f64 / self.bytes_in as f64)
        }
    }

    /// `HeaderDataPrefixSize()`: worst-case prefix size for a block that
    /// references the table at all (8-bit + 7-bit varints, each up to
    /// `MAX_VARINT_LEN`).
    pub fn header_data_prefix_size(&self) -> usize {
        2 * crate::varint::MAX_VARINT_LEN
    }
}

fn rebuild_signals(s: &Signals) -> Signals {
    Signals {
        static_full: s.static_full,
        dyn_full: s.dyn_full.clone(),
        full_candidate_excluded: s.full_candidate_excluded,
        static_name: s.static_name,
        dyn_name: s.dyn_name.clone(),
        seen_nameval: s.seen_nameval,
        seen_name: s.seen_name,
        risk_allowed: s.risk_allowed,
        has_room_full: s.has_room_full,
        indexing_enabled: s.indexing_enabled,
        duplicable: s.duplicable.clone(),
        max_acked_id: s.max_acked_id,
        drain_idx: s.drain_idx,
    }
}
