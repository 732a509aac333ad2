// Copyright 2022 - 2024 Wenmeng See the COPYRIGHT
// file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
//
// The decoder's public API, tying together the decoder dynamic table,
// the encoder-stream parser, the header-block parser, the blocking
// queue, and the control emitter.
// Grounded on `hpack::decoder::Decoder`'s public shape (`decode_with_cb`
// as a single call), generalized into the resumable `HeaderIn`/
// `HeaderRead` pair this format's blocking model requires.

pub mod block;
pub mod blocked;
pub mod control;
pub mod dynamic_table;
pub mod enc_stream;

use std::collections::HashMap;
use std::rc::Rc;

use log::{debug, trace, warn};

use crate::error::{ErrorContext, ProtocolError, QpackError, QpackResult};
use crate::table::Entry;

use block::{BlockReader, HeaderField, Step as BlockStep};
use blocked::BlockedQueue;
use dynamic_table::DecoderTable;
use enc_stream::{EncStreamParser, Instruction};

pub struct DecoderConfig {
    pub max_table_size: usize,
    pub dyn_table_size: usize,
    pub max_risked_streams: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        DecoderConfig { max_table_size: 0, dyn_table_size: 0, max_risked_streams: 0 }
    }
}

/// A fully decoded header block, still holding the table refcounts that
/// keep its source entries alive. Call [`Decoder::destroy_header_set`]
/// once the caller is done reading `fields`.
pub struct HeaderSet {
    pub fields: Vec<HeaderField>,
    pinned: Vec<Rc<Entry>>,
}

pub enum Outcome {
    Done(HeaderSet),
    Need,
    Blocked,
}

struct Context {
    reader: BlockReader,
    stream_id: u64,
    total_size: u64,
    consumed: u64,
}

pub struct Decoder {
    table: DecoderTable,
    enc_parser: EncStreamParser,
    blocked: BlockedQueue<u64>,
    contexts: HashMap<u64, Context>,
    max_table_size: usize,
    largest_known_id: u64,
    unblock_callback: Option<Box<dyn FnMut(u64)>>,
    last_error: Option<(ProtocolError, ErrorContext)>,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Decoder {
            table: DecoderTable::new(0),
            enc_parser: EncStreamParser::new(),
            blocked: BlockedQueue::new(0),
            contexts: HashMap::new(),
            max_table_size: 0,
            largest_known_id: 0,
            unblock_callback: None,
            last_error: None,
        }
    }

    pub fn init(&mut self, cfg: DecoderConfig, unblock_callback: Box<dyn FnMut(u64)>) {
        self.table = DecoderTable::new(cfg.dyn_table_size);
        self.max_table_size = cfg.max_table_size;
        self.blocked = BlockedQueue::new(cfg.max_risked_streams);
        self.unblock_callback = Some(unblock_callback);
        debug!("qpack decoder init: dyn_table_size={} max_risked_streams={}", cfg.dyn_table_size, cfg.max_risked_streams);
    }

    fn max_entries(&self) -> u64 {
        (self.table.max_capacity() as u64 / 32).max(1)
    }

    fn record_error(&mut self, e: QpackError) -> QpackError {
        if let QpackError::Protocol(p, ctx) = e {
            self.last_error = Some((p, ctx));
        }
        e
    }

    pub fn get_last_error(&self) -> Option<(ProtocolError, ErrorContext)> {
        self.last_error
    }

    /// Begins reading a header block. `handle` is an opaque id the
    /// caller mints and reuses across `HeaderRead` calls for the same
    /// block. `total_size` is the declared length of the whole block.
    /// Any decoder-stream bytes this call owes the encoder (a
    /// Section-Ack once the block completes) are appended to `dec_buf`.
    pub fn header_in(
        &mut self,
        handle: u64,
        stream_id: u64,
        total_size: u64,
        buf: &[u8],
        dec_buf: &mut Vec<u8>,
    ) -> QpackResult<Outcome> {
        self.contexts.insert(handle, Context { reader: BlockReader::new(stream_id), stream_id, total_size, consumed: 0 });
        self.header_read(handle, buf, dec_buf)
    }

    /// Feeds more bytes to an already-started (and not currently
    /// blocked) header block. Any decoder-stream bytes this call owes
    /// the encoder are appended to `dec_buf`.
    pub fn header_read(&mut self, handle: u64, buf: &[u8], dec_buf: &mut Vec<u8>) -> QpackResult<Outcome> {
        let max_entries = self.max_entries();
        let stream_id = self
            .contexts
            .get(&handle)
            .expect("header_read called with unknown handle")
            .stream_id;

        let feed_result = {
            let ctx = self.contexts.get_mut(&handle).unwrap();
            ctx.reader.feed(buf, &self.table, max_entries)
        };
        let (step, consumed) = match feed_result {
            Ok(v) => v,
            Err(e) => return Err(self.record_error(e)),
        };
        {
            let ctx = self.contexts.get_mut(&handle).unwrap();
            ctx.consumed += consumed as u64;
        }

        match step {
            BlockStep::Blocked { largest_ref } => {
                if !self.blocked.admit(handle, largest_ref) {
                    self.contexts.remove(&handle);
                    return Err(self.record_error(QpackError::Blocked));
                }
                trace!("stream {} blocked on largest_ref={}", stream_id, largest_ref);
                Ok(Outcome::Blocked)
            }
            BlockStep::Done { .. } => unreachable!("BlockReader::feed never produces Done; finish() does"),
            BlockStep::NeedMore => {
                let done = {
                    let ctx = self.contexts.get(&handle).unwrap();
                    ctx.consumed >= ctx.total_size
                };
                if !done {
                    return Ok(Outcome::Need);
                }
                let (touched_dynamic, finish_result) = {
                    let ctx = self.contexts.get_mut(&handle).unwrap();
                    (ctx.reader.touched_dynamic(), ctx.reader.finish())
                };
                let (fields, pinned) = match finish_result {
                    Ok(v) => v,
                    Err(e) => return Err(self.record_error(e)),
                };
                self.contexts.remove(&handle);
                if touched_dynamic {
                    self.largest_known_id = self.largest_known_id.max(self.table.largest_known_id());
                    control::emit_section_ack(dec_buf, stream_id);
                    trace!("stream {} section complete, dynamic table used, section-ack queued", stream_id);
                }
                Ok(Outcome::Done(HeaderSet { fields, pinned }))
            }
        }
    }

    /// Applies every instruction in `bytes` from the peer's encoder
    /// stream, then wakes any header blocks that were waiting on the
    /// resulting insertions.
    pub fn enc_stream_in(&mut self, bytes: &[u8]) -> QpackResult<()> {
        let mut instructions = Vec::new();
        self.enc_parser.feed(bytes, 0, &mut instructions).map_err(|e| self.record_error(e))?;
        for inst in instructions {
            self.apply_instruction(inst)?;
        }
        Ok(())
    }

    fn apply_instruction(&mut self, inst: Instruction) -> QpackResult<()> {
        match inst {
            Instruction::InsertWithNameRef { is_static, name_idx, value } => {
                let name: Vec<u8> = if is_static {
                    match crate::static_table::get(name_idx as u32) {
                        Some((n, _)) => n.as_bytes().to_vec(),
                        None => return Err(self.enc_protocol_err(ProtocolError::StaticIndexOutOfBounds)),
                    }
                } else {
                    let abs_id = match self.table.last_id().checked_sub(name_idx) {
                        Some(id) => id,
                        None => return Err(self.enc_protocol_err(ProtocolError::BadIndex)),
                    };
                    match self.table.get_by_abs_id(abs_id) {
                        Some(entry) => entry.name.to_vec(),
                        None => return Err(self.enc_protocol_err(ProtocolError::BadIndex)),
                    }
                };
                let new_id = self.table.last_id() + 1;
                let entry = self.table.insert(name, value, new_id);
                self.on_inserted(&entry);
            }
            Instruction::InsertWithoutNameRef { name, value } => {
                let new_id = self.table.last_id() + 1;
                let entry = self.table.insert(name, value, new_id);
                self.on_inserted(&entry);
            }
            Instruction::Duplicate { relative_index } => {
                let abs_id = match self.table.last_id().checked_sub(relative_index) {
                    Some(id) => id,
                    None => return Err(self.enc_protocol_err(ProtocolError::BadDuplicateIndex)),
                };
                let source = match self.table.get_by_abs_id(abs_id) {
                    Some(entry) => entry.clone(),
                    None => return Err(self.enc_protocol_err(ProtocolError::BadDuplicateIndex)),
                };
                let new_id = self.table.last_id() + 1;
                let entry = self.table.duplicate(&source, new_id);
                self.on_inserted(&entry);
            }
            Instruction::SetCapacity { capacity } => {
                if capacity as usize > self.max_table_size {
                    return Err(self.enc_protocol_err(ProtocolError::CapacityTooLarge));
                }
                self.table.set_max_capacity(capacity as usize);
            }
        }
        Ok(())
    }

    fn enc_protocol_err(&mut self, p: ProtocolError) -> QpackError {
        let e = QpackError::Protocol(p, ErrorContext::new(crate::error::ErrorLocation::EncStream, line!(), 0, 0));
        self.record_error(e)
    }

    fn on_inserted(&mut self, entry: &Rc<Entry>) {
        self.table.note_largest_known(entry.abs_id);
        let ready = self.blocked.unblock(entry.abs_id);
        for handle in ready {
            if let Some(cb) = self.unblock_callback.as_mut() {
                cb(handle);
            } else {
                warn!("unblocked handle {} with no callback registered", handle);
            }
        }
    }

    pub fn tss_pending(&self) -> bool {
        self.table.last_id() > self.largest_known_id
    }

    pub fn write_tss(&mut self, out: &mut Vec<u8>) {
        if self.tss_pending() {
            control::emit_tss(out, self.table.last_id(), self.largest_known_id);
            self.largest_known_id = self.table.last_id();
        }
    }

    /// Emits a Stream-Cancellation and drops the read context for
    /// `handle`, releasing whatever entries it had pinned.
    pub fn cancel_stream(&mut self, handle: u64, out: &mut Vec<u8>) {
        if let Some(ctx) = self.contexts.remove(&handle) {
            control::emit_stream_cancel(out, ctx.stream_id);
        }
    }

    /// Drops the read context for `handle` without notifying the
    /// encoder - used when the stream ended with nothing outstanding.
    pub fn unref_stream(&mut self, handle: u64) {
        self.contexts.remove(&handle);
    }

    /// Releases the table refcounts a completed header set was holding.
    pub fn destroy_header_set(&mut self, set: HeaderSet) {
        drop(set.pinned);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert_literal(dec: &mut Decoder, name: &[u8], value: &[u8]) {
        let mut buf = vec![0x40 | (name.len() as u8)]; // insert-without-nameref, raw name
        buf.extend_from_slice(name);
        buf.push(value.len() as u8); // raw value
        buf.extend_from_slice(value);
        dec.enc_stream_in(&buf).unwrap();
    }

    #[test]
    fn static_only_block_completes_immediately() {
        let mut dec = Decoder::new();
        dec.init(DecoderConfig { max_table_size: 4096, dyn_table_size: 4096, max_risked_streams: 10 }, Box::new(|_| {}));
        let buf = vec![0x00, 0x00, 0xC0 | 17]; // empty prefix, indexed static :method GET
        let mut dec_buf = Vec::new();
        let outcome = dec.header_in(1, 5, buf.len() as u64, &buf, &mut dec_buf).unwrap();
        match outcome {
            Outcome::Done(set) => {
                assert_eq!(set.fields.len(), 1);
                assert_eq!(set.fields[0].name, b":method");
                assert!(dec_buf.is_empty(), "a static-only block owes no section-ack");
                dec.destroy_header_set(set);
            }
            _ => panic!("expected Done"),
        }
    }

    #[test]
    fn dynamic_insert_then_reference_round_trips() {
        let mut dec = Decoder::new();
        dec.init(DecoderConfig { max_table_size: 4096, dyn_table_size: 4096, max_risked_streams: 10 }, Box::new(|_| {}));
        insert_literal(&mut dec, b"x-custom", b"v1");
        assert_eq!(dec.table.last_id(), 1);

        // prefix: largest_ref_encoded = 1+2=3 (modulus with max_entries=128 -> 256, fine), base=1
        let mut buf = vec![0x03, 0x00];
        buf.push(0x80); // indexed dynamic pre-base, relative 0
        let mut dec_buf = Vec::new();
        let outcome = dec.header_in(2, 7, buf.len() as u64, &buf, &mut dec_buf).unwrap();
        match outcome {
            Outcome::Done(set) => {
                assert_eq!(set.fields[0].name, b"x-custom");
                assert_eq!(set.fields[0].value, b"v1");
                assert!(!dec_buf.is_empty(), "a block that touched the dynamic table owes a section-ack");
                assert_eq!(dec_buf[0] & 0x80, 0x80);
            }
            _ => panic!("expected Done"),
        }
    }

    #[test]
    fn blocked_header_resumes_after_insertion() {
        let mut dec = Decoder::new();
        dec.init(DecoderConfig { max_table_size: 4096, dyn_table_size: 4096, max_risked_streams: 10 }, Box::new(|_| {}));
        // LargestRefEncoded=3 -> largest_ref=1, but nothing inserted yet.
        // Declared size is 3: 2 prefix bytes plus the 1-byte indexed
        // reference that arrives after the unblock.
        let buf = vec![0x03, 0x00];
        let mut dec_buf = Vec::new();
        let outcome = dec.header_in(9, 1, 3, &buf, &mut dec_buf).unwrap();
        assert!(matches!(outcome, Outcome::Blocked));

        insert_literal(&mut dec, b"a", b"b");
        // After insertion, caller re-feeds the dynamic reference.
        let more = vec![0x80u8];
        let outcome = dec.header_read(9, &more, &mut dec_buf).unwrap();
        match outcome {
            Outcome::Done(set) => {
                assert_eq!(set.fields[0].name, b"a");
                assert!(!dec_buf.is_empty(), "a block that touched the dynamic table owes a section-ack");
            }
            _ => panic!("expected Done after unblock"),
        }
    }

    #[test]
    fn write_tss_emits_only_when_pending() {
        let mut dec = Decoder::new();
        dec.init(DecoderConfig { max_table_size: 4096, dyn_table_size: 4096, max_risked_streams: 10 }, Box::new(|_| {}));
        let mut out = Vec::new();
        dec.write_tss(&mut out);
        assert!(out.is_empty());
        insert_literal(&mut dec, b"a", b"b");
        dec.write_tss(&mut out);
        assert!(!out.is_empty());
        assert!(!dec.tss_pending());
    }
}
