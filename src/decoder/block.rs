// Copyright 2022 - 2024 Wenmeng See the COPYRIGHT
// file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
//
// Two-phase resumable header-block parser: the Header Data Prefix,
// then the five field-line representations.
// A resumable rebuild of `hpack::decoder::Decoder::decode_with_cb`'s
// string-accumulation loop, reshaped around an explicit state enum so a
// block spanning multiple `STREAM` frames can suspend between any two
// bytes, and around `LargestRef`/`BaseIndex` so field lines can address
// entries inserted by this same block (post-base) or already pinned
// before it started (pre-base).

use std::rc::Rc;

use crate::decoder::dynamic_table::DecoderTable;
use crate::error::{ErrorContext, ErrorLocation, ProtocolError, QpackError, QpackResult};
use crate::huffman;
use crate::static_table;
use crate::table::Entry;
use crate::varint;

/// A fully decoded field line.
pub struct HeaderField {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
    pub never_index: bool,
}

/// What the parser is waiting on next.
enum Phase {
    PrefixLargestRef { decoder: varint::Decoder },
    PrefixSignDelta { largest_ref_encoded: u64, decoder: varint::Decoder },
    Data(DataState),
}

enum DataState {
    Idle,
    /// Reading an index prefix for a representation that carries no
    /// strings of its own (Indexed, Indexed-Post-Base) or that precedes
    /// a name/value string (Literal-with-name-ref, post-base-name-ref).
    IndexPrefix { kind: IndexKind, decoder: varint::Decoder },
    /// Waiting for the first byte of a string (extracts its Huffman
    /// flag before building the length decoder).
    StringFirstByte { kind: StringKind },
    StringLen { kind: StringKind, huffman: bool, decoder: varint::Decoder },
    StringBytes { kind: StringKind, huffman: bool, remaining: usize, buf: Vec<u8>, huff: huffman::Decoder },
}

#[derive(Clone, Copy)]
enum IndexKind {
    IndexedStatic,
    IndexedDynamicPreBase,
    IndexedPostBase,
    LitNameStatic { never_index: bool },
    LitNameDynamicPreBase { never_index: bool },
    LitNamePostBase { never_index: bool },
}

enum StringKind {
    /// The name of a fully-literal field line (no name reference).
    LiteralName { never_index: bool },
    /// The value that follows a literal name (carries the name read so
    /// far).
    LiteralValue { never_index: bool, name: Vec<u8> },
    /// The value of any name-reference representation; `name` was
    /// already resolved from a table lookup.
    RefValue { never_index: bool, name: Vec<u8> },
}

/// Outcome of feeding more bytes to a [`BlockReader`].
pub enum Step {
    /// The whole block is parsed; `fields` holds every field line and
    /// `pinned` the `Rc` clones keeping their source entries alive for
    /// as long as the caller holds the produced header set.
    Done { fields: Vec<HeaderField>, pinned: Vec<Rc<Entry>> },
    /// The prefix named an entry not yet inserted; register with the
    /// blocking queue and call `resume` again once unblocked.
    Blocked { largest_ref: u64 },
    /// More bytes are needed; call `feed` again.
    NeedMore,
}

pub struct BlockReader {
    stream_id: u64,
    phase: Option<Phase>,
    base_idx: u64,
    largest_ref: u64,
    touched_dynamic: bool,
    fields: Vec<HeaderField>,
    pinned: Vec<Rc<Entry>>,
    bytes_read: u64,
}

impl BlockReader {
    pub fn new(stream_id: u64) -> Self {
        BlockReader {
            stream_id,
            phase: Some(Phase::PrefixLargestRef { decoder: varint::Decoder::new(8) }),
            base_idx: 0,
            largest_ref: 0,
            touched_dynamic: false,
            fields: Vec::new(),
            pinned: Vec::new(),
            bytes_read: 0,
        }
    }

    pub fn largest_ref(&self) -> u64 {
        self.largest_ref
    }

    /// True once a representation in this block has referenced the
    /// dynamic table - callers use this to decide whether finishing the
    /// block owes the encoder a Section-Ack.
    pub fn touched_dynamic(&self) -> bool {
        self.touched_dynamic
    }

    fn ctx(&self) -> ErrorContext {
        ErrorContext::new(ErrorLocation::HeaderBlock, line!(), self.bytes_read, self.stream_id)
    }

    fn err(&self, p: ProtocolError) -> QpackError {
        QpackError::Protocol(p, self.ctx())
    }

    /// Feeds `buf` a byte at a time against `table` (the current state
    /// of the decoder's dynamic table; entries named by this block are
    /// guaranteed present once the prefix phase has cleared, since the
    /// encoder is required to keep any unacknowledged referenced entry
    /// from being evicted). `max_entries` is needed for the `LargestRef`
    /// modular reconstruction.
    /// Returns the resulting `Step` along with how many bytes of `buf`
    /// were consumed. On `Blocked`, the caller must re-feed the
    /// remainder once the unblock callback fires.
    pub fn feed(&mut self, buf: &[u8], table: &DecoderTable, max_entries: u64) -> QpackResult<(Step, usize)> {
        for (i, &byte) in buf.iter().enumerate() {
            self.bytes_read += 1;
            match self.step(byte, table, max_entries)? {
                Step::NeedMore => continue,
                other => return Ok((other, i + 1)),
            }
        }
        Ok((Step::NeedMore, buf.len()))
    }

    fn step(&mut self, byte: u8, table: &DecoderTable, max_entries: u64) -> QpackResult<Step> {
        let phase = self.phase.take().expect("BlockReader stepped after completion");
        match phase {
            Phase::PrefixLargestRef { mut decoder } => match decoder.decode(&[byte]).map_err(|_| self.err(ProtocolError::IntegerOverflow))? {
                varint::Step::Done { value, .. } => {
                    let modulus = 2 * max_entries.max(1);
                    if value > modulus {
                        return Err(self.err(ProtocolError::BadLargestReference));
                    }
                    self.phase = Some(Phase::PrefixSignDelta { largest_ref_encoded: value, decoder: varint::Decoder::new(7) });
                    Ok(Step::NeedMore)
                }
                varint::Step::NeedMore => {
                    self.phase = Some(Phase::PrefixLargestRef { decoder });
                    Ok(Step::NeedMore)
                }
            },
            Phase::PrefixSignDelta { largest_ref_encoded, mut decoder } => {
                match decoder.decode(&[byte]).map_err(|_| self.err(ProtocolError::IntegerOverflow))? {
                    varint::Step::Done { value: delta, .. } => {
                        self.resolve_prefix(largest_ref_encoded, byte & 0x80 != 0, delta, max_entries, table)
                    }
                    varint::Step::NeedMore => {
                        self.phase = Some(Phase::PrefixSignDelta { largest_ref_encoded, decoder });
                        Ok(Step::NeedMore)
                    }
                }
            }
            Phase::Data(state) => self.step_data(state, byte, table),
        }
    }

    fn resolve_prefix(
        &mut self,
        largest_ref_encoded: u64,
        sign_minus: bool,
        delta: u64,
        max_entries: u64,
        table: &DecoderTable,
    ) -> QpackResult<Step> {
        if largest_ref_encoded == 0 {
            self.largest_ref = 0;
            self.base_idx = 0;
            self.phase = Some(Phase::Data(DataState::Idle));
            return Ok(Step::NeedMore);
        }
        let modulus = 2 * max_entries.max(1);
        let largest_ref = (largest_ref_encoded + modulus - 2) % modulus;
        self.largest_ref = largest_ref;
        if largest_ref > table.last_id() {
            // Stay in the prefix-resolved-but-blocked state; the caller
            // re-invokes `feed` with an empty continuation once
            // unblocked, which falls straight through to `Data`.
            self.base_idx = if sign_minus {
                largest_ref.checked_sub(delta + 1).ok_or_else(|| self.err(ProtocolError::BadLargestReference))?
            } else {
                largest_ref + delta
            };
            self.phase = Some(Phase::Data(DataState::Idle));
            return Ok(Step::Blocked { largest_ref });
        }
        self.base_idx = if sign_minus {
            largest_ref.checked_sub(delta + 1).ok_or_else(|| self.err(ProtocolError::BadLargestReference))?
        } else {
            largest_ref + delta
        };
        self.phase = Some(Phase::Data(DataState::Idle));
        Ok(Step::NeedMore)
    }

    fn step_data(&mut self, state: DataState, byte: u8, table: &DecoderTable) -> QpackResult<Step> {
        let next = match state {
            DataState::Idle => self.start_representation(byte, table)?,
            DataState::IndexPrefix { kind, mut decoder } => {
                match decoder.decode(&[byte]).map_err(|_| self.err(ProtocolError::IntegerOverflow))? {
                    varint::Step::Done { value, .. } => self.finish_index(kind, value, table)?,
                    varint::Step::NeedMore => DataState::IndexPrefix { kind, decoder },
                }
            }
            DataState::StringFirstByte { kind } => {
                let huffman = byte & 0x80 != 0;
                let mut decoder = varint::Decoder::new(7);
                match decoder.decode(&[byte]).map_err(|_| self.err(ProtocolError::IntegerOverflow))? {
                    varint::Step::Done { value, .. } => self.begin_string(kind, huffman, value as usize),
                    varint::Step::NeedMore => DataState::StringLen { kind, huffman, decoder },
                }
            }
            DataState::StringLen { kind, huffman, mut decoder } => {
                match decoder.decode(&[byte]).map_err(|_| self.err(ProtocolError::IntegerOverflow))? {
                    varint::Step::Done { value, .. } => self.begin_string(kind, huffman, value as usize),
                    varint::Step::NeedMore => DataState::StringLen { kind, huffman, decoder },
                }
            }
            DataState::StringBytes { kind, huffman, mut remaining, mut buf, mut huff } => {
                if huffman {
                    huff.feed_byte(byte, &mut buf).map_err(|e| self.err(ProtocolError::from(e)))?;
                } else {
                    buf.push(byte);
                }
                remaining -= 1;
                if remaining == 0 {
                    if huffman {
                        huff.finish().map_err(|e| self.err(ProtocolError::from(e)))?;
                    }
                    self.finish_string(kind, buf)
                } else {
                    DataState::StringBytes { kind, huffman, remaining, buf, huff }
                }
            }
        };
        self.phase = Some(Phase::Data(next));
        Ok(Step::NeedMore)
    }

    /// The wire format carries no in-band end marker; the caller
    /// (`decoder::mod`) tracks the block's declared byte length and
    /// calls this once that many bytes have been fed. Must be called
    /// only when `DataState::Idle` (no partial representation pending).
    pub fn finish(&mut self) -> QpackResult<(Vec<HeaderField>, Vec<Rc<Entry>>)> {
        match &self.phase {
            Some(Phase::Data(DataState::Idle)) => {
                Ok((std::mem::take(&mut self.fields), std::mem::take(&mut self.pinned)))
            }
            _ => Err(self.err(ProtocolError::BadIndex)),
        }
    }

    fn start_representation(&mut self, byte: u8, table: &DecoderTable) -> QpackResult<DataState> {
        if byte & 0xC0 == 0xC0 {
            self.start_index_prefix(IndexKind::IndexedStatic, 6, byte, table)
        } else if byte & 0xC0 == 0x80 {
            self.start_index_prefix(IndexKind::IndexedDynamicPreBase, 6, byte, table)
        } else if byte & 0xC0 == 0x40 {
            let never_index = byte & 0x20 != 0;
            let kind = if byte & 0x10 != 0 {
                IndexKind::LitNameStatic { never_index }
            } else {
                IndexKind::LitNameDynamicPreBase { never_index }
            };
            self.start_index_prefix(kind, 4, byte, table)
        } else if byte & 0xF0 == 0x10 {
            self.start_index_prefix(IndexKind::IndexedPostBase, 4, byte, table)
        } else if byte & 0xF0 == 0x00 {
            let never_index = byte & 0x08 != 0;
            self.start_index_prefix(IndexKind::LitNamePostBase { never_index }, 3, byte, table)
        } else if byte & 0xE0 == 0x20 {
            let never_index = byte & 0x10 != 0;
            let huffman = byte & 0x08 != 0;
            let mut decoder = varint::Decoder::new(3);
            match decoder.decode(&[byte]).map_err(|_| self.err(ProtocolError::IntegerOverflow))? {
                varint::Step::Done { value, .. } => {
                    Ok(self.begin_string(StringKind::LiteralName { never_index }, huffman, value as usize))
                }
                varint::Step::NeedMore => Ok(DataState::StringLen { kind: StringKind::LiteralName { never_index }, huffman, decoder }),
            }
        } else {
            Err(self.err(ProtocolError::BadIndex))
        }
    }

    /// Starts an index-prefix decode on `prefix_bits`, resolving it
    /// immediately via `finish_index` if the value fits entirely within
    /// `byte` (the common case for small indices).
    fn start_index_prefix(&mut self, kind: IndexKind, prefix_bits: u8, byte: u8, table: &DecoderTable) -> QpackResult<DataState> {
        let mut decoder = varint::Decoder::new(prefix_bits);
        match decoder.decode(&[byte]).map_err(|_| self.err(ProtocolError::IntegerOverflow))? {
            varint::Step::Done { value, .. } => self.finish_index(kind, value, table),
            varint::Step::NeedMore => Ok(DataState::IndexPrefix { kind, decoder }),
        }
    }

    fn finish_index(&mut self, kind: IndexKind, value: u64, table: &DecoderTable) -> QpackResult<DataState> {
        match kind {
            IndexKind::IndexedStatic => {
                let (name, val) = static_table::get(value as u32).ok_or_else(|| self.err(ProtocolError::StaticIndexOutOfBounds))?;
                self.fields.push(HeaderField { name: name.as_bytes().to_vec(), value: val.as_bytes().to_vec(), never_index: false });
                Ok(DataState::Idle)
            }
            IndexKind::IndexedDynamicPreBase => {
                let abs_id = self.base_idx.checked_sub(value).ok_or_else(|| self.err(ProtocolError::BadIndex))?;
                let entry = table.get_by_abs_id(abs_id).ok_or_else(|| self.err(ProtocolError::BadIndex))?.clone();
                self.touched_dynamic = true;
                self.fields.push(HeaderField { name: entry.name.to_vec(), value: entry.value.to_vec(), never_index: false });
                self.pinned.push(entry);
                Ok(DataState::Idle)
            }
            IndexKind::IndexedPostBase => {
                let abs_id = self.base_idx + value + 1;
                let entry = table.get_by_abs_id(abs_id).ok_or_else(|| self.err(ProtocolError::BadIndex))?.clone();
                self.touched_dynamic = true;
                self.fields.push(HeaderField { name: entry.name.to_vec(), value: entry.value.to_vec(), never_index: false });
                self.pinned.push(entry);
                Ok(DataState::Idle)
            }
            IndexKind::LitNameStatic { never_index } => {
                let (name, _) = static_table::get(value as u32).ok_or_else(|| self.err(ProtocolError::StaticIndexOutOfBounds))?;
                Ok(DataState::StringFirstByte { kind: StringKind::RefValue { never_index, name: name.as_bytes().to_vec() } })
            }
            IndexKind::LitNameDynamicPreBase { never_index } => {
                let abs_id = self.base_idx.checked_sub(value).ok_or_else(|| self.err(ProtocolError::BadIndex))?;
                let entry = table.get_by_abs_id(abs_id).ok_or_else(|| self.err(ProtocolError::BadIndex))?.clone();
                self.touched_dynamic = true;
                self.pinned.push(entry.clone());
                Ok(DataState::StringFirstByte { kind: StringKind::RefValue { never_index, name: entry.name.to_vec() } })
            }
            IndexKind::LitNamePostBase { never_index } => {
                let abs_id = self.base_idx + value + 1;
                let entry = table.get_by_abs_id(abs_id).ok_or_else(|| self.err(ProtocolError::BadIndex))?.clone();
                self.touched_dynamic = true;
                self.pinned.push(entry.clone());
                Ok(DataState::StringFirstByte { kind: StringKind::RefValue { never_index, name: entry.name.to_vec() } })
            }
        }
    }

    fn begin_string(&mut self, kind: StringKind, huffman: bool, len: usize) -> DataState {
        if len == 0 {
            self.finish_string(kind, Vec::new())
        } else {
            DataState::StringBytes { kind, huffman, remaining: len, buf: Vec::with_capacity(len), huff: huffman::Decoder::new() }
        }
    }

    fn finish_string(&mut self, kind: StringKind, buf: Vec<u8>) -> DataState {
        match kind {
            StringKind::LiteralName { never_index } => {
                DataState::StringFirstByte { kind: StringKind::LiteralValue { never_index, name: buf } }
            }
            StringKind::LiteralValue { never_index, name } | StringKind::RefValue { never_index, name } => {
                self.fields.push(HeaderField { name, value: buf, never_index });
                DataState::Idle
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_block(buf: &[u8], table: &DecoderTable, max_entries: u64) -> Vec<HeaderField> {
        let mut r = BlockReader::new(1);
        let (step, consumed) = r.feed(buf, table, max_entries).unwrap();
        assert_eq!(consumed, buf.len());
        match step {
            Step::NeedMore => {
                let (fields, _) = r.finish().unwrap();
                fields
            }
            Step::Done { fields, .. } => fields,
            Step::Blocked { .. } => panic!("unexpectedly blocked"),
        }
    }

    #[test]
    fn empty_prefix_then_indexed_static_only() {
        let table = DecoderTable::new(4096);
        // empty header data prefix (no dynamic refs), then indexed static idx 17 (:method GET)
        let buf = vec![0x00, 0x00, 0xC0 | 17];
        let fields = read_block(&buf, &table, 16);
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].name, b":method");
        assert_eq!(fields[0].value, b"GET");
    }

    #[test]
    fn indexed_dynamic_pre_base_resolves_entry() {
        let mut table = DecoderTable::new(4096);
        table.insert(b"x-custom".to_vec(), b"v1".to_vec(), 1);
        // LargestRef encoded = 1+2=3 (id1, max_entries arbitrary large so modulus won't wrap)
        // base_idx = largest_ref (sign=0, delta=0)
        let buf = vec![0x03, 0x00, 0x80 | 0x00]; // indexed dynamic pre-base, relative 0 -> abs_id = base_idx-0 = 1
        let fields = read_block(&buf, &table, 64);
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].name, b"x-custom");
        assert_eq!(fields[0].value, b"v1");
    }

    #[test]
    fn literal_without_name_reference_round_trips() {
        let table = DecoderTable::new(4096);
        let mut buf = vec![0x00, 0x00]; // empty prefix
        buf.push(0x20 | 0x04); // 001, N=0, H=0, name len=4
        buf.extend_from_slice(b"name");
        buf.push(0x05);
        buf.extend_from_slice(b"value");
        let fields = read_block(&buf, &table, 16);
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].name, b"name");
        assert_eq!(fields[0].value, b"value");
    }

    #[test]
    fn future_largest_ref_blocks() {
        let table = DecoderTable::new(4096);
        let mut r = BlockReader::new(2);
        // LargestRefEncoded = 3 => largest_ref = 1, but table is empty (last_id=0)
        let buf = vec![0x03, 0x00];
        match r.feed(&buf, &table, 64).unwrap() {
            (Step::Blocked { largest_ref }, consumed) => {
                assert_eq!(largest_ref, 1);
                assert_eq!(consumed, 2);
            }
            _ => panic!("expected Blocked"),
        }
    }
}
