// Copyright 2022 - 2024 Wenmeng See the COPYRIGHT
// file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
//
// Resumable parser for the peer's encoder stream: Insert With Name
// Reference (static/dynamic), Insert Without Name Reference,
// Duplicate, Set Dynamic Table Capacity. Grounded on
// `hpack::decoder::Decoder`'s incremental string-accumulation shape,
// generalized into an explicit resumption enum since a QUIC unidirectional
// stream can hand us a handful of bytes at a time - the same suspension
// requirement `varint::Decoder` and `huffman::Decoder` were built to
// support.

use crate::error::{ErrorContext, ErrorLocation, ProtocolError, QpackError, QpackResult};
use crate::huffman;
use crate::varint;

/// What a string being read will become once it is complete.
enum StringKind {
    /// The value of an Insert-With-Name-Ref instruction.
    NameRefValue { is_static: bool, name_idx: u64 },
    /// The name of an Insert-Without-Name-Ref instruction.
    LiteralName,
    /// The value of an Insert-Without-Name-Ref instruction; carries the
    /// name read just before it.
    LiteralValue { name: Vec<u8> },
}

enum PrefixKind {
    NameRefIndex { is_static: bool },
    DuplicateIndex,
    Capacity,
}

enum State {
    /// Ready to read a new instruction's first byte.
    Idle,
    /// Reading an index/count prefix (name-ref index, duplicate index,
    /// or capacity); the instruction's first byte already supplied the
    /// tag bits this decoder masks away.
    Prefix { kind: PrefixKind, decoder: varint::Decoder },
    /// Waiting for the first byte of a string whose tag bits were not
    /// already available (the value string of an Insert-With-Name-Ref,
    /// which follows a separate index prefix).
    StringFirstByte { kind: StringKind },
    /// Reading the continuation bytes of a string's length prefix.
    StringLen { kind: StringKind, huffman: bool, decoder: varint::Decoder },
    /// Reading a string's raw (encoded) bytes.
    StringBytes { kind: StringKind, huffman: bool, remaining: usize, buf: Vec<u8>, huff: huffman::Decoder },
}

/// One completed peer-encoder-stream instruction, ready to be applied to
/// the decoder's table by the caller (`decoder::mod`).
pub enum Instruction {
    InsertWithNameRef { is_static: bool, name_idx: u64, value: Vec<u8> },
    InsertWithoutNameRef { name: Vec<u8>, value: Vec<u8> },
    Duplicate { relative_index: u64 },
    SetCapacity { capacity: u64 },
}

pub struct EncStreamParser {
    state: State,
    bytes_read: u64,
}

impl Default for EncStreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl EncStreamParser {
    pub fn new() -> Self {
        EncStreamParser { state: State::Idle, bytes_read: 0 }
    }

    fn ctx(&self, stream_id: u64) -> ErrorContext {
        ErrorContext::new(ErrorLocation::EncStream, line!(), self.bytes_read, stream_id)
    }

    /// Feeds `buf` one byte at a time, appending every instruction
    /// completed along the way to `out`. Stops and returns the error as
    /// soon as one byte is rejected; the stream must be torn down at
    /// that point - there is no resuming past a fatal parse error.
    pub fn feed(&mut self, buf: &[u8], stream_id: u64, out: &mut Vec<Instruction>) -> QpackResult<()> {
        for &byte in buf {
            self.bytes_read += 1;
            self.step(byte, stream_id, out)?;
        }
        Ok(())
    }

    fn step(&mut self, byte: u8, stream_id: u64, out: &mut Vec<Instruction>) -> QpackResult<()> {
        let ctx = self.ctx(stream_id);
        let overflow = move || QpackError::Protocol(ProtocolError::IntegerOverflow, ctx);

        let state = std::mem::replace(&mut self.state, State::Idle);
        self.state = match state {
            State::Idle => {
                if byte & 0x80 != 0 {
                    let is_static = byte & 0x40 != 0;
                    let mut decoder = varint::Decoder::new(6);
                    match decoder.decode(&[byte]).map_err(|_| overflow())? {
                        varint::Step::Done { value, .. } => {
                            State::StringFirstByte { kind: StringKind::NameRefValue { is_static, name_idx: value } }
                        }
                        varint::Step::NeedMore => {
                            State::Prefix { kind: PrefixKind::NameRefIndex { is_static }, decoder }
                        }
                    }
                } else if byte & 0x40 != 0 {
                    let huffman = byte & 0x20 != 0;
                    let mut decoder = varint::Decoder::new(5);
                    match decoder.decode(&[byte]).map_err(|_| overflow())? {
                        varint::Step::Done { value, .. } => {
                            self.begin_string(StringKind::LiteralName, huffman, value as usize, out)
                        }
                        varint::Step::NeedMore => State::StringLen { kind: StringKind::LiteralName, huffman, decoder },
                    }
                } else if byte & 0x20 != 0 {
                    let mut decoder = varint::Decoder::new(5);
                    match decoder.decode(&[byte]).map_err(|_| overflow())? {
                        varint::Step::Done { value, .. } => {
                            out.push(Instruction::SetCapacity { capacity: value });
                            State::Idle
                        }
                        varint::Step::NeedMore => State::Prefix { kind: PrefixKind::Capacity, decoder },
                    }
                } else {
                    let mut decoder = varint::Decoder::new(5);
                    match decoder.decode(&[byte]).map_err(|_| overflow())? {
                        varint::Step::Done { value, .. } => {
                            out.push(Instruction::Duplicate { relative_index: value });
                            State::Idle
                        }
                        varint::Step::NeedMore => State::Prefix { kind: PrefixKind::DuplicateIndex, decoder },
                    }
                }
            }
            State::Prefix { kind, mut decoder } => match decoder.decode(&[byte]).map_err(|_| overflow())? {
                varint::Step::Done { value, .. } => match kind {
                    PrefixKind::NameRefIndex { is_static } => {
                        State::StringFirstByte { kind: StringKind::NameRefValue { is_static, name_idx: value } }
                    }
                    PrefixKind::DuplicateIndex => {
                        out.push(Instruction::Duplicate { relative_index: value });
                        State::Idle
                    }
                    PrefixKind::Capacity => {
                        out.push(Instruction::SetCapacity { capacity: value });
                        State::Idle
                    }
                },
                varint::Step::NeedMore => State::Prefix { kind, decoder },
            },
            State::StringFirstByte { kind } => {
                let huffman = byte & 0x80 != 0;
                let mut decoder = varint::Decoder::new(7);
                match decoder.decode(&[byte]).map_err(|_| overflow())? {
                    varint::Step::Done { value, .. } => self.begin_string(kind, huffman, value as usize, out),
                    varint::Step::NeedMore => State::StringLen { kind, huffman, decoder },
                }
            }
            State::StringLen { kind, huffman, mut decoder } => match decoder.decode(&[byte]).map_err(|_| overflow())? {
                varint::Step::Done { value, .. } => self.begin_string(kind, huffman, value as usize, out),
                varint::Step::NeedMore => State::StringLen { kind, huffman, decoder },
            },
            State::StringBytes { kind, huffman, mut remaining, mut buf, mut huff } => {
                if huffman {
                    huff.feed_byte(byte, &mut buf)
                        .map_err(|e| QpackError::Protocol(ProtocolError::from(e), self.ctx(stream_id)))?;
                } else {
                    buf.push(byte);
                }
                remaining -= 1;
                if remaining == 0 {
                    if huffman {
                        huff.finish()
                            .map_err(|e| QpackError::Protocol(ProtocolError::from(e), self.ctx(stream_id)))?;
                    }
                    self.finish_string(kind, buf, out)
                } else {
                    State::StringBytes { kind, huffman, remaining, buf, huff }
                }
            }
        };
        Ok(())
    }

    /// Starts reading `len` encoded bytes, or completes the string on
    /// the spot when `len == 0` (no further bytes are coming for it).
    fn begin_string(&mut self, kind: StringKind, huffman: bool, len: usize, out: &mut Vec<Instruction>) -> State {
        if len == 0 {
            self.finish_string(kind, Vec::new(), out)
        } else {
            State::StringBytes { kind, huffman, remaining: len, buf: Vec::with_capacity(len), huff: huffman::Decoder::new() }
        }
    }

    fn finish_string(&mut self, kind: StringKind, buf: Vec<u8>, out: &mut Vec<Instruction>) -> State {
        match kind {
            StringKind::NameRefValue { is_static, name_idx } => {
                out.push(Instruction::InsertWithNameRef { is_static, name_idx, value: buf });
                State::Idle
            }
            StringKind::LiteralName => State::StringFirstByte { kind: StringKind::LiteralValue { name: buf } },
            StringKind::LiteralValue { name } => {
                out.push(Instruction::InsertWithoutNameRef { name, value: buf });
                State::Idle
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insts(buf: &[u8]) -> Vec<Instruction> {
        let mut p = EncStreamParser::new();
        let mut out = Vec::new();
        p.feed(buf, 0, &mut out).unwrap();
        out
    }

    #[test]
    fn insert_with_static_name_ref_raw_value() {
        // 1 1 000001 (static idx 1) | 0 0000011 "abc"
        let mut buf = vec![0xC1u8];
        buf.push(0x03);
        buf.extend_from_slice(b"abc");
        let out = insts(&buf);
        assert_eq!(out.len(), 1);
        match &out[0] {
            Instruction::InsertWithNameRef { is_static, name_idx, value } => {
                assert!(is_static);
                assert_eq!(*name_idx, 1);
                assert_eq!(value, b"abc");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn insert_without_name_ref_raw_name_and_value() {
        // 0 1 0 00100 "name" | 0 0000101 "value"
        let mut buf = vec![0x44u8];
        buf.extend_from_slice(b"name");
        buf.push(0x05);
        buf.extend_from_slice(b"value");
        let out = insts(&buf);
        assert_eq!(out.len(), 1);
        match &out[0] {
            Instruction::InsertWithoutNameRef { name, value } => {
                assert_eq!(name, b"name");
                assert_eq!(value, b"value");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn duplicate_and_capacity_need_no_strings() {
        let out = insts(&[0x05]); // 000 00101
        match &out[0] {
            Instruction::Duplicate { relative_index } => assert_eq!(*relative_index, 5),
            _ => panic!("wrong variant"),
        }
        let out = insts(&[0x2A]); // 001 01010
        match &out[0] {
            Instruction::SetCapacity { capacity } => assert_eq!(*capacity, 10),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn byte_at_a_time_feed_suspends_correctly() {
        let mut buf = vec![0xC1u8, 0x03];
        buf.extend_from_slice(b"abc");
        let mut p = EncStreamParser::new();
        let mut out = Vec::new();
        for &b in &buf {
            p.feed(&[b], 0, &mut out).unwrap();
        }
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn empty_string_completes_without_consuming_a_byte() {
        // insert with dynamic name ref idx 0, empty value
        let buf = vec![0x80u8, 0x00];
        let out = insts(&buf);
        match &out[0] {
            Instruction::InsertWithNameRef { value, .. } => assert!(value.is_empty()),
            _ => panic!("wrong variant"),
        }
    }
}
