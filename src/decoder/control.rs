// Copyright 2022 - 2024 Wenmeng See the COPYRIGHT
// file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
//
// Decoder stream control emitter: Section-Ack, Table State
// Synchronize, Stream-Cancellation. The mirror image of
// `encoder::stream`'s emitters, grounded on the same
// `hpack::http2::flag.rs`-style tag-byte-plus-varint shape. Constants
// confirmed against `lsqpack.h`.

use crate::varint;

/// `LSQPACK_LONGEST_TSS`: longest a Table State Synchronize instruction
/// can be.
pub const LONGEST_TSS: usize = 6;
/// `LSQPACK_LONGEST_CANCEL`: longest a Stream Cancellation instruction
/// can be.
pub const LONGEST_CANCEL: usize = 6;

/// `1xxxxxxx` + stream id, varint(7). Also the caller's cue to advance
/// `LargestKnownId = max(LargestKnownId, largest_ref)`.
pub fn emit_section_ack(out: &mut Vec<u8>, stream_id: u64) {
    varint::encode(stream_id, 7, 0x80, out);
}

pub fn len_section_ack(stream_id: u64) -> usize {
    varint::val2len(stream_id, 7)
}

/// `00xxxxxx` + varint(last_id - largest_known_id, 6). Only emitted when
/// `last_id > largest_known_id`; the caller advances `largest_known_id`
/// to `last_id` after writing.
pub fn emit_tss(out: &mut Vec<u8>, last_id: u64, largest_known_id: u64) {
    varint::encode(last_id - largest_known_id, 6, 0x00, out);
}

pub fn len_tss(last_id: u64, largest_known_id: u64) -> usize {
    varint::val2len(last_id - largest_known_id, 6)
}

/// `01xxxxxx` + stream id, varint(6).
pub fn emit_stream_cancel(out: &mut Vec<u8>, stream_id: u64) {
    varint::encode(stream_id, 6, 0x40, out);
}

pub fn len_stream_cancel(stream_id: u64) -> usize {
    varint::val2len(stream_id, 6)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn section_ack_sets_top_bit() {
        let mut out = Vec::new();
        emit_section_ack(&mut out, 9);
        assert_eq!(out[0] & 0x80, 0x80);
        assert_eq!(out.len(), len_section_ack(9));
    }

    #[test]
    fn tss_clears_top_two_bits() {
        let mut out = Vec::new();
        emit_tss(&mut out, 10, 4);
        assert_eq!(out[0] & 0xC0, 0x00);
        assert_eq!(out.len(), len_tss(10, 4));
    }

    #[test]
    fn stream_cancel_sets_01_prefix() {
        let mut out = Vec::new();
        emit_stream_cancel(&mut out, 3);
        assert_eq!(out[0] & 0xC0, 0x40);
    }
}
