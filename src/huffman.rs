// Copyright 2022 - 2024 Wenmeng See the COPYRIGHT
// file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
//
// Canonical HPACK/QPACK Huffman table (the table itself is unchanged
// between HPACK and QPACK) reused verbatim from
// `hpack::huffman::HUFFMAN_CODE_ARRAY`. The decoder is rebuilt as a
// resumable bit-accumulator fed nibble-at-a-time; the encoder side is
// new, built to match.

use std::collections::HashMap;

use lazy_static::lazy_static;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HuffmanError {
    /// Padding strictly larger than 7 bits.
    PaddingTooLarge,
    /// Padding that is not the most-significant bits of EOS (i.e. not
    /// all 1s).
    InvalidPadding,
    /// The EOS symbol appeared within the string itself.
    EosInString,
    /// No code of any length matches the bits seen so far.
    InvalidCode,
}

/// (HPACK Huffman code, RFC 7541 Appendix B). 256 symbol codes followed
/// by the EOS code at index 256.
static HUFFMAN_CODE_ARRAY: &[(u32, u8)] = &[
    (0x1ff8, 13),
    (0x7fffd8, 23),
    (0xfffffe2, 28),
    (0xfffffe3, 28),
    (0xfffffe4, 28),
    (0xfffffe5, 28),
    (0xfffffe6, 28),
    (0xfffffe7, 28),
    (0xfffffe8, 28),
    (0xffffea, 24),
    (0x3ffffffc, 30),
    (0xfffffe9, 28),
    (0xfffffea, 28),
    (0x3ffffffd, 30),
    (0xfffffeb, 28),
    (0xfffffec, 28),
    (0xfffffed, 28),
    (0xfffffee, 28),
    (0xfffffef, 28),
    (0xffffff0, 28),
    (0xffffff1, 28),
    (0xffffff2, 28),
    (0x3ffffffe, 30),
    (0xffffff3, 28),
    (0xffffff4, 28),
    (0xffffff5, 28),
    (0xffffff6, 28),
    (0xffffff7, 28),
    (0xffffff8, 28),
    (0xffffff9, 28),
    (0xffffffa, 28),
    (0xffffffb, 28),
    (0x14, 6),
    (0x3f8, 10),
    (0x3f9, 10),
    (0xffa, 12),
    (0x1ff9, 13),
    (0x15, 6),
    (0xf8, 8),
    (0x7fa, 11),
    (0x3fa, 10),
    (0x3fb, 10),
    (0xf9, 8),
    (0x7fb, 11),
    (0xfa, 8),
    (0x16, 6),
    (0x17, 6),
    (0x18, 6),
    (0x0, 5),
    (0x1, 5),
    (0x2, 5),
    (0x19, 6),
    (0x1a, 6),
    (0x1b, 6),
    (0x1c, 6),
    (0x1d, 6),
    (0x1e, 6),
    (0x1f, 6),
    (0x5c, 7),
    (0xfb, 8),
    (0x7ffc, 15),
    (0x20, 6),
    (0xffb, 12),
    (0x3fc, 10),
    (0x1ffa, 13),
    (0x21, 6),
    (0x5d, 7),
    (0x5e, 7),
    (0x5f, 7),
    (0x60, 7),
    (0x61, 7),
    (0x62, 7),
    (0x63, 7),
    (0x64, 7),
    (0x65, 7),
    (0x66, 7),
    (0x67, 7),
    (0x68, 7),
    (0x69, 7),
    (0x6a, 7),
    (0x6b, 7),
    (0x6c, 7),
    (0x6d, 7),
    (0x6e, 7),
    (0x6f, 7),
    (0x70, 7),
    (0x71, 7),
    (0x72, 7),
    (0xfc, 8),
    (0x73, 7),
    (0xfd, 8),
    (0x1ffb, 13),
    (0x7fff0, 19),
    (0x1ffc, 13),
    (0x3ffc, 14),
    (0x22, 6),
    (0x7ffd, 15),
    (0x3, 5),
    (0x23, 6),
    (0x4, 5),
    (0x24, 6),
    (0x5, 5),
    (0x25, 6),
    (0x26, 6),
    (0x27, 6),
    (0x6, 5),
    (0x74, 7),
    (0x75, 7),
    (0x28, 6),
    (0x29, 6),
    (0x2a, 6),
    (0x7, 5),
    (0x2b, 6),
    (0x76, 7),
    (0x2c, 6),
    (0x8, 5),
    (0x9, 5),
    (0x2d, 6),
    (0x77, 7),
    (0x78, 7),
    (0x79, 7),
    (0x7a, 7),
    (0x7b, 7),
    (0x7ffe, 15),
    (0x7fc, 11),
    (0x3ffd, 14),
    (0x1ffd, 13),
    (0xffffffc, 28),
    (0xfffe6, 20),
    (0x3fffd2, 22),
    (0xfffe7, 20),
    (0xfffe8, 20),
    (0x3fffd3, 22),
    (0x3fffd4, 22),
    (0x3fffd5, 22),
    (0x7fffd9, 23),
    (0x3fffd6, 22),
    (0x7fffda, 23),
    (0x7fffdb, 23),
    (0x7fffdc, 23),
    (0x7fffdd, 23),
    (0x7fffde, 23),
    (0xffffeb, 24),
    (0x7fffdf, 23),
    (0xffffec, 24),
    (0xffffed, 24),
    (0x3fffd7, 22),
    (0x7fffe0, 23),
    (0xffffee, 24),
    (0x7fffe1, 23),
    (0x7fffe2, 23),
    (0x7fffe3, 23),
    (0x7fffe4, 23),
    (0x1fffdc, 21),
    (0x3fffd8, 22),
    (0x7fffe5, 23),
    (0x3fffd9, 22),
    (0x7fffe6, 23),
    (0x7fffe7, 23),
    (0xffffef, 24),
    (0x3fffda, 22),
    (0x1fffdd, 21),
    (0xfffe9, 20),
    (0x3fffdb, 22),
    (0x3fffdc, 22),
    (0x7fffe8, 23),
    (0x7fffe9, 23),
    (0x1fffde, 21),
    (0x7fffea, 23),
    (0x3fffdd, 22),
    (0x3fffde, 22),
    (0xfffff0, 24),
    (0x1fffdf, 21),
    (0x3fffdf, 22),
    (0x7fffeb, 23),
    (0x7fffec, 23),
    (0x1fffe0, 21),
    (0x1fffe1, 21),
    (0x3fffe0, 22),
    (0x1fffe2, 21),
    (0x7fffed, 23),
    (0x3fffe1, 22),
    (0x7fffee, 23),
    (0x7fffef, 23),
    (0xfffea, 20),
    (0x3fffe2, 22),
    (0x3fffe3, 22),
    (0x3fffe4, 22),
    (0x7ffff0, 23),
    (0x3fffe5, 22),
    (0x3fffe6, 22),
    (0x7ffff1, 23),
    (0x3ffffe0, 26),
    (0x3ffffe1, 26),
    (0xfffeb, 20),
    (0x7fff1, 19),
    (0x3fffe7, 22),
    (0x7ffff2, 23),
    (0x3fffe8, 22),
    (0x1ffffec, 25),
    (0x3ffffe2, 26),
    (0x3ffffe3, 26),
    (0x3ffffe4, 26),
    (0x7ffffde, 27),
    (0x7ffffdf, 27),
    (0x3ffffe5, 26),
    (0xfffff1, 24),
    (0x1ffffed, 25),
    (0x7fff2, 19),
    (0x1fffe3, 21),
    (0x3ffffe6, 26),
    (0x7ffffe0, 27),
    (0x7ffffe1, 27),
    (0x3ffffe7, 26),
    (0x7ffffe2, 27),
    (0xfffff2, 24),
    (0x1fffe4, 21),
    (0x1fffe5, 21),
    (0x3ffffe8, 26),
    (0x3ffffe9, 26),
    (0xffffffd, 28),
    (0x7ffffe3, 27),
    (0x7ffffe4, 27),
    (0x7ffffe5, 27),
    (0xfffec, 20),
    (0xfffff3, 24),
    (0xfffed, 20),
    (0x1fffe6, 21),
    (0x3fffe9, 22),
    (0x1fffe7, 21),
    (0x1fffe8, 21),
    (0x7ffff3, 23),
    (0x3fffea, 22),
    (0x3fffeb, 22),
    (0x1ffffee, 25),
    (0x1ffffef, 25),
    (0xfffff4, 24),
    (0xfffff5, 24),
    (0x3ffffea, 26),
    (0x7ffff4, 23),
    (0x3ffffeb, 26),
    (0x7ffffe6, 27),
    (0x3ffffec, 26),
    (0x3ffffed, 26),
    (0x7ffffe7, 27),
    (0x7ffffe8, 27),
    (0x7ffffe9, 27),
    (0x7ffffea, 27),
    (0x7ffffeb, 27),
    (0xffffffe, 28),
    (0x7ffffec, 27),
    (0x7ffffed, 27),
    (0x7ffffee, 27),
    (0x7ffffef, 27),
    (0x7fffff0, 27),
    (0x3ffffee, 26),
    (0x3fffffff, 30),
];

const EOS_SYMBOL: u16 = 256;

lazy_static! {
    static ref HUFFMAN_DECODE_MAP: HashMap<(u32, u8), u16> = {
        let mut m = HashMap::with_capacity(HUFFMAN_CODE_ARRAY.len());
        for (symbol, &(code, len)) in HUFFMAN_CODE_ARRAY.iter().enumerate() {
            m.insert((code, len), symbol as u16);
        }
        m
    };
}

#[inline]
fn code_for(byte: u8) -> (u32, u8) {
    HUFFMAN_CODE_ARRAY[byte as usize]
}

/// Number of bytes the Huffman encoding of `input` would occupy. Callers
/// use this to decide indexed-vs-literal and Huffman-vs-raw before
/// committing to an encoding.
pub fn encoded_len(input: &[u8]) -> usize {
    let bits: u64 = input.iter().map(|&b| code_for(b).1 as u64).sum();
    ((bits + 7) / 8) as usize
}

/// Encodes `input`, packing codes MSB-first and padding the trailing
/// partial byte with 1 bits (the EOS prefix).
pub fn encode(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(encoded_len(input));
    let mut acc: u64 = 0;
    let mut nbits: u32 = 0;
    for &b in input {
        let (code, len) = code_for(b);
        acc = (acc << len) | code as u64;
        nbits += len as u32;
        while nbits >= 8 {
            nbits -= 8;
            out.push((acc >> nbits) as u8);
        }
    }
    if nbits > 0 {
        let pad = 8 - nbits;
        acc = (acc << pad) | ((1u64 << pad) - 1);
        out.push(acc as u8);
    }
    out
}

/// Resumable Huffman decoder. Feeds bytes high-nibble-then-low-nibble,
/// so a caller can suspend between nibbles or bytes and resume later
/// without losing partial-code state.
#[derive(Debug, Clone)]
pub struct Decoder {
    current: u32,
    current_len: u8,
    /// Whether every bit accumulated since the last emitted symbol (or
    /// since the start) has been a 1 bit — the padding-validity flag.
    all_ones: bool,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Decoder { current: 0, current_len: 0, all_ones: true }
    }

    /// Feeds one input byte, high nibble first, appending decoded bytes
    /// to `out`. `out` grows as needed (the language-neutral design notes
    /// call for a doubling scratch buffer; `Vec::push` gives us that for
    /// free).
    pub fn feed_byte(&mut self, byte: u8, out: &mut Vec<u8>) -> Result<(), HuffmanError> {
        self.feed_nibble((byte >> 4) & 0xf, out)?;
        self.feed_nibble(byte & 0xf, out)
    }

    fn feed_nibble(&mut self, nibble: u8, out: &mut Vec<u8>) -> Result<(), HuffmanError> {
        for bit_pos in (0..4).rev() {
            let bit = (nibble >> bit_pos) & 1;
            self.current = (self.current << 1) | bit as u32;
            self.current_len += 1;
            if bit == 0 {
                self.all_ones = false;
            }

            if let Some(&sym) = HUFFMAN_DECODE_MAP.get(&(self.current, self.current_len)) {
                if sym == EOS_SYMBOL {
                    return Err(HuffmanError::EosInString);
                }
                out.push(sym as u8);
                self.current = 0;
                self.current_len = 0;
                self.all_ones = true;
            } else if self.current_len > 30 {
                return Err(HuffmanError::InvalidCode);
            }
        }
        Ok(())
    }

    /// Call once the input is exhausted. Accepts only if the remaining
    /// partial bits are a valid EOS-prefix padding (at most 7 bits, all
    /// 1s — EOS itself is the all-ones 30-bit code, so "all 1s" and
    /// "valid EOS prefix" coincide).
    pub fn finish(&self) -> Result<(), HuffmanError> {
        if self.current_len > 7 {
            return Err(HuffmanError::PaddingTooLarge);
        }
        if !self.all_ones {
            return Err(HuffmanError::InvalidPadding);
        }
        Ok(())
    }
}

/// Decodes a complete buffer in one call (the common case for
/// already-fully-buffered strings).
pub fn decode(buf: &[u8]) -> Result<Vec<u8>, HuffmanError> {
    let mut dec = Decoder::new();
    let mut out = Vec::with_capacity(buf.len() * 2);
    for &b in buf {
        dec.feed_byte(b, &mut out)?;
    }
    dec.finish()?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_ascii() {
        for s in ["", "a", "www.example.com", "no-cache", ":method", "GET"] {
            let encoded = encode(s.as_bytes());
            let decoded = decode(&encoded).unwrap();
            assert_eq!(decoded, s.as_bytes());
        }
    }

    #[test]
    fn encoded_len_matches_actual_output() {
        let s = b"Mon, 21 Oct 2013 20:13:21 GMT";
        assert_eq!(encode(s).len(), encoded_len(s));
    }

    #[test]
    fn resumable_decode_byte_at_a_time() {
        let s = b"custom-key: custom-value";
        let encoded = encode(s);
        let mut dec = Decoder::new();
        let mut out = Vec::new();
        for &b in &encoded {
            dec.feed_byte(b, &mut out).unwrap();
        }
        dec.finish().unwrap();
        assert_eq!(out, s);
    }

    #[test]
    fn padding_longer_than_seven_bits_is_rejected() {
        // Force a decoder into a state with 8 leftover bits by feeding
        // a nibble pair that can never complete a code at that length.
        let mut dec = Decoder::new();
        dec.current = 0;
        dec.current_len = 8;
        dec.all_ones = true;
        assert_eq!(dec.finish(), Err(HuffmanError::PaddingTooLarge));
    }

    #[test]
    fn non_all_ones_padding_is_rejected() {
        let mut dec = Decoder::new();
        dec.current = 0b0;
        dec.current_len = 3;
        dec.all_ones = false;
        assert_eq!(dec.finish(), Err(HuffmanError::InvalidPadding));
    }
}
