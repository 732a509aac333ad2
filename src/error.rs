// Copyright 2022 - 2024 Wenmeng See the COPYRIGHT
// file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::fmt;

use crate::huffman::HuffmanError;
use crate::varint::VarIntError;

/// Where a fatal error was detected: the header-block parser or the
/// encoder-stream parser. Kept distinct so a caller can log or cancel
/// the right half of the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorLocation {
    HeaderBlock,
    EncStream,
    DecStream,
}

/// The `{location, line, offset, stream_id}` tuple every fatal error
/// carries for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorContext {
    pub location: ErrorLocation,
    pub line: u32,
    pub offset: u64,
    pub stream_id: u64,
}

impl ErrorContext {
    pub fn new(location: ErrorLocation, line: u32, offset: u64, stream_id: u64) -> Self {
        ErrorContext { location, line, offset, stream_id }
    }
}

/// Malformed wire input. Fatal for the stream it occurred on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// A varint decoded past the 63-bit ceiling, or used more than
    /// `LSQPACK_UINT64_ENC_SZ` continuation bytes.
    IntegerOverflow,
    /// Reference to a static- or dynamic-table index that does not exist.
    BadIndex,
    /// Reference to a static-table index `>=` the static table's length.
    StaticIndexOutOfBounds,
    /// A Huffman string did not end in an EOS-accepted suspension point.
    HuffmanNotAccepted,
    /// Table State Synchronize argument was zero or exceeded `InsCount`.
    BadTss,
    /// Stream Cancellation named a stream with no outstanding header info.
    UnknownCancelStream,
    /// Duplicate instruction named an index that is not present.
    BadDuplicateIndex,
    /// A capacity update exceeded the negotiated maximum table size.
    CapacityTooLarge,
    /// `LargestReference` exceeded `2 * MaxEntries`.
    BadLargestReference,
}

impl ProtocolError {
    fn description_str(&self) -> &'static str {
        match self {
            ProtocolError::IntegerOverflow => "varint overflowed 63 bits",
            ProtocolError::BadIndex => "reference to a nonexistent table index",
            ProtocolError::StaticIndexOutOfBounds => "static table index out of bounds",
            ProtocolError::HuffmanNotAccepted => "huffman string did not end at an accepted state",
            ProtocolError::BadTss => "table state synchronize count invalid",
            ProtocolError::UnknownCancelStream => "stream cancellation for unknown stream",
            ProtocolError::BadDuplicateIndex => "duplicate of nonexistent index",
            ProtocolError::CapacityTooLarge => "capacity update exceeds negotiated maximum",
            ProtocolError::BadLargestReference => "largest reference out of range",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpackError {
    /// Destination buffer for encoder-stream output was too small.
    NoBufEnc,
    /// Destination buffer for header-block output was too small.
    NoBufHead,
    /// Input truncated at a resumable suspension point.
    NeedMore,
    /// Decoder is waiting on a future dynamic-table insertion.
    Blocked,
    /// Malformed wire input, see `ProtocolError`.
    Protocol(ProtocolError, ErrorContext),
    /// The instance could not obtain memory for a table push; soft in
    /// the planner (falls back to non-indexing), hard elsewhere.
    AllocFailure,
}

impl From<VarIntError> for ProtocolError {
    fn from(_: VarIntError) -> Self {
        ProtocolError::IntegerOverflow
    }
}

impl From<HuffmanError> for ProtocolError {
    fn from(_: HuffmanError) -> Self {
        ProtocolError::HuffmanNotAccepted
    }
}

impl QpackError {
    fn description_str(&self) -> &'static str {
        match self {
            QpackError::NoBufEnc => "encoder stream output buffer too small",
            QpackError::NoBufHead => "header block output buffer too small",
            QpackError::NeedMore => "need more input bytes",
            QpackError::Blocked => "blocked awaiting a future dynamic table insertion",
            QpackError::Protocol(p, _) => p.description_str(),
            QpackError::AllocFailure => "allocation failure",
        }
    }
}

impl fmt::Display for QpackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description_str())
    }
}

impl std::error::Error for QpackError {}

pub type QpackResult<T> = Result<T, QpackError>;
