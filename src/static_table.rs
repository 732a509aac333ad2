// Copyright 2022 - 2024 Wenmeng See the COPYRIGHT
// file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
//
// QPACK static table (draft-ietf-quic-qpack-05 / RFC 9204 Appendix A),
// grounded on `hpack::header_index`'s `STATIC_TABLE_RAW` +
// `lazy_static`-built hash index construction, extended from HPACK's
// 61-entry table to QPACK's 98-entry one.

use std::collections::HashMap;

use lazy_static::lazy_static;

/// (name, value) pairs, 0-indexed, per RFC 9204 Appendix A.
pub static STATIC_TABLE: &[(&str, &str)] = &[
    (":authority", ""),
    (":path", "/"),
    ("age", "0"),
    ("content-disposition", ""),
    ("content-length", "0"),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("referer", ""),
    ("set-cookie", ""),
    (":method", "CONNECT"),
    (":method", "DELETE"),
    (":method", "GET"),
    (":method", "HEAD"),
    (":method", "OPTIONS"),
    (":method", "POST"),
    (":method", "PUT"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "103"),
    (":status", "200"),
    (":status", "304"),
    (":status", "404"),
    (":status", "503"),
    ("accept", "*/*"),
    ("accept-encoding", "gzip, deflate, br"),
    ("accept-ranges", "bytes"),
    ("access-control-allow-headers", "cache-control"),
    ("access-control-allow-headers", "content-type"),
    ("access-control-allow-origin", "*"),
    ("cache-control", "max-age=0"),
    ("cache-control", "max-age=2592000"),
    ("cache-control", "max-age=604800"),
    ("cache-control", "no-cache"),
    ("cache-control", "no-store"),
    ("cache-control", "public, max-age=31536000"),
    ("content-encoding", "br"),
    ("content-encoding", "gzip"),
    ("content-type", "application/dns-message"),
    ("content-type", "application/javascript"),
    ("content-type", "application/json"),
    ("content-type", "application/x-www-form-urlencoded"),
    ("content-type", "image/gif"),
    ("content-type", "image/jpeg"),
    ("content-type", "image/png"),
    ("content-type", "text/css"),
    ("content-type", "text/html; charset=utf-8"),
    ("content-type", "text/plain"),
    ("content-type", "text/plain;charset=utf-8"),
    ("range", "bytes=0-"),
    ("strict-transport-security", "max-age=15552000"),
    ("strict-transport-security", "max-age=15552000; includesubdomains"),
    ("strict-transport-security", "max-age=15552000; includesubdomains; preload"),
    ("vary", "accept-encoding"),
    ("vary", "origin"),
    ("x-content-type-options", "nosniff"),
    ("x-xss-protection", "1; mode=block"),
    (":status", "100"),
    (":status", "204"),
    (":status", "206"),
    (":status", "302"),
    (":status", "400"),
    (":status", "403"),
    (":status", "421"),
    (":status", "425"),
    (":status", "500"),
    ("accept-language", ""),
    ("access-control-allow-credentials", "FALSE"),
    ("access-control-allow-credentials", "TRUE"),
    ("access-control-allow-headers", "*"),
    ("access-control-allow-methods", "get"),
    ("access-control-allow-methods", "get, post, options"),
    ("access-control-allow-methods", "options"),
    ("access-control-expose-headers", "content-length"),
    ("access-control-request-headers", "content-type"),
    ("access-control-request-method", "get"),
    ("access-control-request-method", "post"),
    ("alt-svc", "clear"),
    ("authorization", ""),
    ("content-security-policy", "script-src 'none'; object-src 'none'; base-uri 'none'"),
    ("early-data", "1"),
    ("expect-ct", ""),
    ("forwarded", ""),
    ("if-range", ""),
    ("origin", ""),
    ("purpose", "prefetch"),
    ("server", ""),
    ("timing-allow-origin", "*"),
    ("upgrade-insecure-requests", "1"),
    ("user-agent", ""),
    ("x-forwarded-for", ""),
    ("x-frame-options", "deny"),
    ("x-frame-options", "sameorigin"),
];

lazy_static! {
    /// name+value -> index, for full-match lookup.
    static ref FULL_HASH: HashMap<(&'static str, &'static str), u32> = {
        let mut m = HashMap::with_capacity(STATIC_TABLE.len());
        for (idx, &pair) in STATIC_TABLE.iter().enumerate() {
            m.entry(pair).or_insert(idx as u32);
        }
        m
    };
    /// name -> first index with that name, for name-only lookup.
    static ref NAME_HASH: HashMap<&'static str, u32> = {
        let mut m = HashMap::with_capacity(STATIC_TABLE.len());
        for (idx, &(name, _)) in STATIC_TABLE.iter().enumerate() {
            m.entry(name).or_insert(idx as u32);
        }
        m
    };
}

pub fn len() -> usize {
    STATIC_TABLE.len()
}

/// Gets the `(name, value)` pair at a static-table index.
pub fn get(index: u32) -> Option<(&'static str, &'static str)> {
    STATIC_TABLE.get(index as usize).copied()
}

/// Full-match lookup: `Some(id)` if both name and value are found at the
/// same row.
pub fn find_full(name: &str, value: &str) -> Option<u32> {
    FULL_HASH.get(&(name, value)).copied()
}

/// Name-only lookup: `Some(id)` of the first row with this name,
/// regardless of value.
pub fn find_name(name: &str) -> Option<u32> {
    NAME_HASH.get(name).copied()
}
