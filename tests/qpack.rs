// Copyright 2022 - 2024 Wenmeng See the COPYRIGHT
// file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
//
// End-to-end encoder -> decoder round trips.

use qpack::{Decoder, DecoderConfig, Encoder, EncoderConfig, EncoderOpts, Outcome};

fn new_encoder() -> Encoder {
    let mut enc = Encoder::new();
    let mut tsu = Vec::new();
    enc.init(
        EncoderConfig { max_table_size: 4096, dyn_table_size: 4096, max_risked_streams: 16, opts: EncoderOpts::empty() },
        &mut tsu,
    )
    .unwrap();
    enc
}

fn new_decoder() -> Decoder {
    let mut dec = Decoder::new();
    dec.init(
        DecoderConfig { max_table_size: 4096, dyn_table_size: 4096, max_risked_streams: 16 },
        Box::new(|_| {}),
    );
    dec
}

fn drive(enc: &mut Encoder, dec: &mut Decoder, handle: u64, stream_id: u64, headers: &[(&[u8], &[u8])]) -> Vec<(Vec<u8>, Vec<u8>)> {
    let (fields, _enc_buf, _dec_buf) = drive_with_enc_buf(enc, dec, handle, stream_id, headers);
    fields
}

fn drive_with_enc_buf(
    enc: &mut Encoder,
    dec: &mut Decoder,
    handle: u64,
    stream_id: u64,
    headers: &[(&[u8], &[u8])],
) -> (Vec<(Vec<u8>, Vec<u8>)>, Vec<u8>, Vec<u8>) {
    enc.start_header(stream_id, 0);
    let mut enc_buf = Vec::new();
    let mut hea_buf = Vec::new();
    for (name, value) in headers {
        enc.encode(name, value, false, &mut enc_buf, 4096, &mut hea_buf, 4096).unwrap();
    }
    enc.end_header(&mut hea_buf).unwrap();

    if !enc_buf.is_empty() {
        dec.enc_stream_in(&enc_buf).unwrap();
    }
    let mut dec_buf = Vec::new();
    let fields = match dec.header_in(handle, stream_id, hea_buf.len() as u64, &hea_buf, &mut dec_buf).unwrap() {
        Outcome::Done(set) => {
            let out = set.fields.iter().map(|f| (f.name.clone(), f.value.clone())).collect();
            dec.destroy_header_set(set);
            out
        }
        Outcome::Need => panic!("block did not complete in one feed"),
        Outcome::Blocked => panic!("unexpectedly blocked"),
    };
    (fields, enc_buf, dec_buf)
}

#[test]
fn static_full_match_round_trips_with_no_encoder_stream_traffic() {
    let mut enc = new_encoder();
    let mut dec = new_decoder();
    enc.start_header(1, 0);
    let mut enc_buf = Vec::new();
    let mut hea_buf = Vec::new();
    enc.encode(b":method", b"GET", false, &mut enc_buf, 4096, &mut hea_buf, 4096).unwrap();
    enc.end_header(&mut hea_buf).unwrap();
    assert!(enc_buf.is_empty(), "a full static match never touches the encoder stream");

    let mut dec_buf = Vec::new();
    let outcome = dec.header_in(1, 1, hea_buf.len() as u64, &hea_buf, &mut dec_buf).unwrap();
    match outcome {
        Outcome::Done(set) => {
            assert_eq!(set.fields.len(), 1);
            assert_eq!(set.fields[0].name, b":method");
            assert_eq!(set.fields[0].value, b"GET");
        }
        _ => panic!("expected Done"),
    }
}

#[test]
fn unknown_header_decodes_correctly_as_a_literal_on_first_sighting() {
    let mut enc = new_encoder();
    let mut dec = new_decoder();
    // The encoder's history withholds indexing until a header has been
    // seen at least twice, so a single sighting is a pure literal - no
    // encoder-stream traffic at all.
    let (fields, enc_buf, _dec_buf) = drive_with_enc_buf(&mut enc, &mut dec, 1, 1, &[(b"x-custom-header", b"some-value")]);
    assert_eq!(fields, vec![(b"x-custom-header".to_vec(), b"some-value".to_vec())]);
    assert!(enc_buf.is_empty());
}

#[test]
fn header_seen_twice_is_indexed_then_reused_on_third_sighting() {
    let mut enc = new_encoder();
    let mut dec = new_decoder();

    let (first, first_enc_buf, _first_dec_buf) = drive_with_enc_buf(&mut enc, &mut dec, 1, 1, &[(b"x-trace-id", b"abc123")]);
    assert_eq!(first, vec![(b"x-trace-id".to_vec(), b"abc123".to_vec())]);
    assert!(first_enc_buf.is_empty(), "first sighting must not index yet");

    let (second, second_enc_buf, second_dec_buf) = drive_with_enc_buf(&mut enc, &mut dec, 2, 3, &[(b"x-trace-id", b"abc123")]);
    assert_eq!(second, vec![(b"x-trace-id".to_vec(), b"abc123".to_vec())]);
    assert!(!second_enc_buf.is_empty(), "second sighting should insert into the dynamic table");
    assert!(!second_dec_buf.is_empty(), "a block that touched the dynamic table owes a section-ack");

    let (third, third_enc_buf, _third_dec_buf) = drive_with_enc_buf(&mut enc, &mut dec, 3, 5, &[(b"x-trace-id", b"abc123")]);
    assert_eq!(third, vec![(b"x-trace-id".to_vec(), b"abc123".to_vec())]);
    assert!(third_enc_buf.is_empty(), "third sighting should just reference the existing entry");
}

#[test]
fn compressible_value_round_trips_through_huffman() {
    let mut enc = new_encoder();
    let mut dec = new_decoder();
    let fields = drive(&mut enc, &mut dec, 1, 1, &[(b"accept-encoding", b"gzip, deflate, br")]);
    assert_eq!(fields, vec![(b"accept-encoding".to_vec(), b"gzip, deflate, br".to_vec())]);
}

#[test]
fn multiple_fields_in_one_block_round_trip_in_order() {
    let mut enc = new_encoder();
    let mut dec = new_decoder();
    let headers: &[(&[u8], &[u8])] = &[
        (b":method", b"GET"),
        (b":path", b"/index.html"),
        (b"x-request-id", b"req-42"),
    ];
    let fields = drive(&mut enc, &mut dec, 1, 1, headers);
    assert_eq!(
        fields,
        vec![
            (b":method".to_vec(), b"GET".to_vec()),
            (b":path".to_vec(), b"/index.html".to_vec()),
            (b"x-request-id".to_vec(), b"req-42".to_vec()),
        ]
    );
}

#[test]
fn capacity_shrink_propagates_to_decoder_and_evicts() {
    let mut enc = new_encoder();
    let mut dec = new_decoder();
    // Two sightings each so both headers actually land in the table.
    let _ = drive(&mut enc, &mut dec, 1, 1, &[(b"x-a", b"1"), (b"x-b", b"2")]);
    let _ = drive(&mut enc, &mut dec, 2, 3, &[(b"x-a", b"1"), (b"x-b", b"2")]);

    let mut tsu = Vec::new();
    enc.set_max_capacity(32, &mut tsu).unwrap();
    assert!(!tsu.is_empty());
    dec.enc_stream_in(&tsu).unwrap();

    // Feeding the capacity update must not panic even though it evicts
    // entries the earlier blocks referenced (they are long since acked).
    let fields = drive(&mut enc, &mut dec, 3, 5, &[(b":method", b"POST")]);
    assert_eq!(fields, vec![(b":method".to_vec(), b"POST".to_vec())]);
}

#[test]
fn section_ack_round_trips_back_to_the_encoder() {
    let mut enc = new_encoder();
    let mut dec = new_decoder();
    // First sighting is a bare literal; the second touches the dynamic
    // table and stays parked in the encoder's header-info ledger until
    // the matching Section-Ack arrives.
    let (_, _, first_dec_buf) = drive_with_enc_buf(&mut enc, &mut dec, 1, 7, &[(b"x-needs-ack", b"yes")]);
    assert!(first_dec_buf.is_empty(), "first sighting never touches the dynamic table");
    let (_, _, second_dec_buf) = drive_with_enc_buf(&mut enc, &mut dec, 2, 7, &[(b"x-needs-ack", b"yes")]);
    assert!(!second_dec_buf.is_empty(), "the decoder itself must produce the section-ack bytes");

    enc.decoder_stream_in(&second_dec_buf).unwrap();
}
