// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use verbs_rpc_rs::wire::{
    HEADER_LEN, RpcHeader, make_req_id, seq_of_req_id, slot_of_req_id,
};

#[test]
fn response_echo_preserves_req_id() {
    // A response writes a fresh header that must carry the request id
    // byte-for-byte; the correlation protocol depends on it.
    let req_id = make_req_id(0xDEAD_BEEF, 17);
    let request = RpcHeader::new(req_id, 128, 4);

    let mut cell = vec![0u8; 64];
    request.write_to_cell(&mut cell);

    let parsed = RpcHeader::read_from_cell(&cell).expect("header parses");
    let response = RpcHeader::new(parsed.req_id.get(), 4096, parsed.fn_id.get());

    assert_eq!(response.req_id.get(), req_id);
    assert_eq!(slot_of_req_id(response.req_id.get()), 17);
    assert_eq!(seq_of_req_id(response.req_id.get()), 0xDEAD_BEEF);
}

#[test]
fn payload_starts_right_after_header() {
    let mut cell = vec![0u8; HEADER_LEN + 8];
    RpcHeader::new(1, 8, 2).write_to_cell(&mut cell);
    cell[HEADER_LEN..].copy_from_slice(&[9u8; 8]);

    let parsed = RpcHeader::read_from_cell(&cell).expect("header parses");
    assert_eq!(parsed.payload_len.get(), 8);
    assert_eq!(&cell[HEADER_LEN..], &[9u8; 8]);
}

#[test]
fn slot_field_covers_full_32_bits() {
    for slot in [0u32, 1, 127, u32::MAX] {
        let id = make_req_id(99, slot);
        assert_eq!(slot_of_req_id(id), slot);
        assert_eq!(seq_of_req_id(id), 99);
    }
}
