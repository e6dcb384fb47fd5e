// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use verbs_rpc_rs::engine::mux::HandlerMux;

fn fanout_mux(handlers: u32) -> HandlerMux {
    let mut mux = HandlerMux::new();
    for fn_id in 0..handlers {
        mux.register_handler(fn_id, move |req, resp| {
            let fill = 0x20u8 + fn_id as u8;
            resp[..req.len()].fill(fill);
            req.len()
        });
    }
    mux
}

#[test]
fn twenty_handlers_dispatch_independently() {
    let mux = fanout_mux(20);
    assert_eq!(mux.len(), 20);

    let req = [0u8; 128];
    let mut resp = [0u8; 128];
    for fn_id in 0..20 {
        let n = mux.dispatch(fn_id, &req, &mut resp);
        assert_eq!(n, 128);
        assert!(resp.iter().all(|&b| b == 0x20 + fn_id as u8));
    }
}

#[test]
fn dispatch_outside_table_returns_zero() {
    let mux = fanout_mux(20);
    let mut resp = [0u8; 16];
    assert_eq!(mux.dispatch(20, b"x", &mut resp), 0);
    assert_eq!(mux.dispatch(u32::MAX, b"x", &mut resp), 0);
}

#[test]
fn handler_sees_exact_request_window() {
    let mut mux = HandlerMux::new();
    mux.register_handler(9, |req, resp| {
        assert_eq!(req, b"abc");
        resp[..3].copy_from_slice(req);
        3
    });

    let mut resp = [0u8; 8];
    assert_eq!(mux.dispatch(9, b"abc", &mut resp), 3);
    assert_eq!(&resp[..3], b"abc");
}
