// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::HashMap;

use tracing::error;

/// A registered handler: reads the request payload, writes the response
/// payload in place, returns the number of bytes written. 0 signals failure
/// and is indistinguishable from a legitimately empty response on the wire.
///
/// Handlers must not retain the request view past their return; the cell is
/// reused as soon as the reply is on the wire.
pub type Handler = Box<dyn Fn(&[u8], &mut [u8]) -> usize + Send + Sync + 'static>;

/// Function-id to handler table. Filled before the server runs, immutable
/// afterwards (the server takes it by value).
#[derive(Default)]
pub struct HandlerMux {
    handlers: HashMap<u32, Handler>,
}

impl HandlerMux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `fn_id`.
    ///
    /// # Panics
    /// A duplicate `fn_id` is a startup misconfiguration and panics.
    pub fn register_handler<F>(&mut self, fn_id: u32, handler: F)
    where F: Fn(&[u8], &mut [u8]) -> usize + Send + Sync + 'static {
        if self.handlers.insert(fn_id, Box::new(handler)).is_some() {
            error!(fn_id, "mux: duplicate handler registration");
            panic!("mux: duplicate handler registration for fn_id={fn_id}");
        }
    }

    /// Run the handler for `fn_id` over the request, or return 0 when none
    /// is registered. The handler's claimed length is clamped to the
    /// response window.
    pub fn dispatch(&self, fn_id: u32, req: &[u8], resp: &mut [u8]) -> usize {
        match self.handlers.get(&fn_id) {
            Some(handler) => {
                let written = handler(req, resp);
                written.min(resp.len())
            },
            None => {
                error!(fn_id, "mux: handler not found");
                0
            },
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
