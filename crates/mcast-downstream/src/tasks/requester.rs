// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Requester task: turns missed products into requests to the upstream.

use crate::connection::RequestSender;
use crate::error::Error;
use crate::memory::SessionMemory;
use std::sync::Arc;
use tracing::{debug, warn};

/// Drain the missed queue until it's shut down or a request can't be sent.
///
/// Each index is moved to the requested queue before its request goes out,
/// so a delivery can never arrive for an index that isn't queued.
pub async fn run(memory: Arc<SessionMemory>, requests: Arc<RequestSender>) -> Error {
    loop {
        let index = match memory.peek_missed_wait().await {
            Ok(index) => index,
            Err(e) => return e,
        };

        match memory.transfer_missed_to_requested(index) {
            Ok(true) => {}
            Ok(false) => {
                warn!("Missed product {} left the queue before it was requested", index);
                continue;
            }
            Err(e) => return e,
        }

        debug!("Requesting product {} from {}", index, requests.server());
        if let Err(e) = requests.request_product(index).await {
            return e;
        }
    }
}
