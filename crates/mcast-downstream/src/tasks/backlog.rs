// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Backlog request, sent once per session on the first multicast product.

use crate::connection::RequestSender;
use crate::types::BacklogSpec;
use std::sync::Arc;
use tracing::{debug, warn};

/// Send one backlog request. Failures are only logged: backlog recovery is
/// best effort and never ends a session.
pub async fn run(requests: Arc<RequestSender>, spec: BacklogSpec) {
    match requests.request_backlog(spec).await {
        Ok(()) => debug!("Backlog requested from {}", requests.server()),
        Err(e) => warn!("Couldn't request backlog from {}: {}", requests.server(), e),
    }
}
