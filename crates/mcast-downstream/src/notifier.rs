// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Gap notifier: the callbacks a multicast transport uses to report what
//! it received and what it missed.

use crate::connection::RequestSender;
use crate::memory::SessionMemory;
use crate::tasks::backlog;
use crate::types::{BacklogSpec, ProdIndex, ProductInfo, Signature};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Receives per-product reports from a multicast transport.
///
/// Both methods are called from the transport's receive thread and must
/// not block.
pub trait GapNotifier: Send + Sync {
    /// The product with this index was not received.
    fn missed_product(&self, index: ProdIndex);

    /// A product was received and stored (or was already stored).
    fn last_received(&self, info: &ProductInfo);
}

/// Notifier bound to one session.
///
/// Records gaps in the session memory and starts backlog recovery on the
/// first product received in the session.
pub struct SessionNotifier {
    memory: Arc<SessionMemory>,
    requests: Arc<RequestSender>,
    runtime: Handle,
    prev_last: Option<Signature>,
    time_offset_secs: u32,
    first_mcast: OnceLock<Signature>,
    mcast_working: AtomicBool,
    backlog: Mutex<Option<JoinHandle<()>>>,
}

impl SessionNotifier {
    /// `prev_last` is the last multicast signature of the previous session.
    pub fn new(
        memory: Arc<SessionMemory>,
        requests: Arc<RequestSender>,
        runtime: Handle,
        prev_last: Option<Signature>,
        time_offset_secs: u32,
    ) -> Self {
        Self {
            memory,
            requests,
            runtime,
            prev_last,
            time_offset_secs,
            first_mcast: OnceLock::new(),
            mcast_working: AtomicBool::new(false),
            backlog: Mutex::new(None),
        }
    }

    /// Returns true once multicast has delivered a product this session.
    pub fn mcast_working(&self) -> bool {
        self.mcast_working.load(Ordering::SeqCst)
    }

    /// Signature of the first product received this session.
    pub fn first_mcast_signature(&self) -> Option<Signature> {
        self.first_mcast.get().copied()
    }

    /// Stop the backlog request if it's still running.
    pub fn abort_backlog(&self) {
        let handle = self
            .backlog
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    fn start_backlog(&self, first: Signature) {
        let spec = BacklogSpec {
            after: self.prev_last,
            before: first,
            time_offset_secs: self.time_offset_secs,
        };
        match &spec.after {
            Some(after) => info!("Requesting backlog from {} to {}", after, first),
            None => info!(
                "Requesting backlog of the last {} s up to {}",
                spec.time_offset_secs, first
            ),
        }

        let handle = self
            .runtime
            .spawn(backlog::run(self.requests.clone(), spec));
        *self.backlog.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }
}

impl GapNotifier for SessionNotifier {
    fn missed_product(&self, index: ProdIndex) {
        debug!("Missed product {}", index);
        // Best effort: the memory may already be closed during teardown.
        if let Err(e) = self.memory.add_missed(index) {
            debug!("Couldn't record missed product {}: {}", index, e);
        }
    }

    fn last_received(&self, info: &ProductInfo) {
        if let Err(e) = self.memory.set_last_mcast_signature(&info.signature) {
            warn!(
                "Couldn't save signature of last multicast product {}: {}",
                info.signature, e
            );
        }

        if self.first_mcast.set(info.signature).is_ok() {
            self.mcast_working.store(true, Ordering::SeqCst);
            self.start_backlog(info.signature);
        }
    }
}
