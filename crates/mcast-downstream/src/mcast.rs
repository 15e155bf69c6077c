// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Multicast transport boundary.
//!
//! A transport receives products from a multicast group, inserts them into
//! the product store and reports receipts and gaps to a [`GapNotifier`].
//! [`UdpMcastFactory`](crate::udp::UdpMcastFactory) is the network
//! implementation; [`MockMcastFactory`] lets tests drive a session by hand.

use crate::error::{Error, Result};
use crate::notifier::GapNotifier;
use crate::product_store::{InsertOutcome, ProductStore};
use crate::types::{McastInfo, ProdIndex, Product};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

/// A running multicast receiver.
pub trait McastReceiver: Send + Sync {
    /// Receive until stopped. Blocks the calling thread.
    ///
    /// Returns `Ok(())` after [`stop`](Self::stop), `Err` on failure.
    fn start(&self) -> Result<()>;

    /// Make `start` return. Callable from any thread, before or during
    /// `start`.
    fn stop(&self);
}

/// Creates a multicast receiver for one session.
pub trait McastReceiverFactory: Send + Sync {
    fn create(
        &self,
        store: Arc<dyn ProductStore>,
        info: &McastInfo,
        notifier: Arc<dyn GapNotifier>,
    ) -> Result<Arc<dyn McastReceiver>>;
}

/// Blocking stop flag shared by a receiver and its stopper.
#[derive(Default)]
pub(crate) struct StopSignal {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl StopSignal {
    pub(crate) fn stop(&self) {
        *self.stopped.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.cond.notify_all();
    }

    pub(crate) fn is_stopped(&self) -> bool {
        *self.stopped.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn wait(&self) {
        let mut stopped = self.stopped.lock().unwrap_or_else(PoisonError::into_inner);
        while !*stopped {
            stopped = self
                .cond
                .wait(stopped)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Session state captured by [`MockMcastFactory`].
struct MockSession {
    store: Arc<dyn ProductStore>,
    info: McastInfo,
    notifier: Arc<dyn GapNotifier>,
    stop: Arc<StopSignal>,
}

#[derive(Default)]
struct MockState {
    fail_create: Option<Error>,
    fail_start: Option<Error>,
    sessions: Vec<McastInfo>,
    current: Option<MockSession>,
}

/// Multicast transport driven by hand.
///
/// Each created receiver blocks in `start` until stopped. Tests inject
/// receipts with [`deliver`](Self::deliver) and gaps with
/// [`miss`](Self::miss) on the most recently created session.
#[derive(Clone, Default)]
pub struct MockMcastFactory {
    state: Arc<Mutex<MockState>>,
}

impl MockMcastFactory {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every later `create` fail with `err`.
    pub fn fail_create(&self, err: Error) {
        self.lock().fail_create = Some(err);
    }

    /// Make every later `start` fail with `err`.
    pub fn fail_start(&self, err: Error) {
        self.lock().fail_start = Some(err);
    }

    /// Group info of every created session, oldest first.
    pub fn sessions(&self) -> Vec<McastInfo> {
        self.lock().sessions.clone()
    }

    /// Returns true while a created receiver hasn't been stopped.
    pub fn is_active(&self) -> bool {
        self.lock()
            .current
            .as_ref()
            .map(|s| !s.stop.is_stopped())
            .unwrap_or(false)
    }

    /// Deliver a product to the current session as multicast would.
    pub fn deliver(&self, product: &Product) -> Result<InsertOutcome> {
        let (store, notifier) = {
            let state = self.lock();
            let session = state
                .current
                .as_ref()
                .ok_or_else(|| Error::System("no multicast session".into()))?;
            (session.store.clone(), session.notifier.clone())
        };

        let outcome = store.insert(product)?;
        if matches!(outcome, InsertOutcome::Inserted | InsertOutcome::Duplicate) {
            notifier.last_received(&product.info);
        }
        Ok(outcome)
    }

    /// Report a gap to the current session.
    pub fn miss(&self, index: ProdIndex) -> Result<()> {
        let notifier = self
            .lock()
            .current
            .as_ref()
            .map(|s| s.notifier.clone())
            .ok_or_else(|| Error::System("no multicast session".into()))?;
        notifier.missed_product(index);
        Ok(())
    }

    /// Group info of the current session.
    pub fn current_info(&self) -> Option<McastInfo> {
        self.lock().current.as_ref().map(|s| s.info.clone())
    }

    /// Make the current receiver's `start` return as if stopped.
    pub fn stop_current(&self) {
        if let Some(session) = self.lock().current.as_ref() {
            session.stop.stop();
        }
    }
}

impl McastReceiverFactory for MockMcastFactory {
    fn create(
        &self,
        store: Arc<dyn ProductStore>,
        info: &McastInfo,
        notifier: Arc<dyn GapNotifier>,
    ) -> Result<Arc<dyn McastReceiver>> {
        let mut state = self.lock();
        if let Some(err) = state.fail_create.clone() {
            return Err(err);
        }

        let stop = Arc::new(StopSignal::default());
        state.sessions.push(info.clone());
        state.current = Some(MockSession {
            store,
            info: info.clone(),
            notifier,
            stop: stop.clone(),
        });

        Ok(Arc::new(MockMcastReceiver {
            stop,
            fail_start: state.fail_start.clone(),
        }))
    }
}

struct MockMcastReceiver {
    stop: Arc<StopSignal>,
    fail_start: Option<Error>,
}

impl McastReceiver for MockMcastReceiver {
    fn start(&self) -> Result<()> {
        if let Some(err) = &self.fail_start {
            return Err(err.clone());
        }
        self.stop.wait();
        Ok(())
    }

    fn stop(&self) {
        self.stop.stop();
    }
}
