// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Downstream coordinator.
//!
//! Runs sessions against one upstream server until shut down:
//!
//! ```text
//! Idle -> Connecting -> Subscribing -> Running -> Draining -> Waiting -> Idle ...
//!                                                     \
//!                                                      -> Shutdown
//! ```
//!
//! A session ends with the first exit of its three tasks. Storage and
//! system failures end the process; everything else is retried after
//! `retry_interval_secs`.

use crate::config::{ConfigError, DownstreamConfig};
use crate::connection::UpstreamConnection;
use crate::error::{Error, Result};
use crate::mcast::McastReceiverFactory;
use crate::memory::SessionMemory;
use crate::notifier::SessionNotifier;
use crate::product_store::ProductStore;
use crate::tasks::receiver::UnicastReceiver;
use crate::tasks::{multicast, requester, TaskGroup, TaskKind};
use crate::types::{McastInfo, Signature};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

/// Observable state of the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Subscribing,
    Running,
    Draining,
    /// Sleeping before the next session
    Waiting,
    Shutdown,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Subscribing => "subscribing",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Waiting => "waiting",
            Self::Shutdown => "shut down",
        };
        f.write_str(s)
    }
}

/// Downstream node - receives a feed by multicast and recovers what
/// multicast missed.
#[derive(Clone)]
pub struct Downstream {
    config: Arc<DownstreamConfig>,
    store: Arc<dyn ProductStore>,
    mcast: Arc<dyn McastReceiverFactory>,
    shutdown: Arc<Notify>,
    done: Arc<AtomicBool>,
    state: Arc<watch::Sender<SessionState>>,
}

impl Downstream {
    /// Create a downstream node.
    pub fn new(
        config: DownstreamConfig,
        store: Arc<dyn ProductStore>,
        mcast: Arc<dyn McastReceiverFactory>,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;

        let (state, _) = watch::channel(SessionState::Idle);
        Ok(Self {
            config: Arc::new(config),
            store,
            mcast,
            shutdown: Arc::new(Notify::new()),
            done: Arc::new(AtomicBool::new(false)),
            state: Arc::new(state),
        })
    }

    pub fn config(&self) -> &DownstreamConfig {
        &self.config
    }

    /// Subscribe to state changes.
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Request shutdown. Idempotent; callable from any task.
    pub fn shutdown(&self) {
        if !self.done.swap(true, Ordering::SeqCst) {
            info!("Shutdown requested");
        }
        self.shutdown.notify_waiters();
    }

    pub fn is_shutdown(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: SessionState) {
        debug!("Downstream {}", state);
        self.state.send_replace(state);
    }

    /// Resolves once shutdown has been requested.
    async fn shutdown_requested(&self) {
        let notified = self.shutdown.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_shutdown() {
            return;
        }
        notified.await;
    }

    /// Run sessions until shutdown or a fatal error.
    ///
    /// Returns `Ok(())` after an external shutdown and the fatal error
    /// otherwise.
    pub async fn run(&self) -> Result<()> {
        info!(
            "Downstream starting: feed {} from {}",
            self.config.feed, self.config.server
        );

        let result = loop {
            if self.is_shutdown() {
                break Ok(());
            }

            self.set_state(SessionState::Idle);
            let status = self.run_once().await;

            if status.is_fatal() {
                error!("Terminating: {}", status);
                break Err(status);
            }
            if self.is_shutdown() {
                break Ok(());
            }
            if status.is_config() {
                error!("Session failed (check configuration): {}", status);
            } else if !status.is_shutdown() {
                warn!("Session failed: {}", status);
            }

            if !self.nap().await {
                break Ok(());
            }
        };

        self.set_state(SessionState::Shutdown);
        info!("Downstream stopped");
        result
    }

    /// Interruptible sleep. Returns `false` if shutdown was requested.
    async fn nap(&self) -> bool {
        self.set_state(SessionState::Waiting);
        let interval = self.config.retry_interval();
        debug!("Retrying in {:?}", interval);
        tokio::select! {
            _ = tokio::time::sleep(interval) => !self.is_shutdown(),
            _ = self.shutdown_requested() => false,
        }
    }

    /// One session, with its session memory open for its whole duration.
    async fn run_once(&self) -> Error {
        let memory = match SessionMemory::open_for_session(
            &self.config.session_dir,
            &self.config.server,
            self.config.feed,
        ) {
            Ok(memory) => Arc::new(memory),
            Err(e) => {
                error!("Couldn't open session memory: {}", e);
                return e;
            }
        };

        let status = match memory.last_mcast_signature() {
            Ok(prev_last) => self.connect_and_execute(memory.clone(), prev_last).await,
            Err(e) => e,
        };

        if let Err(e) = memory.close() {
            error!("Couldn't close session memory: {}", e);
            return e;
        }
        status
    }

    async fn connect_and_execute(
        &self,
        memory: Arc<SessionMemory>,
        prev_last: Option<Signature>,
    ) -> Error {
        let config = &self.config;

        self.set_state(SessionState::Connecting);
        let connected = tokio::select! {
            res = UpstreamConnection::connect(
                &config.server,
                config.connect_timeout(),
                config.max_message_size,
            ) => res,
            _ = self.shutdown_requested() => return Error::Shutdown,
        };
        let mut conn = match connected {
            Ok(conn) => conn,
            Err(e) => return e,
        };

        self.set_state(SessionState::Subscribing);
        let subscribed = tokio::select! {
            res = conn.subscribe(config.feed, config.rpc_timeout()) => Some(res),
            _ = self.shutdown_requested() => None,
        };
        let info = match subscribed {
            Some(Ok(info)) => info,
            Some(Err(e)) => {
                conn.close();
                return e;
            }
            None => {
                conn.close();
                return Error::Shutdown;
            }
        };
        info!(
            "Subscribed to feed {} on {}: multicast group {}",
            info.feed, config.server, info.group
        );

        self.execute(conn, info, memory, prev_last).await
    }

    /// Run the three session tasks until the first one exits or shutdown is
    /// requested, then tear the session down.
    async fn execute(
        &self,
        conn: UpstreamConnection,
        info: McastInfo,
        memory: Arc<SessionMemory>,
        prev_last: Option<Signature>,
    ) -> Error {
        let config = &self.config;
        let (requests, reader, control) = conn.into_session_parts();
        let requests = Arc::new(requests);

        let notifier = Arc::new(SessionNotifier::new(
            memory.clone(),
            requests.clone(),
            Handle::current(),
            prev_last,
            config.backlog_time_offset_secs,
        ));

        let receiver = match self
            .mcast
            .create(self.store.clone(), &info, notifier.clone())
        {
            Ok(receiver) => receiver,
            Err(e) => {
                error!("Couldn't create multicast receiver for {}: {}", info.group, e);
                control.shutdown_write();
                control.shutdown_read();
                return e;
            }
        };

        let stop = Arc::new(Notify::new());
        let unicast = UnicastReceiver::new(
            reader,
            memory.clone(),
            self.store.clone(),
            stop.clone(),
            config.server.clone(),
            config.feed,
        );

        self.set_state(SessionState::Running);
        let mut tasks = TaskGroup::new();
        tasks.spawn(TaskKind::McastReceiver, multicast::run(receiver.clone()));
        tasks.spawn(
            TaskKind::Requester,
            requester::run(memory.clone(), requests.clone()),
        );
        tasks.spawn(TaskKind::UnicastReceiver, unicast.run());

        tokio::select! {
            _ = tasks.wait_first() => {}
            _ = self.shutdown_requested() => {}
        }

        // Release everything the tasks can block on.
        self.set_state(SessionState::Draining);
        receiver.stop();
        memory.shutdown_missed();
        control.shutdown_write();
        control.shutdown_read();
        stop.notify_one();

        let first = tasks.join().await;
        notifier.abort_backlog();

        if self.is_shutdown() {
            return Error::Shutdown;
        }
        match first {
            Some((kind, status)) => {
                info!("Session ended by the {} task: {}", kind, status);
                status
            }
            None => Error::Shutdown,
        }
    }
}
