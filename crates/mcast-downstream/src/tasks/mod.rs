// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Session tasks and their supervision.
//!
//! Each long-lived task of a session resolves to the [`Error`] that ended
//! it (`Error::Shutdown` for a clean stop). The [`TaskGroup`] keeps the
//! first status to arrive; later ones are logged and dropped.

pub mod backlog;
pub mod multicast;
pub mod receiver;
pub mod requester;

use crate::error::Error;
use std::fmt;
use std::future::Future;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// The long-lived tasks of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Requester,
    UnicastReceiver,
    McastReceiver,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requester => write!(f, "requester"),
            Self::UnicastReceiver => write!(f, "unicast receiver"),
            Self::McastReceiver => write!(f, "multicast receiver"),
        }
    }
}

/// Supervised group of session tasks.
pub struct TaskGroup {
    tx: mpsc::UnboundedSender<(TaskKind, Error)>,
    rx: mpsc::UnboundedReceiver<(TaskKind, Error)>,
    handles: Vec<(TaskKind, JoinHandle<()>)>,
    first: Option<(TaskKind, Error)>,
}

impl TaskGroup {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx,
            handles: Vec::new(),
            first: None,
        }
    }

    /// Spawn a task whose output is its exit status.
    pub fn spawn<F>(&mut self, kind: TaskKind, fut: F)
    where
        F: Future<Output = Error> + Send + 'static,
    {
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            let status = fut.await;
            // Receiver dropped means the session is already gone.
            let _ = tx.send((kind, status));
        });
        self.handles.push((kind, handle));
    }

    fn record(&mut self, kind: TaskKind, status: Error) {
        if status.is_shutdown() {
            debug!("The {} task stopped", kind);
        } else {
            debug!("The {} task exited: {}", kind, status);
        }
        if self.first.is_none() {
            self.first = Some((kind, status));
        }
    }

    /// Wait until some task has exited and return the first exit.
    ///
    /// Cancel-safe. Returns `None` only if the group is empty.
    pub async fn wait_first(&mut self) -> Option<(TaskKind, Error)> {
        if self.first.is_none() {
            if self.handles.is_empty() {
                return None;
            }
            if let Some((kind, status)) = self.rx.recv().await {
                self.record(kind, status);
            }
        }
        self.first.clone()
    }

    /// Wait for every task to finish and return the first exit.
    ///
    /// The caller must have released whatever the tasks block on.
    pub async fn join(mut self) -> Option<(TaskKind, Error)> {
        for (kind, handle) in std::mem::take(&mut self.handles) {
            if let Err(e) = handle.await {
                error!("The {} task panicked: {}", kind, e);
                if self.first.is_none() {
                    self.first = Some((kind, Error::System(format!("{} task: {}", kind, e))));
                }
            }
        }

        // Every sender clone but ours is gone now.
        while let Ok((kind, status)) = self.rx.try_recv() {
            self.record(kind, status);
        }
        self.first
    }
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_first_exit_wins_when_serialized() {
        let mut group = TaskGroup::new();
        let (tx1, rx1) = oneshot::channel::<()>();
        let (tx2, rx2) = oneshot::channel::<()>();
        let (tx3, rx3) = oneshot::channel::<()>();

        group.spawn(TaskKind::Requester, async move {
            let _ = rx1.await;
            Error::Rpc("send failed".into())
        });
        group.spawn(TaskKind::UnicastReceiver, async move {
            let _ = rx2.await;
            Error::Protocol("bad index".into())
        });
        group.spawn(TaskKind::McastReceiver, async move {
            let _ = rx3.await;
            Error::Shutdown
        });

        // Serialize the exits: unicast receiver first.
        tx2.send(()).unwrap();
        let (kind, status) = group.wait_first().await.unwrap();
        assert_eq!(kind, TaskKind::UnicastReceiver);
        assert!(matches!(status, Error::Protocol(_)));

        tx1.send(()).unwrap();
        tx3.send(()).unwrap();
        let (kind, status) = group.join().await.unwrap();
        assert_eq!(kind, TaskKind::UnicastReceiver);
        assert!(matches!(status, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn test_wait_first_is_cancel_safe() {
        let mut group = TaskGroup::new();
        let (tx, rx) = oneshot::channel::<()>();
        group.spawn(TaskKind::Requester, async move {
            let _ = rx.await;
            Error::Shutdown
        });

        let timed_out = tokio::time::timeout(Duration::from_millis(20), group.wait_first()).await;
        assert!(timed_out.is_err());

        tx.send(()).unwrap();
        let (kind, status) = group.wait_first().await.unwrap();
        assert_eq!(kind, TaskKind::Requester);
        assert!(status.is_shutdown());
    }

    #[tokio::test]
    async fn test_empty_group() {
        let mut group = TaskGroup::new();
        assert!(group.wait_first().await.is_none());
        assert!(group.join().await.is_none());
    }

    #[test]
    fn test_task_kind_display() {
        assert_eq!(TaskKind::McastReceiver.to_string(), "multicast receiver");
    }
}
