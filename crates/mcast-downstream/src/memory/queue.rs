// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Closable FIFO queue.
//!
//! Blocking operations return [`Error::Shutdown`] once the queue is closed
//! instead of waiting forever. Storage of the entries is delegated to a
//! [`QueueBacking`] so the same primitive serves the in-memory and the
//! durable queues.

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// Storage behind a [`ClosableQueue`].
///
/// Every method is a single, short, synchronous operation; implementations
/// serialize concurrent callers themselves.
pub trait QueueBacking: Send + Sync {
    type Item: Copy + Send;

    fn push_back(&self, item: Self::Item) -> Result<()>;
    fn front(&self) -> Result<Option<Self::Item>>;
    fn pop_front(&self) -> Result<Option<Self::Item>>;
    fn len(&self) -> Result<usize>;
    fn clear(&self) -> Result<()>;
}

/// FIFO queue whose blocking reads can be cancelled by [`close`](Self::close).
pub struct ClosableQueue<B> {
    backing: B,
    notify: Notify,
    closed: AtomicBool,
}

impl<B: QueueBacking> ClosableQueue<B> {
    pub fn new(backing: B) -> Self {
        Self {
            backing,
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Append an entry.
    ///
    /// Entries pushed after `close` are still stored; only the blocking
    /// reads are affected by closing.
    pub fn push(&self, item: B::Item) -> Result<()> {
        self.backing.push_back(item)?;
        self.notify.notify_waiters();
        Ok(())
    }

    /// Head of the queue, if any.
    pub fn peek(&self) -> Result<Option<B::Item>> {
        self.backing.front()
    }

    /// Remove and return the head, if any.
    pub fn pop(&self) -> Result<Option<B::Item>> {
        self.backing.pop_front()
    }

    /// Wait for a head entry without removing it.
    pub async fn peek_wait(&self) -> Result<B::Item> {
        self.wait_for(|backing| backing.front()).await
    }

    /// Wait for a head entry and remove it.
    pub async fn pop_wait(&self) -> Result<B::Item> {
        self.wait_for(|backing| backing.pop_front()).await
    }

    async fn wait_for<F>(&self, mut take: F) -> Result<B::Item>
    where
        F: FnMut(&B) -> Result<Option<B::Item>>,
    {
        loop {
            // Register before checking so a push or close in between is seen.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_closed() {
                return Err(Error::Shutdown);
            }
            if let Some(item) = take(&self.backing)? {
                return Ok(item);
            }

            notified.await;
        }
    }

    pub fn len(&self) -> Result<usize> {
        self.backing.len()
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.backing.len()? == 0)
    }

    pub fn clear(&self) -> Result<()> {
        self.backing.clear()
    }

    /// Wake every current and future blocking read with `Shutdown`.
    /// Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Wake blocked readers after the backing changed behind our back.
    pub(crate) fn wake(&self) {
        self.notify.notify_waiters();
    }

    pub(crate) fn backing(&self) -> &B {
        &self.backing
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Default)]
    pub(crate) struct VecBacking(Mutex<VecDeque<u32>>);

    impl QueueBacking for VecBacking {
        type Item = u32;

        fn push_back(&self, item: u32) -> Result<()> {
            self.0.lock().unwrap().push_back(item);
            Ok(())
        }
        fn front(&self) -> Result<Option<u32>> {
            Ok(self.0.lock().unwrap().front().copied())
        }
        fn pop_front(&self) -> Result<Option<u32>> {
            Ok(self.0.lock().unwrap().pop_front())
        }
        fn len(&self) -> Result<usize> {
            Ok(self.0.lock().unwrap().len())
        }
        fn clear(&self) -> Result<()> {
            self.0.lock().unwrap().clear();
            Ok(())
        }
    }

    #[test]
    fn test_fifo_non_blocking() {
        let q = ClosableQueue::new(VecBacking::default());
        assert_eq!(q.peek().unwrap(), None);

        q.push(3).unwrap();
        q.push(1).unwrap();
        q.push(2).unwrap();

        assert_eq!(q.peek().unwrap(), Some(3));
        assert_eq!(q.pop().unwrap(), Some(3));
        assert_eq!(q.pop().unwrap(), Some(1));
        assert_eq!(q.len().unwrap(), 1);
        q.clear().unwrap();
        assert!(q.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_peek_wait_wakes_on_push() {
        let q = Arc::new(ClosableQueue::new(VecBacking::default()));

        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.peek_wait().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.push(9).unwrap();

        let got = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.unwrap(), 9);
        // peek doesn't remove
        assert_eq!(q.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_readers() {
        let q = Arc::new(ClosableQueue::new(VecBacking::default()));

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let q = q.clone();
                tokio::spawn(async move { q.pop_wait().await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;

        q.close();
        for w in waiters {
            let res = tokio::time::timeout(Duration::from_secs(5), w)
                .await
                .unwrap()
                .unwrap();
            assert!(matches!(res, Err(Error::Shutdown)));
        }
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_sticky() {
        let q = ClosableQueue::new(VecBacking::default());
        q.close();
        q.close();

        // Entries are still stored, but blocking reads report shutdown.
        q.push(5).unwrap();
        assert!(matches!(q.peek_wait().await, Err(Error::Shutdown)));
        assert_eq!(q.peek().unwrap(), Some(5));
    }
}
