// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Session memory
//!
//! Durable state kept per (upstream server, feed) across sessions and
//! process restarts:
//!
//! - the *missed* queue: indices the multicast layer failed to deliver and
//!   that haven't been requested yet,
//! - the *requested* queue: indices requested from the upstream and not yet
//!   delivered,
//! - the signature of the last product received by multicast.
//!
//! An index is in at most one of the two queues. Every mutation is
//! committed before the call returns.

mod queue;

pub use queue::{ClosableQueue, QueueBacking};

use crate::error::{Error, Result};
use crate::types::{FeedType, ProdIndex, ServiceAddr, Signature};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

const LAST_MCAST_KEY: &str = "last_mcast";

/// Shared SQLite connection of one session memory.
///
/// `None` once the memory has been closed.
struct SessionDb {
    conn: Mutex<Option<Connection>>,
}

impl SessionDb {
    fn with<R>(&self, f: impl FnOnce(&mut Connection) -> rusqlite::Result<R>) -> Result<R> {
        let mut guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let conn = guard
            .as_mut()
            .ok_or_else(|| Error::Storage("session memory is closed".into()))?;
        Ok(f(conn)?)
    }
}

/// One durable FIFO table (`missed` or `requested`).
///
/// Rows are ordered by an explicit `pos` column so order survives reopen
/// and entries can be put back at the front.
pub struct SqliteQueue {
    db: Arc<SessionDb>,
    table: &'static str,
}

impl QueueBacking for SqliteQueue {
    type Item = ProdIndex;

    fn push_back(&self, index: ProdIndex) -> Result<()> {
        let sql = format!(
            "INSERT INTO {t} (pos, idx) VALUES ((SELECT COALESCE(MAX(pos), 0) + 1 FROM {t}), ?1)",
            t = self.table
        );
        self.db.with(|conn| conn.execute(&sql, [index]).map(|_| ()))
    }

    fn front(&self) -> Result<Option<ProdIndex>> {
        let sql = format!("SELECT idx FROM {} ORDER BY pos LIMIT 1", self.table);
        self.db
            .with(|conn| conn.query_row(&sql, [], |row| row.get(0)).optional())
    }

    fn pop_front(&self) -> Result<Option<ProdIndex>> {
        let table = self.table;
        self.db.with(|conn| {
            let tx = conn.transaction()?;
            let head = pop_front_in(&tx, table)?;
            tx.commit()?;
            Ok(head)
        })
    }

    fn len(&self) -> Result<usize> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.table);
        self.db.with(|conn| {
            conn.query_row(&sql, [], |row| row.get::<_, i64>(0))
                .map(|n| n as usize)
        })
    }

    fn clear(&self) -> Result<()> {
        let sql = format!("DELETE FROM {}", self.table);
        self.db.with(|conn| conn.execute(&sql, []).map(|_| ()))
    }
}

fn front_in(conn: &Connection, table: &str) -> rusqlite::Result<Option<(i64, ProdIndex)>> {
    conn.query_row(
        &format!("SELECT pos, idx FROM {} ORDER BY pos LIMIT 1", table),
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .optional()
}

fn pop_front_in(conn: &Connection, table: &str) -> rusqlite::Result<Option<ProdIndex>> {
    match front_in(conn, table)? {
        Some((pos, idx)) => {
            conn.execute(&format!("DELETE FROM {} WHERE pos = ?1", table), [pos])?;
            Ok(Some(idx))
        }
        None => Ok(None),
    }
}

/// Durable cross-session memory of one (server, feed) pair.
pub struct SessionMemory {
    db: Arc<SessionDb>,
    path: Option<PathBuf>,
    missed: ClosableQueue<SqliteQueue>,
    requested: ClosableQueue<SqliteQueue>,
}

impl SessionMemory {
    /// File holding the memory of `(server, feed)` inside `dir`.
    pub fn path_for(dir: &Path, server: &ServiceAddr, feed: FeedType) -> PathBuf {
        dir.join(format!("{}_{}.sqlite", server.file_key(), feed))
    }

    /// Open or create the memory of `(server, feed)` inside `dir`.
    ///
    /// Leaves both queues as they are on disk.
    pub fn open(dir: &Path, server: &ServiceAddr, feed: FeedType) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| {
            Error::Storage(format!(
                "Failed to create session directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        let path = Self::path_for(dir, server, feed);
        let conn = Connection::open(&path).map_err(|e| {
            Error::Storage(format!(
                "Failed to open session memory at {}: {}",
                path.display(),
                e
            ))
        })?;

        Self::with_connection(conn, Some(path))
    }

    /// Open the memory at the start of a session.
    ///
    /// Indices left in the requested queue by the previous session are put
    /// back at the front of the missed queue: the connection they were
    /// requested on is gone.
    pub fn open_for_session(dir: &Path, server: &ServiceAddr, feed: FeedType) -> Result<Self> {
        let memory = Self::open(dir, server, feed)?;
        let restored = memory.restore_requested()?;
        if restored > 0 {
            info!(
                "Re-queued {} unanswered request(s) from the previous session",
                restored
            );
        }
        Ok(memory)
    }

    /// Non-durable memory (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn, None)
    }

    /// Remove the durable memory of `(server, feed)`.
    ///
    /// Returns whether a file existed.
    pub fn delete(dir: &Path, server: &ServiceAddr, feed: FeedType) -> Result<bool> {
        let path = Self::path_for(dir, server, feed);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::Storage(format!(
                "Failed to delete {}: {}",
                path.display(),
                e
            ))),
        }
    }

    fn with_connection(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS missed (
                pos INTEGER PRIMARY KEY,
                idx INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS requested (
                pos INTEGER PRIMARY KEY,
                idx INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL
            );",
        )?;

        let db = Arc::new(SessionDb {
            conn: Mutex::new(Some(conn)),
        });
        let missed = ClosableQueue::new(SqliteQueue {
            db: db.clone(),
            table: "missed",
        });
        let requested = ClosableQueue::new(SqliteQueue {
            db: db.clone(),
            table: "requested",
        });

        Ok(Self {
            db,
            path,
            missed,
            requested,
        })
    }

    fn restore_requested(&self) -> Result<usize> {
        self.db.with(|conn| {
            let tx = conn.transaction()?;
            let pending: Vec<ProdIndex> = {
                let mut stmt = tx.prepare("SELECT idx FROM requested ORDER BY pos DESC")?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                let pending = rows.collect::<rusqlite::Result<Vec<_>>>()?;
                pending
            };
            // Newest first, each one in front of the previous one.
            for idx in &pending {
                tx.execute(
                    "INSERT INTO missed (pos, idx)
                     VALUES ((SELECT COALESCE(MIN(pos), 1) - 1 FROM missed), ?1)",
                    [idx],
                )?;
            }
            tx.execute("DELETE FROM requested", [])?;
            tx.commit()?;
            Ok(pending.len())
        })
    }

    /// Location of the durable store (`None` for in-memory).
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    // Missed queue

    /// Record an index the multicast layer failed to deliver.
    pub fn add_missed(&self, index: ProdIndex) -> Result<()> {
        self.missed.push(index)
    }

    pub fn peek_missed_no_wait(&self) -> Result<Option<ProdIndex>> {
        self.missed.peek()
    }

    /// Wait for a missed index. Fails with `Shutdown` once the missed queue
    /// is shut down.
    pub async fn peek_missed_wait(&self) -> Result<ProdIndex> {
        self.missed.peek_wait().await
    }

    /// Remove and return the head of the missed queue.
    pub fn remove_missed_no_wait(&self) -> Result<Option<ProdIndex>> {
        self.missed.pop()
    }

    /// Wake blocked readers of the missed queue with `Shutdown`. Idempotent.
    pub fn shutdown_missed(&self) {
        self.missed.close();
    }

    pub fn clear_all_missed(&self) -> Result<()> {
        self.missed.clear()
    }

    pub fn missed_len(&self) -> Result<usize> {
        self.missed.len()
    }

    // Requested queue

    /// Record an index that was requested from the upstream.
    pub fn add_requested(&self, index: ProdIndex) -> Result<()> {
        self.requested.push(index)
    }

    pub fn peek_requested_no_wait(&self) -> Result<Option<ProdIndex>> {
        self.requested.peek()
    }

    pub async fn peek_requested_wait(&self) -> Result<ProdIndex> {
        self.requested.peek_wait().await
    }

    /// Remove and return the head of the requested queue.
    pub fn remove_requested_no_wait(&self) -> Result<Option<ProdIndex>> {
        self.requested.pop()
    }

    pub fn shutdown_requested(&self) {
        self.requested.close();
    }

    pub fn requested_len(&self) -> Result<usize> {
        self.requested.len()
    }

    /// Move `index` from the head of the missed queue to the tail of the
    /// requested queue in one transaction.
    ///
    /// Returns `false` (and changes nothing) if `index` isn't the head of
    /// the missed queue.
    pub fn transfer_missed_to_requested(&self, index: ProdIndex) -> Result<bool> {
        let moved = self.db.with(|conn| {
            let tx = conn.transaction()?;
            match front_in(&tx, "missed")? {
                Some((pos, head)) if head == index => {
                    tx.execute("DELETE FROM missed WHERE pos = ?1", [pos])?;
                    tx.execute(
                        "INSERT INTO requested (pos, idx)
                         VALUES ((SELECT COALESCE(MAX(pos), 0) + 1 FROM requested), ?1)",
                        [index],
                    )?;
                    tx.commit()?;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })?;
        if moved {
            self.requested.wake();
        }
        Ok(moved)
    }

    /// Take any outstanding index, requested ones first.
    pub fn get_any_missed_no_wait(&self) -> Result<Option<ProdIndex>> {
        self.db.with(|conn| {
            let tx = conn.transaction()?;
            let index = match pop_front_in(&tx, "requested")? {
                Some(index) => Some(index),
                None => pop_front_in(&tx, "missed")?,
            };
            tx.commit()?;
            Ok(index)
        })
    }

    // Last multicast product

    /// Signature of the last product received by multicast, if any.
    pub fn last_mcast_signature(&self) -> Result<Option<Signature>> {
        let blob: Option<Vec<u8>> = self.db.with(|conn| {
            conn.query_row(
                "SELECT value FROM meta WHERE key = ?1",
                [LAST_MCAST_KEY],
                |row| row.get(0),
            )
            .optional()
        })?;

        match blob {
            None => Ok(None),
            Some(bytes) => Signature::from_slice(&bytes)
                .map(Some)
                .ok_or_else(|| Error::Storage("corrupt last-multicast signature".into())),
        }
    }

    /// Overwrite the signature of the last product received by multicast.
    pub fn set_last_mcast_signature(&self, signature: &Signature) -> Result<()> {
        self.db.with(|conn| {
            conn.execute(
                "INSERT INTO meta (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![LAST_MCAST_KEY, &signature.as_bytes()[..]],
            )
            .map(|_| ())
        })
    }

    /// Release the store.
    ///
    /// Blocked readers of both queues are woken with `Shutdown`; every later
    /// operation fails with a storage error.
    pub fn close(&self) -> Result<()> {
        self.missed.close();
        self.requested.close();

        let conn = self
            .db
            .conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match conn {
            Some(conn) => {
                conn.close().map_err(|(_, e)| Error::from(e))?;
                debug!("Closed session memory {:?}", self.path);
                Ok(())
            }
            None => Ok(()),
        }
    }

    #[cfg(test)]
    pub(crate) fn missed_queue(&self) -> &ClosableQueue<SqliteQueue> {
        &self.missed
    }
}

impl std::fmt::Debug for SessionMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionMemory")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
