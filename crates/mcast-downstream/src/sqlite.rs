// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SQLite product store
//!
//! Durable storage of received products with duplicate suppression by
//! signature.

use crate::error::{Error, Result};
use crate::product_store::{InsertOutcome, ProductStore};
use crate::types::{FeedType, Product, ProductInfo, Signature};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::trace;

/// SQLite product store
///
/// Thread-safe via internal Mutex (SQLite Connection is not Sync). The
/// mutex is the store's insertion lock and is held only for one statement.
///
/// # Schema
///
/// ```sql
/// CREATE TABLE products (
///     id INTEGER PRIMARY KEY AUTOINCREMENT,
///     signature BLOB NOT NULL UNIQUE,
///     feed INTEGER NOT NULL,
///     ident TEXT NOT NULL,
///     origin TEXT NOT NULL,
///     arrival_ns INTEGER NOT NULL,
///     seqno INTEGER NOT NULL,
///     data BLOB NOT NULL
/// );
/// CREATE INDEX idx_arrival ON products(arrival_ns);
/// ```
pub struct SqliteProductStore {
    conn: Mutex<Connection>,
    max_product_size: u64,
}

/// Summary returned by [`SqliteProductStore::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub products: u64,
    pub bytes: u64,
    pub oldest_ns: Option<u64>,
    pub newest_ns: Option<u64>,
}

impl SqliteProductStore {
    /// Open (or create) a file-based store. `max_product_size` 0 means
    /// unlimited.
    pub fn new(path: impl AsRef<Path>, max_product_size: u64) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(|e| {
            Error::Storage(format!(
                "Failed to open product store at {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::with_connection(conn, max_product_size)
    }

    /// Create an in-memory store (for testing)
    pub fn new_in_memory(max_product_size: u64) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn, max_product_size)
    }

    fn with_connection(conn: Connection, max_product_size: u64) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
            max_product_size,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS products (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                signature BLOB NOT NULL UNIQUE,
                feed INTEGER NOT NULL,
                ident TEXT NOT NULL,
                origin TEXT NOT NULL,
                arrival_ns INTEGER NOT NULL,
                seqno INTEGER NOT NULL,
                data BLOB NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_arrival ON products(arrival_ns)",
            [],
        )?;

        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn row_to_product(row: &rusqlite::Row) -> rusqlite::Result<Product> {
        let sig_blob: Vec<u8> = row.get(0)?;
        let data: Vec<u8> = row.get(6)?;
        let signature = Signature::from_slice(&sig_blob).unwrap_or_default();

        Ok(Product {
            info: ProductInfo {
                signature,
                feed: FeedType(row.get::<_, i64>(1)? as u32),
                ident: row.get(2)?,
                origin: row.get(3)?,
                arrival_ns: row.get::<_, i64>(4)? as u64,
                seqno: row.get::<_, i64>(5)? as u32,
                size: data.len() as u32,
            },
            data,
        })
    }

    /// Look up a product by signature.
    pub fn get(&self, signature: &Signature) -> Result<Option<Product>> {
        let conn = self.lock();
        let product = conn
            .query_row(
                "SELECT signature, feed, ident, origin, arrival_ns, seqno, data
                 FROM products WHERE signature = ?1",
                [&signature.as_bytes()[..]],
                Self::row_to_product,
            )
            .optional()?;
        Ok(product)
    }

    /// Identifiers of the most recently arrived products, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<ProductInfo>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT signature, feed, ident, origin, arrival_ns, seqno, data
             FROM products
             ORDER BY arrival_ns DESC, id DESC
             LIMIT ?1",
        )?;
        let infos = stmt
            .query_map([limit as i64], Self::row_to_product)?
            .map(|row| row.map(|p| p.info))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(infos)
    }

    /// Counts and time span of the stored products.
    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.lock();
        let stats = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(length(data)), 0), MIN(arrival_ns), MAX(arrival_ns)
             FROM products",
            [],
            |row| {
                Ok(StoreStats {
                    products: row.get::<_, i64>(0)? as u64,
                    bytes: row.get::<_, i64>(1)? as u64,
                    oldest_ns: row.get::<_, Option<i64>>(2)?.map(|v| v as u64),
                    newest_ns: row.get::<_, Option<i64>>(3)?.map(|v| v as u64),
                })
            },
        )?;
        Ok(stats)
    }

    /// Remove every product.
    pub fn clear(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute("DELETE FROM products", [])?;
        Ok(())
    }
}

impl ProductStore for SqliteProductStore {
    fn insert(&self, product: &Product) -> Result<InsertOutcome> {
        let info = &product.info;
        if info.signature.is_zero() || info.size as usize != product.data.len() {
            return Ok(InsertOutcome::InvalidArgument);
        }
        if self.max_product_size > 0 && product.data.len() as u64 > self.max_product_size {
            return Ok(InsertOutcome::TooLarge);
        }

        // Saturate to i64::MAX to avoid overflow (u64::MAX as i64 = -1)
        let arrival = info.arrival_ns.min(i64::MAX as u64) as i64;

        let conn = self.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO products
                (signature, feed, ident, origin, arrival_ns, seqno, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                &info.signature.as_bytes()[..],
                info.feed.bits() as i64,
                info.ident,
                info.origin,
                arrival,
                info.seqno as i64,
                product.data,
            ],
        )?;

        if inserted == 0 {
            trace!("Duplicate product {}", info.signature);
            Ok(InsertOutcome::Duplicate)
        } else {
            trace!("Stored product {} ({} bytes)", info.signature, info.size);
            Ok(InsertOutcome::Inserted)
        }
    }

    fn contains(&self, signature: &Signature) -> Result<bool> {
        let conn = self.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM products WHERE signature = ?1",
                [&signature.as_bytes()[..]],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn count(&self) -> Result<u64> {
        let conn = self.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM products", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}
