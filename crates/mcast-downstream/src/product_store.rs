// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Product store abstraction
//!
//! The downstream node only needs to insert products and tell which ones it
//! already has. Implementations must serialize concurrent inserts
//! themselves: the unicast receiver and the multicast transport both write.

use crate::error::Result;
use crate::types::{Product, Signature};

/// Outcome of inserting a product.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The product was stored.
    Inserted,
    /// A product with the same signature is already stored.
    Duplicate,
    /// The product exceeds the store's size limit.
    TooLarge,
    /// The product is malformed (zero signature, size mismatch).
    InvalidArgument,
}

/// Product store trait
///
/// # Implementations
///
/// - `SqliteProductStore` -- Default, file or in-memory
pub trait ProductStore: Send + Sync {
    /// Insert a product.
    ///
    /// Rejections are reported through [`InsertOutcome`]; `Err` means the
    /// store itself failed.
    fn insert(&self, product: &Product) -> Result<InsertOutcome>;

    /// Returns true if a product with this signature is stored.
    fn contains(&self, signature: &Signature) -> Result<bool>;

    /// Number of stored products.
    fn count(&self) -> Result<u64>;
}
