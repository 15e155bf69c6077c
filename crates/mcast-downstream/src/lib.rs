// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Multicast Downstream Node
//!
//! Receives a feed of data products by multicast and recovers, over a
//! unicast request/response connection to the upstream server, every
//! product multicast failed to deliver plus the backlog published while the
//! node was away.
//!
//! # Features
//!
//! - **Gap Recovery** -- Missed products are requested by index, in order
//! - **Session Memory** -- Missed/requested queues survive restarts (SQLite)
//! - **Backlog** -- Products published between sessions are requested once
//! - **Supervised Sessions** -- First task exit ends the session; retry loop
//!
//! # Architecture
//!
//! ```text
//! Downstream (coordinator, retry loop)
//! +-- UpstreamConnection   (subscribe, then split)
//! +-- SessionMemory        (missed queue, requested queue, last signature)
//! +-- TaskGroup
//!     +-- multicast task   (McastReceiver -> ProductStore, GapNotifier)
//!     +-- requester task   (missed -> requested -> request_product)
//!     +-- unicast receiver (deliveries -> ProductStore, retire requested)
//! +-- backlog request      (fire and forget, first multicast product)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use mcast_downstream::{Downstream, DownstreamConfig, SqliteProductStore, UdpMcastFactory};
//! use std::sync::Arc;
//!
//! let config = DownstreamConfig::builder()
//!     .server("upstream.example.com:38800".parse()?)
//!     .feed("ANY".parse()?)
//!     .build()?;
//!
//! let store = Arc::new(SqliteProductStore::new("products.sqlite", 0)?);
//! let downstream = Downstream::new(config, store, Arc::new(UdpMcastFactory::default()))?;
//! downstream.run().await?;
//! ```

pub mod config;
pub mod connection;
pub mod downstream;
pub mod error;
pub mod mcast;
pub mod memory;
pub mod notifier;
pub mod product_store;
pub mod protocol;
pub mod sqlite;
pub mod tasks;
pub mod types;
pub mod udp;

pub use config::{ConfigError, DownstreamConfig, DownstreamConfigBuilder};
pub use connection::{RequestSender, SocketControl, UpstreamConnection};
pub use downstream::{Downstream, SessionState};
pub use error::{Error, Result};
pub use mcast::{McastReceiver, McastReceiverFactory, MockMcastFactory};
pub use memory::{ClosableQueue, QueueBacking, SessionMemory};
pub use notifier::{GapNotifier, SessionNotifier};
pub use product_store::{InsertOutcome, ProductStore};
pub use protocol::{Message, SubscribeStatus};
pub use sqlite::{SqliteProductStore, StoreStats};
pub use types::{BacklogSpec, FeedType, McastInfo, ProdIndex, Product, ProductInfo, ServiceAddr, Signature};
pub use udp::{McastDatagram, UdpMcastFactory};
