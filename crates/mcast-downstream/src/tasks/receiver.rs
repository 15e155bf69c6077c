// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Unicast receiver task: accepts products sent by the upstream in answer
//! to product and backlog requests.

use crate::connection::BoxedReader;
use crate::error::{Error, Result};
use crate::memory::SessionMemory;
use crate::product_store::{InsertOutcome, ProductStore};
use crate::protocol::{FrameReader, Message};
use crate::types::{FeedType, ProdIndex, Product, ServiceAddr};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, error, info, trace, warn};

/// Handles the inbound half of a session connection.
///
/// Bound to its session's memory and product store when constructed.
pub struct UnicastReceiver {
    reader: FrameReader<BoxedReader>,
    memory: Arc<SessionMemory>,
    store: Arc<dyn ProductStore>,
    stop: Arc<Notify>,
    server: ServiceAddr,
    feed: FeedType,
}

impl UnicastReceiver {
    pub fn new(
        reader: FrameReader<BoxedReader>,
        memory: Arc<SessionMemory>,
        store: Arc<dyn ProductStore>,
        stop: Arc<Notify>,
        server: ServiceAddr,
        feed: FeedType,
    ) -> Self {
        Self {
            reader,
            memory,
            store,
            stop,
            server,
            feed,
        }
    }

    /// Handle messages until the connection ends or `stop` is notified.
    pub async fn run(mut self) -> Error {
        loop {
            let msg = tokio::select! {
                msg = self.reader.read_message() => msg,
                _ = self.stop.notified() => {
                    debug!("Unicast receiver for {} stopped", self.server);
                    return Error::Shutdown;
                }
            };

            let msg = match msg {
                Ok(Some(msg)) => msg,
                Ok(None) => return Error::Rpc(format!("{} closed the connection", self.server)),
                Err(e) => return e.into(),
            };

            if let Err(e) = self.dispatch(msg) {
                return e;
            }
        }
    }

    fn dispatch(&self, msg: Message) -> Result<()> {
        match msg {
            Message::DeliverMissedProduct { index, product } => {
                self.deliver_missed(index, product)
            }
            Message::DeliverBacklogProduct { product } => self.deliver(product, "backlog"),
            Message::NoSuchProduct { index } => self.no_such_product(index),
            Message::EndBacklog => {
                info!(
                    "Received all backlog products of feed {} from {}",
                    self.feed, self.server
                );
                Ok(())
            }
            other => {
                error!("Unexpected {} message from {}", other.kind(), self.server);
                Err(Error::Protocol(format!("unexpected {} message", other.kind())))
            }
        }
    }

    fn deliver_missed(&self, index: ProdIndex, product: Product) -> Result<()> {
        let head = self.memory.peek_requested_no_wait()?;
        if head != Some(index) {
            error!(
                "Product {} from {} isn't the next requested one ({:?})",
                index, self.server, head
            );
            return Err(Error::Protocol(format!(
                "delivered product {} but expected {:?}",
                index, head
            )));
        }

        self.memory.remove_requested_no_wait()?;
        self.deliver(product, "missed")
    }

    fn no_such_product(&self, index: ProdIndex) -> Result<()> {
        warn!(
            "Requested product {} is no longer available from {}",
            index, self.server
        );
        // Accept the loss, otherwise every later delivery would mismatch.
        if self.memory.peek_requested_no_wait()? == Some(index) {
            self.memory.remove_requested_no_wait()?;
        }
        Ok(())
    }

    fn deliver(&self, product: Product, kind: &str) -> Result<()> {
        let info = &product.info;
        match self.store.insert(&product)? {
            InsertOutcome::Inserted => {
                trace!("Stored {} product {} ({})", kind, info.ident, info.signature);
                Ok(())
            }
            InsertOutcome::Duplicate => {
                info!("Duplicate {} product {} ({})", kind, info.ident, info.signature);
                Ok(())
            }
            InsertOutcome::TooLarge => {
                warn!(
                    "{} product {} too large for the store: {} bytes",
                    kind, info.ident, info.size
                );
                Ok(())
            }
            InsertOutcome::InvalidArgument => {
                error!("Invalid {} product {} from {}", kind, info.ident, self.server);
                Err(Error::Protocol(format!("invalid {} product {}", kind, info.ident)))
            }
        }
    }
}
