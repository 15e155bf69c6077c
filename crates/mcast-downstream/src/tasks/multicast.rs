// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Multicast receiver task: runs a blocking transport on its own thread.

use crate::error::Error;
use crate::mcast::McastReceiver;
use std::sync::Arc;
use tracing::{debug, error};

/// Run `receiver` until it's stopped or fails.
pub async fn run(receiver: Arc<dyn McastReceiver>) -> Error {
    match tokio::task::spawn_blocking(move || receiver.start()).await {
        Ok(Ok(())) => {
            debug!("Multicast receiver stopped");
            Error::Shutdown
        }
        Ok(Err(e)) => {
            error!("Multicast receiver failed: {}", e);
            e
        }
        Err(e) => Error::System(format!("multicast receiver thread: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcast::{McastReceiverFactory, MockMcastFactory};
    use crate::notifier::GapNotifier;
    use crate::sqlite::SqliteProductStore;
    use crate::types::{FeedType, McastInfo, ProdIndex, ProductInfo};
    use std::time::Duration;

    struct Quiet;

    impl GapNotifier for Quiet {
        fn missed_product(&self, _index: ProdIndex) {}
        fn last_received(&self, _info: &ProductInfo) {}
    }

    fn info() -> McastInfo {
        McastInfo {
            feed: FeedType(1),
            group: "239.2.2.2:38800".into(),
            server: "upstream:38800".into(),
        }
    }

    #[tokio::test]
    async fn test_stop_yields_shutdown() {
        let factory = MockMcastFactory::new();
        let store = Arc::new(SqliteProductStore::new_in_memory(0).unwrap());
        let receiver = factory.create(store, &info(), Arc::new(Quiet)).unwrap();

        let task = tokio::spawn(run(receiver.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        receiver.stop();

        let status = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(status.is_shutdown());
    }

    #[tokio::test]
    async fn test_start_failure_is_reported() {
        let factory = MockMcastFactory::new();
        factory.fail_start(Error::System("no interface".into()));
        let store = Arc::new(SqliteProductStore::new_in_memory(0).unwrap());
        let receiver = factory.create(store, &info(), Arc::new(Quiet)).unwrap();

        assert!(matches!(run(receiver).await, Error::System(_)));
    }
}
