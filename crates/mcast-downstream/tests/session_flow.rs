// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end sessions against an in-process upstream server.

use mcast_downstream::protocol::{FrameReader, FrameWriter};
use mcast_downstream::{
    BacklogSpec, Downstream, DownstreamConfig, Error, FeedType, McastInfo, Message,
    MockMcastFactory, ProdIndex, Product, ProductStore, ServiceAddr, SessionMemory, SessionState,
    Signature, SqliteProductStore, SubscribeStatus,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const FEED: FeedType = FeedType(0x10);

fn product(index: ProdIndex) -> Product {
    Product::new(
        Signature([index as u8 + 1; 16]),
        FEED,
        format!("product-{}", index),
        vec![index as u8; 32],
    )
}

/// Upstream behavior, shared by every connection it accepts.
#[derive(Clone)]
struct Behavior {
    status: SubscribeStatus,
    products: HashMap<ProdIndex, Product>,
    /// Answer a request for the key with a delivery claiming the value.
    misdeliver: HashMap<ProdIndex, ProdIndex>,
}

impl Behavior {
    fn serving(indices: &[ProdIndex]) -> Self {
        Self {
            status: SubscribeStatus::Ok,
            products: indices.iter().map(|i| (*i, product(*i))).collect(),
            misdeliver: HashMap::new(),
        }
    }
}

struct FakeUpstream {
    port: u16,
    received: Arc<Mutex<Vec<Message>>>,
    _task: JoinHandle<()>,
}

impl FakeUpstream {
    async fn start(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let received = Arc::new(Mutex::new(Vec::new()));

        let log = received.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let behavior = behavior.clone();
                let log = log.clone();
                tokio::spawn(async move {
                    let (read_half, write_half) = stream.into_split();
                    let mut reader = FrameReader::new(read_half, 1 << 20);
                    let mut writer = FrameWriter::new(write_half, 1 << 20);

                    while let Ok(Some(msg)) = reader.read_message().await {
                        log.lock().unwrap().push(msg.clone());
                        let reply = match msg {
                            Message::Subscribe { feed } => Message::SubscriptionReply {
                                status: behavior.status,
                                mcast_info: (behavior.status == SubscribeStatus::Ok).then(|| {
                                    McastInfo {
                                        feed,
                                        group: "239.10.10.10:38800".into(),
                                        server: "127.0.0.1:38800".into(),
                                    }
                                }),
                            },
                            Message::RequestProduct { index } => {
                                let claimed = behavior.misdeliver.get(&index).copied();
                                match (claimed, behavior.products.get(&index)) {
                                    (Some(other), _) => Message::DeliverMissedProduct {
                                        index: other,
                                        product: product(other),
                                    },
                                    (None, Some(p)) => Message::DeliverMissedProduct {
                                        index,
                                        product: p.clone(),
                                    },
                                    (None, None) => Message::NoSuchProduct { index },
                                }
                            }
                            Message::RequestBacklog { .. } => Message::EndBacklog,
                            _ => continue,
                        };
                        if writer.send_message(&reply).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        Self {
            port,
            received,
            _task: task,
        }
    }

    fn server(&self) -> ServiceAddr {
        ServiceAddr::new("127.0.0.1", self.port)
    }

    fn messages(&self) -> Vec<Message> {
        self.received.lock().unwrap().clone()
    }

    fn product_requests(&self) -> Vec<ProdIndex> {
        self.messages()
            .into_iter()
            .filter_map(|m| match m {
                Message::RequestProduct { index } => Some(index),
                _ => None,
            })
            .collect()
    }

    fn backlog_requests(&self) -> Vec<BacklogSpec> {
        self.messages()
            .into_iter()
            .filter_map(|m| match m {
                Message::RequestBacklog { spec } => Some(spec),
                _ => None,
            })
            .collect()
    }
}

struct Node {
    downstream: Downstream,
    factory: MockMcastFactory,
    store: Arc<SqliteProductStore>,
    state: watch::Receiver<SessionState>,
    runner: JoinHandle<mcast_downstream::Result<()>>,
}

fn start_node(server: ServiceAddr, dir: &Path) -> Node {
    let config = DownstreamConfig::builder()
        .server(server)
        .feed(FEED)
        .session_dir(dir)
        .retry_interval_secs(3600)
        .connect_timeout_secs(5)
        .rpc_timeout_secs(5)
        .build()
        .unwrap();
    let store = Arc::new(SqliteProductStore::new_in_memory(0).unwrap());
    let factory = MockMcastFactory::new();
    let downstream = Downstream::new(config, store.clone(), Arc::new(factory.clone())).unwrap();
    let state = downstream.state();

    let runner = {
        let downstream = downstream.clone();
        tokio::spawn(async move { downstream.run().await })
    };

    Node {
        downstream,
        factory,
        store,
        state,
        runner,
    }
}

impl Node {
    async fn wait_for(&mut self, want: SessionState) {
        let state = &mut self.state;
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if *state.borrow_and_update() == want {
                    return;
                }
                state.changed().await.unwrap();
            }
        })
        .await
        .unwrap_or_else(|_| panic!("downstream never reached {:?}", want));
    }

    async fn stop(self) -> mcast_downstream::Result<()> {
        self.downstream.shutdown();
        tokio::time::timeout(Duration::from_secs(10), self.runner)
            .await
            .expect("downstream didn't stop")
            .unwrap()
    }
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missed_products_requested_in_order() {
    let upstream = FakeUpstream::start(Behavior::serving(&[1, 2, 3])).await;
    let dir = tempfile::tempdir().unwrap();
    let mut node = start_node(upstream.server(), dir.path());

    node.wait_for(SessionState::Running).await;
    for index in [3, 1, 2] {
        node.factory.miss(index).unwrap();
    }

    let store = node.store.clone();
    wait_until("recovered products", || store.count().unwrap() == 3).await;
    assert_eq!(upstream.product_requests(), vec![3, 1, 2]);
    for index in [1, 2, 3] {
        assert!(store.contains(&product(index).signature()).unwrap());
    }

    node.stop().await.unwrap();

    let memory = SessionMemory::open(dir.path(), &upstream.server(), FEED).unwrap();
    assert_eq!(memory.missed_len().unwrap(), 0);
    assert_eq!(memory.requested_len().unwrap(), 0);
    memory.close().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_backlog_requested_once_from_previous_session() {
    let upstream = FakeUpstream::start(Behavior::serving(&[])).await;
    let dir = tempfile::tempdir().unwrap();

    let s0 = Signature([0xa0; 16]);
    let memory = SessionMemory::open(dir.path(), &upstream.server(), FEED).unwrap();
    memory.set_last_mcast_signature(&s0).unwrap();
    memory.close().unwrap();

    let mut node = start_node(upstream.server(), dir.path());
    node.wait_for(SessionState::Running).await;

    let p1 = product(10);
    let p2 = product(11);
    node.factory.deliver(&p1).unwrap();
    node.factory.deliver(&p2).unwrap();
    node.factory.deliver(&p2).unwrap();

    wait_until("backlog request", || !upstream.backlog_requests().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let backlog = upstream.backlog_requests();
    assert_eq!(backlog.len(), 1);
    assert_eq!(backlog[0].after, Some(s0));
    assert_eq!(backlog[0].before, p1.signature());

    node.stop().await.unwrap();

    let memory = SessionMemory::open(dir.path(), &upstream.server(), FEED).unwrap();
    assert_eq!(memory.last_mcast_signature().unwrap(), Some(p2.signature()));
    memory.close().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_backlog_without_previous_session_uses_time_offset() {
    let upstream = FakeUpstream::start(Behavior::serving(&[])).await;
    let dir = tempfile::tempdir().unwrap();
    let mut node = start_node(upstream.server(), dir.path());
    node.wait_for(SessionState::Running).await;

    node.factory.deliver(&product(1)).unwrap();
    wait_until("backlog request", || !upstream.backlog_requests().is_empty()).await;

    let backlog = upstream.backlog_requests();
    assert_eq!(backlog[0].after, None);
    assert_eq!(backlog[0].time_offset_secs, 3600);

    node.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_mismatched_delivery_ends_session() {
    let mut behavior = Behavior::serving(&[7, 9]);
    behavior.misdeliver.insert(9, 7);
    let upstream = FakeUpstream::start(behavior).await;
    let dir = tempfile::tempdir().unwrap();
    let mut node = start_node(upstream.server(), dir.path());

    node.wait_for(SessionState::Running).await;
    node.factory.miss(9).unwrap();

    node.wait_for(SessionState::Waiting).await;
    assert_eq!(node.store.count().unwrap(), 0);
    assert_eq!(upstream.product_requests(), vec![9]);
    assert!(!node.factory.is_active());

    node.stop().await.unwrap();

    // The unanswered request stays on disk until the next session starts.
    let memory = SessionMemory::open(dir.path(), &upstream.server(), FEED).unwrap();
    assert_eq!(memory.requested_len().unwrap(), 1);
    assert_eq!(memory.get_any_missed_no_wait().unwrap(), Some(9));
    memory.close().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_product_is_accepted_loss() {
    let upstream = FakeUpstream::start(Behavior::serving(&[2])).await;
    let dir = tempfile::tempdir().unwrap();
    let mut node = start_node(upstream.server(), dir.path());

    node.wait_for(SessionState::Running).await;
    node.factory.miss(1).unwrap();
    node.factory.miss(2).unwrap();

    let store = node.store.clone();
    wait_until("product 2", || store.count().unwrap() == 1).await;
    assert_eq!(*node.state.borrow(), SessionState::Running);

    node.stop().await.unwrap();

    let memory = SessionMemory::open(dir.path(), &upstream.server(), FEED).unwrap();
    assert_eq!(memory.get_any_missed_no_wait().unwrap(), None);
    memory.close().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unauthorized_waits_and_shuts_down_promptly() {
    let mut behavior = Behavior::serving(&[]);
    behavior.status = SubscribeStatus::Unauthorized;
    let upstream = FakeUpstream::start(behavior).await;
    let dir = tempfile::tempdir().unwrap();
    let mut node = start_node(upstream.server(), dir.path());

    node.wait_for(SessionState::Waiting).await;
    assert!(node.factory.sessions().is_empty());
    assert!(matches!(
        upstream.messages().as_slice(),
        [Message::Subscribe { feed: FEED }]
    ));

    // The retry interval is an hour; shutdown must cut the sleep short.
    let started = std::time::Instant::now();
    node.stop().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_multicast_creation_failure_is_fatal() {
    let upstream = FakeUpstream::start(Behavior::serving(&[])).await;
    let dir = tempfile::tempdir().unwrap();
    let config = DownstreamConfig::builder()
        .server(upstream.server())
        .feed(FEED)
        .session_dir(dir.path())
        .retry_interval_secs(3600)
        .build()
        .unwrap();
    let factory = MockMcastFactory::new();
    factory.fail_create(Error::System("out of memory".into()));
    let store = Arc::new(SqliteProductStore::new_in_memory(0).unwrap());
    let downstream = Downstream::new(config, store, Arc::new(factory)).unwrap();

    let result = tokio::time::timeout(Duration::from_secs(10), downstream.run())
        .await
        .unwrap();
    assert!(matches!(result, Err(Error::System(_))));
    assert_eq!(*downstream.state().borrow(), SessionState::Shutdown);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_upstream_disconnect_ends_session() {
    // Accept, answer the subscription, then hang up.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            let (read_half, write_half) = stream.into_split();
            let mut reader = FrameReader::new(read_half, 1 << 20);
            let mut writer = FrameWriter::new(write_half, 1 << 20);
            if let Ok(Some(Message::Subscribe { feed })) = reader.read_message().await {
                let _ = writer
                    .send_message(&Message::SubscriptionReply {
                        status: SubscribeStatus::Ok,
                        mcast_info: Some(McastInfo {
                            feed,
                            group: "239.10.10.11:38800".into(),
                            server: "127.0.0.1:38800".into(),
                        }),
                    })
                    .await;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    });

    let dir = tempfile::tempdir().unwrap();
    let mut node = start_node(ServiceAddr::new("127.0.0.1", port), dir.path());
    node.wait_for(SessionState::Waiting).await;
    assert_eq!(node.factory.sessions().len(), 1);
    assert!(!node.factory.is_active());

    node.stop().await.unwrap();
}
