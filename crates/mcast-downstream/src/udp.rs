// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UDP multicast transport.
//!
//! Each datagram carries one JSON-encoded product together with its
//! sequence index on the feed. Holes in the index sequence are reported as
//! missed products; duplicates and late retransmissions are not.

use crate::error::{Error, Result};
use crate::mcast::{McastReceiver, McastReceiverFactory, StopSignal};
use crate::notifier::GapNotifier;
use crate::product_store::{InsertOutcome, ProductStore};
use crate::types::{McastInfo, ProdIndex, Product};
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Largest gap reported index by index; larger jumps resynchronize.
const MAX_GAP: u32 = 65_536;

/// Maximum UDP payload.
const MAX_DATAGRAM: usize = 65_507;

/// Payload of one multicast datagram.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McastDatagram {
    pub index: ProdIndex,
    pub product: Product,
}

/// Tracks the next expected index and yields the skipped ones.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    expected: Option<ProdIndex>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `index` and return the indices skipped since the last one.
    pub fn observe(&mut self, index: ProdIndex) -> std::ops::Range<u64> {
        let expected = match self.expected {
            None => {
                self.expected = Some(index.wrapping_add(1));
                return 0..0;
            }
            Some(expected) => expected,
        };

        let ahead = index.wrapping_sub(expected);
        if ahead >= 1 << 31 {
            // Older than expected: duplicate or retransmission.
            return 0..0;
        }

        self.expected = Some(index.wrapping_add(1));
        if ahead > MAX_GAP {
            warn!(
                "Multicast index jumped from {} to {}; resynchronizing",
                expected, index
            );
            return 0..0;
        }
        let start = expected as u64;
        start..start + ahead as u64
    }
}

/// Creates [`UdpMcastReceiver`]s joined on a given interface.
#[derive(Debug, Clone)]
pub struct UdpMcastFactory {
    interface: Ipv4Addr,
    read_timeout: Duration,
}

impl UdpMcastFactory {
    pub fn new(interface: Ipv4Addr) -> Self {
        Self {
            interface,
            read_timeout: Duration::from_millis(250),
        }
    }

    /// How often a blocked receive checks for `stop`.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    fn open_socket(&self, group: SocketAddrV4) -> std::io::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&SockAddr::from(SocketAddrV4::new(
            Ipv4Addr::UNSPECIFIED,
            group.port(),
        )))?;
        socket.join_multicast_v4(group.ip(), &self.interface)?;
        socket.set_read_timeout(Some(self.read_timeout))?;
        Ok(socket.into())
    }
}

impl Default for UdpMcastFactory {
    fn default() -> Self {
        Self::new(Ipv4Addr::UNSPECIFIED)
    }
}

/// Parse and check a multicast group address.
pub fn parse_group(group: &str) -> Result<SocketAddrV4> {
    let addr: SocketAddr = group
        .parse()
        .map_err(|e| Error::InvalidAddress(format!("multicast group '{}': {}", group, e)))?;
    match addr {
        SocketAddr::V4(v4) if v4.ip().is_multicast() => Ok(v4),
        _ => Err(Error::InvalidAddress(format!(
            "'{}' is not an IPv4 multicast group",
            group
        ))),
    }
}

impl McastReceiverFactory for UdpMcastFactory {
    fn create(
        &self,
        store: Arc<dyn ProductStore>,
        info: &McastInfo,
        notifier: Arc<dyn GapNotifier>,
    ) -> Result<Arc<dyn McastReceiver>> {
        let group = parse_group(&info.group)?;
        let socket = self
            .open_socket(group)
            .map_err(|e| Error::System(format!("multicast group {}: {}", group, e)))?;
        info!("Joined multicast group {} for feed {}", group, info.feed);

        Ok(Arc::new(UdpMcastReceiver {
            socket,
            group,
            store,
            notifier,
            stop: StopSignal::default(),
        }))
    }
}

/// Receives products from one multicast group.
pub struct UdpMcastReceiver {
    socket: UdpSocket,
    group: SocketAddrV4,
    store: Arc<dyn ProductStore>,
    notifier: Arc<dyn GapNotifier>,
    stop: StopSignal,
}

impl UdpMcastReceiver {
    fn process(&self, tracker: &mut SequenceTracker, bytes: &[u8]) -> Result<()> {
        let datagram: McastDatagram = match serde_json::from_slice(bytes) {
            Ok(d) => d,
            Err(e) => {
                debug!("Ignoring malformed datagram from {}: {}", self.group, e);
                return Ok(());
            }
        };
        handle_datagram(
            self.store.as_ref(),
            self.notifier.as_ref(),
            tracker,
            datagram,
        )
    }
}

/// Process one decoded datagram: report gaps, store, report receipt.
fn handle_datagram(
    store: &dyn ProductStore,
    notifier: &dyn GapNotifier,
    tracker: &mut SequenceTracker,
    datagram: McastDatagram,
) -> Result<()> {
    for missing in tracker.observe(datagram.index) {
        notifier.missed_product(missing as ProdIndex);
    }

    let info = &datagram.product.info;
    match store.insert(&datagram.product)? {
        InsertOutcome::Inserted | InsertOutcome::Duplicate => {
            trace!("Multicast product {} ({})", datagram.index, info.signature);
            notifier.last_received(info);
        }
        InsertOutcome::TooLarge => {
            warn!(
                "Multicast product {} too large: {} bytes",
                datagram.index, info.size
            );
        }
        InsertOutcome::InvalidArgument => {
            warn!("Invalid multicast product {}", datagram.index);
        }
    }
    Ok(())
}

impl McastReceiver for UdpMcastReceiver {
    fn start(&self) -> Result<()> {
        let mut tracker = SequenceTracker::new();
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            if self.stop.is_stopped() {
                debug!("Multicast receiver for {} stopped", self.group);
                return Ok(());
            }
            match self.socket.recv_from(&mut buf) {
                Ok((len, _from)) => self.process(&mut tracker, &buf[..len])?,
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock
                            | std::io::ErrorKind::TimedOut
                            | std::io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => {
                    return Err(Error::System(format!(
                        "multicast receive on {}: {}",
                        self.group, e
                    )))
                }
            }
        }
    }

    fn stop(&self) {
        self.stop.stop();
    }
}
