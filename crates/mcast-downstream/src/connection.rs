// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection to an upstream server.
//!
//! A session owns exactly one TCP connection. After the synchronous
//! subscription it is split in three parts:
//!
//! - [`RequestSender`]: the write half, shared by the requester and the
//!   backlog task behind a lock.
//! - [`FrameReader`]: the read half, owned by the unicast receiver.
//! - [`SocketControl`]: a duplicate of the socket handle used by the
//!   coordinator to half-close either direction during teardown.

use crate::error::{Error, Result};
use crate::protocol::{FrameReader, FrameWriter, Message, SubscribeStatus};
use crate::types::{BacklogSpec, FeedType, McastInfo, ProdIndex, ServiceAddr};
use std::net::{Shutdown, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Read half of a session connection.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
/// Write half of a session connection.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// An established, not yet subscribed, connection to an upstream server.
pub struct UpstreamConnection {
    server: ServiceAddr,
    reader: FrameReader<BoxedReader>,
    writer: FrameWriter<BoxedWriter>,
    control: SocketControl,
}

impl UpstreamConnection {
    /// Connect to `server`, trying every resolved address in turn.
    pub async fn connect(
        server: &ServiceAddr,
        timeout: Duration,
        max_message_size: usize,
    ) -> Result<Self> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host(server.to_socket_string())
            .await
            .map_err(|e| classify_lookup_error(server, &e))?
            .collect();
        if addrs.is_empty() {
            return Err(Error::InvalidAddress(format!(
                "{}: no addresses resolved",
                server
            )));
        }

        let mut last_err = None;
        for addr in addrs {
            match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    info!("Connected to upstream {} ({})", server, addr);
                    return Self::from_stream(server.clone(), stream, max_message_size);
                }
                Ok(Err(e)) => {
                    debug!("Connect to {} failed: {}", addr, e);
                    last_err = Some(classify_connect_error(server, addr, &e));
                }
                Err(_) => {
                    debug!("Connect to {} timed out after {:?}", addr, timeout);
                    last_err = Some(Error::TimedOut(format!("connect to {}", server)));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| Error::Io(format!("can't connect to {}", server))))
    }

    fn from_stream(server: ServiceAddr, stream: TcpStream, max_message_size: usize) -> Result<Self> {
        stream
            .set_nodelay(true)
            .map_err(|e| Error::Io(e.to_string()))?;

        // Keep a duplicate handle for half-closing from the coordinator.
        let std_stream = stream.into_std().map_err(|e| Error::System(e.to_string()))?;
        let control = std_stream
            .try_clone()
            .map_err(|e| Error::System(e.to_string()))?;
        let stream = TcpStream::from_std(std_stream).map_err(|e| Error::System(e.to_string()))?;

        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            server,
            reader: FrameReader::new(Box::new(read_half), max_message_size),
            writer: FrameWriter::new(Box::new(write_half), max_message_size),
            control: SocketControl::new(control),
        })
    }

    /// Build a connection over arbitrary streams (no socket to half-close).
    pub fn from_parts(
        server: ServiceAddr,
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        max_message_size: usize,
    ) -> Self {
        Self {
            server,
            reader: FrameReader::new(Box::new(reader), max_message_size),
            writer: FrameWriter::new(Box::new(writer), max_message_size),
            control: SocketControl::detached(),
        }
    }

    pub fn server(&self) -> &ServiceAddr {
        &self.server
    }

    /// Subscribe to `feed` and wait (at most `timeout`) for the reply.
    pub async fn subscribe(&mut self, feed: FeedType, timeout: Duration) -> Result<McastInfo> {
        self.writer
            .send_message(&Message::Subscribe { feed })
            .await
            .map_err(|e| Error::Rpc(e.to_string()))?;

        let reply = tokio::time::timeout(timeout, self.reader.read_message())
            .await
            .map_err(|_| Error::TimedOut(format!("subscribe to {} on {}", feed, self.server)))??;

        match reply {
            Some(Message::SubscriptionReply {
                status: SubscribeStatus::Ok,
                mcast_info: Some(info),
            }) => Ok(info),
            Some(Message::SubscriptionReply {
                status: SubscribeStatus::Ok,
                mcast_info: None,
            }) => Err(Error::Protocol(
                "subscription accepted without multicast info".into(),
            )),
            Some(Message::SubscriptionReply {
                status: SubscribeStatus::InvalidFeed | SubscribeStatus::NoSuchFeed,
                ..
            }) => Err(Error::InvalidFeed(format!("{} on {}", feed, self.server))),
            Some(Message::SubscriptionReply {
                status: SubscribeStatus::Unauthorized,
                ..
            }) => Err(Error::Unauthorized(format!("{} on {}", feed, self.server))),
            Some(other) => Err(Error::Protocol(format!(
                "expected subscription_reply, got {}",
                other.kind()
            ))),
            None => Err(Error::Rpc(format!("{} closed the connection", self.server))),
        }
    }

    /// Split into the parts the session tasks own.
    pub fn into_session_parts(self) -> (RequestSender, FrameReader<BoxedReader>, SocketControl) {
        let sender = RequestSender {
            server: self.server,
            writer: Mutex::new(self.writer),
        };
        (sender, self.reader, self.control)
    }

    /// Close the socket in both directions.
    pub fn close(&self) {
        self.control.shutdown_write();
        self.control.shutdown_read();
    }
}

/// Only a host string the resolver can't even accept is a configuration
/// error; resolver failures may clear up on the next attempt.
fn classify_lookup_error(server: &ServiceAddr, e: &std::io::Error) -> Error {
    let detail = format!("{}: {}", server, e);
    match e.kind() {
        std::io::ErrorKind::InvalidInput => Error::InvalidAddress(detail),
        _ => Error::Io(format!("can't resolve {}", detail)),
    }
}

fn classify_connect_error(server: &ServiceAddr, addr: SocketAddr, e: &std::io::Error) -> Error {
    use std::io::ErrorKind;

    let detail = format!("{} ({}): {}", server, addr, e);
    match e.kind() {
        ErrorKind::ConnectionRefused => Error::Refused(detail),
        ErrorKind::TimedOut => Error::TimedOut(detail),
        ErrorKind::Unsupported | ErrorKind::AddrNotAvailable if addr.is_ipv6() => {
            Error::Ipv6Unsupported(detail)
        }
        _ => Error::Io(detail),
    }
}

/// Sends one-way requests to the upstream server.
///
/// RPC handles are not reentrant, so every send holds the writer lock.
pub struct RequestSender {
    server: ServiceAddr,
    writer: Mutex<FrameWriter<BoxedWriter>>,
}

impl RequestSender {
    /// Sender over an arbitrary stream.
    pub fn new(
        server: ServiceAddr,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        max_message_size: usize,
    ) -> Self {
        Self {
            server,
            writer: Mutex::new(FrameWriter::new(Box::new(writer), max_message_size)),
        }
    }

    pub fn server(&self) -> &ServiceAddr {
        &self.server
    }

    /// Ask for a product missed by multicast. Success means "sent".
    pub async fn request_product(&self, index: ProdIndex) -> Result<()> {
        self.send(&Message::RequestProduct { index }).await
    }

    /// Ask for the backlog between two sessions.
    pub async fn request_backlog(&self, spec: BacklogSpec) -> Result<()> {
        self.send(&Message::RequestBacklog { spec }).await
    }

    async fn send(&self, msg: &Message) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer
            .send_message(msg)
            .await
            .map_err(|e| Error::Rpc(format!("{} to {}: {}", msg.kind(), self.server, e)))
    }
}

/// Half-closes the session socket from outside the tasks using it.
pub struct SocketControl {
    socket: Option<std::net::TcpStream>,
}

impl SocketControl {
    fn new(socket: std::net::TcpStream) -> Self {
        Self {
            socket: Some(socket),
        }
    }

    /// Control with nothing to close.
    pub fn detached() -> Self {
        Self { socket: None }
    }

    /// Unblocks and fails pending and future sends.
    pub fn shutdown_write(&self) {
        self.shutdown(Shutdown::Write);
    }

    /// Makes pending and future reads see end-of-stream.
    pub fn shutdown_read(&self) {
        self.shutdown(Shutdown::Read);
    }

    fn shutdown(&self, how: Shutdown) {
        if let Some(socket) = &self.socket {
            // ENOTCONN once the peer is gone
            if let Err(e) = socket.shutdown(how) {
                debug!("Socket shutdown({:?}): {}", how, e);
            }
        }
    }
}
