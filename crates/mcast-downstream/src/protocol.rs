// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Upstream RPC wire protocol.
//!
//! Length-prefixed JSON frames over one TCP connection per session. The
//! downstream sends `subscribe` and waits for `subscription_reply`; after
//! that every message in both directions is a one-way notification.
//!
//! Wire format:
//! ```text
//! +----------------+-------------------+
//! | Length (4B BE) | JSON payload      |
//! +----------------+-------------------+
//! ```

use crate::error::Error;
use crate::types::{BacklogSpec, FeedType, McastInfo, ProdIndex, Product};
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upstream protocol messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Downstream asks to subscribe to a feed.
    Subscribe { feed: FeedType },

    /// Upstream answers a subscription.
    SubscriptionReply {
        status: SubscribeStatus,
        #[serde(default)]
        mcast_info: Option<McastInfo>,
    },

    /// Downstream asks for a product missed by multicast.
    RequestProduct { index: ProdIndex },

    /// Downstream asks for the products published between sessions.
    RequestBacklog { spec: BacklogSpec },

    /// Upstream delivers a product requested by index.
    DeliverMissedProduct { index: ProdIndex, product: Product },

    /// Upstream delivers a backlog product.
    DeliverBacklogProduct { product: Product },

    /// Upstream no longer has a requested product.
    NoSuchProduct { index: ProdIndex },

    /// Upstream has sent every product of the backlog.
    EndBacklog,
}

impl Message {
    /// Short name for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Subscribe { .. } => "subscribe",
            Self::SubscriptionReply { .. } => "subscription_reply",
            Self::RequestProduct { .. } => "request_product",
            Self::RequestBacklog { .. } => "request_backlog",
            Self::DeliverMissedProduct { .. } => "deliver_missed_product",
            Self::DeliverBacklogProduct { .. } => "deliver_backlog_product",
            Self::NoSuchProduct { .. } => "no_such_product",
            Self::EndBacklog => "end_backlog",
        }
    }
}

/// Outcome of a subscription request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscribeStatus {
    Ok,
    InvalidFeed,
    Unauthorized,
    NoSuchFeed,
}

/// Framing errors.
#[derive(Debug, ThisError)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl From<std::io::Error> for FrameError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<FrameError> for Error {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Io(s) => Error::Rpc(s),
            FrameError::Protocol(s) => Error::Protocol(s),
        }
    }
}

/// Reads framed messages from the read half of a connection.
pub struct FrameReader<R> {
    inner: R,
    max_message_size: usize,
    read_buffer: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_message_size: usize) -> Self {
        Self {
            inner,
            max_message_size,
            read_buffer: Vec::with_capacity(4096),
        }
    }

    /// Read one message.
    ///
    /// Returns `Ok(None)` if the peer closed the connection (or the read
    /// half was shut down) between frames.
    pub async fn read_message(&mut self) -> Result<Option<Message>, FrameError> {
        let mut len_buf = [0u8; 4];
        match self.inner.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(FrameError::Io(e.to_string())),
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 {
            return Err(FrameError::Protocol("Empty message".into()));
        }
        if len > self.max_message_size {
            return Err(FrameError::Protocol(format!(
                "Message too large: {} > {}",
                len, self.max_message_size
            )));
        }

        self.read_buffer.clear();
        self.read_buffer.resize(len, 0);
        self.inner.read_exact(&mut self.read_buffer).await?;

        let msg = serde_json::from_slice(&self.read_buffer)
            .map_err(|e| FrameError::Protocol(format!("Invalid JSON: {}", e)))?;
        Ok(Some(msg))
    }
}

/// Writes framed messages to the write half of a connection.
pub struct FrameWriter<W> {
    inner: W,
    max_message_size: usize,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W, max_message_size: usize) -> Self {
        Self {
            inner,
            max_message_size,
        }
    }

    /// Send one message.
    pub async fn send_message(&mut self, msg: &Message) -> Result<(), FrameError> {
        let json = serde_json::to_vec(msg)
            .map_err(|e| FrameError::Protocol(format!("Serialize error: {}", e)))?;

        if json.len() > self.max_message_size {
            return Err(FrameError::Protocol(format!(
                "Message too large: {} > {}",
                json.len(),
                self.max_message_size
            )));
        }

        let len = json.len() as u32;
        self.inner.write_all(&len.to_be_bytes()).await?;
        self.inner.write_all(&json).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Close the write direction.
    pub async fn shutdown(&mut self) -> Result<(), FrameError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Signature;

    #[test]
    fn test_message_tagging() {
        let json = serde_json::to_string(&Message::RequestProduct { index: 7 }).unwrap();
        assert_eq!(json, r#"{"type":"request_product","index":7}"#);

        let json = serde_json::to_string(&Message::EndBacklog).unwrap();
        assert_eq!(json, r#"{"type":"end_backlog"}"#);
    }

    #[test]
    fn test_subscription_reply_without_info() {
        let msg: Message =
            serde_json::from_str(r#"{"type":"subscription_reply","status":"unauthorized"}"#)
                .unwrap();
        assert_eq!(
            msg,
            Message::SubscriptionReply {
                status: SubscribeStatus::Unauthorized,
                mcast_info: None,
            }
        );
    }

    #[test]
    fn test_backlog_spec_serialize() {
        let msg = Message::RequestBacklog {
            spec: BacklogSpec {
                after: None,
                before: Signature([1; 16]),
                time_offset_secs: 3600,
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"request_backlog\""));
        assert!(json.contains("\"time_offset_secs\":3600"));
        assert_eq!(msg.kind(), "request_backlog");
    }

    #[tokio::test]
    async fn test_frames_over_duplex() {
        let (a, b) = tokio::io::duplex(4096);
        let mut writer = FrameWriter::new(a, 1024);
        let mut reader = FrameReader::new(b, 1024);

        writer
            .send_message(&Message::NoSuchProduct { index: 3 })
            .await
            .unwrap();
        writer.send_message(&Message::EndBacklog).await.unwrap();
        writer.shutdown().await.unwrap();
        drop(writer);

        assert_eq!(
            reader.read_message().await.unwrap(),
            Some(Message::NoSuchProduct { index: 3 })
        );
        assert_eq!(reader.read_message().await.unwrap(), Some(Message::EndBacklog));
        assert_eq!(reader.read_message().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversize_and_empty_frames_rejected() {
        let (mut a, b) = tokio::io::duplex(4096);
        let mut reader = FrameReader::new(b, 16);

        a.write_all(&100u32.to_be_bytes()).await.unwrap();
        assert!(matches!(
            reader.read_message().await,
            Err(FrameError::Protocol(_))
        ));

        let (mut a, b) = tokio::io::duplex(4096);
        let mut reader = FrameReader::new(b, 16);
        a.write_all(&0u32.to_be_bytes()).await.unwrap();
        assert!(matches!(
            reader.read_message().await,
            Err(FrameError::Protocol(_))
        ));
    }

    #[test]
    fn test_frame_error_mapping() {
        let e: Error = FrameError::Io("reset".into()).into();
        assert!(matches!(e, Error::Rpc(_)));
        let e: Error = FrameError::Protocol("junk".into()).into();
        assert!(matches!(e, Error::Protocol(_)));
    }
}
