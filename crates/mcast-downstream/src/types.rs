// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Core data types shared by the downstream node.
//!
//! Products are identified two ways: by a sequence index assigned by the
//! multicast sender (used for gap recovery) and by a content signature (used
//! for duplicate detection and as backlog bounds across sessions).

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Default port of an upstream server.
pub const DEFAULT_PORT: u16 = 38800;

/// Sequence index of a product on a multicast feed.
pub type ProdIndex = u32;

/// 16-byte product signature (MD5-sized content hash).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Signature(pub [u8; 16]);

impl Signature {
    /// Create a signature from raw bytes.
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// The all-zero signature is never a valid product signature.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Lowercase hex representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from a 32-character hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 16] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Parse from a SQLite blob column.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 16] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", self.to_hex())
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid signature: {}", s)))
    }
}

/// Feed specification: a bit mask of product categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FeedType(pub u32);

impl FeedType {
    /// Every feed.
    pub const ANY: FeedType = FeedType(u32::MAX);
    /// No feed at all.
    pub const NONE: FeedType = FeedType(0);

    /// Raw mask.
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Returns true if the masks share at least one bit.
    pub fn intersects(&self, other: FeedType) -> bool {
        self.0 & other.0 != 0
    }
}

impl Default for FeedType {
    fn default() -> Self {
        Self::ANY
    }
}

impl fmt::Display for FeedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::ANY {
            f.write_str("ANY")
        } else {
            write!(f, "0x{:08x}", self.0)
        }
    }
}

impl FromStr for FeedType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("any") {
            return Ok(Self::ANY);
        }
        if s.eq_ignore_ascii_case("none") {
            return Ok(Self::NONE);
        }
        let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u32::from_str_radix(hex, 16),
            None => s.parse::<u32>(),
        };
        parsed
            .map(FeedType)
            .map_err(|e| format!("invalid feed '{}': {}", s, e))
    }
}

impl Serialize for FeedType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.0)
    }
}

impl<'de> Deserialize<'de> for FeedType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Num(u32),
            Text(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Num(n) => Ok(FeedType(n)),
            Repr::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Address of an upstream server (`host:port`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceAddr {
    pub host: String,
    pub port: u16,
}

impl ServiceAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Filesystem-safe key used to name per-server files.
    pub fn file_key(&self) -> String {
        let host: String = self
            .host
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        format!("{}_{}", host, self.port)
    }

    /// `host:port` form accepted by `tokio::net::lookup_host`.
    pub fn to_socket_string(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ServiceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for ServiceAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty server address".into());
        }

        // [v6]:port or [v6]
        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| format!("unterminated '[' in '{}'", s))?;
            if host.is_empty() {
                return Err(format!("empty host in '{}'", s));
            }
            let port = match tail.strip_prefix(':') {
                Some(p) => parse_port(p)?,
                None if tail.is_empty() => DEFAULT_PORT,
                None => return Err(format!("invalid server address '{}'", s)),
            };
            return Ok(Self::new(host, port));
        }

        match s.rsplit_once(':') {
            // Bare IPv6 literal without brackets
            Some((host, _)) if host.contains(':') => Ok(Self::new(s, DEFAULT_PORT)),
            Some((host, port)) => {
                if host.is_empty() {
                    return Err(format!("empty host in '{}'", s));
                }
                Ok(Self::new(host, parse_port(port)?))
            }
            None => Ok(Self::new(s, DEFAULT_PORT)),
        }
    }
}

fn parse_port(s: &str) -> Result<u16, String> {
    match s.parse::<u16>() {
        Ok(0) | Err(_) => Err(format!("invalid port '{}'", s)),
        Ok(p) => Ok(p),
    }
}

impl Serialize for ServiceAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ServiceAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Metadata of a data product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductInfo {
    /// Content signature
    pub signature: Signature,

    /// Feed the product belongs to
    pub feed: FeedType,

    /// Product identifier (free text)
    pub ident: String,

    /// Originating host
    pub origin: String,

    /// Creation time (Unix nanoseconds)
    pub arrival_ns: u64,

    /// Sequence number assigned by the origin
    pub seqno: u32,

    /// Size of the data in bytes
    pub size: u32,
}

/// A data product: metadata plus payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub info: ProductInfo,
    pub data: Vec<u8>,
}

impl Product {
    /// Build a product whose `size` matches its payload.
    pub fn new(
        signature: Signature,
        feed: FeedType,
        ident: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        let arrival_ns = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Self {
            info: ProductInfo {
                signature,
                feed,
                ident: ident.into(),
                origin: String::new(),
                arrival_ns,
                seqno: 0,
                size: data.len() as u32,
            },
            data,
        }
    }

    pub fn signature(&self) -> Signature {
        self.info.signature
    }
}

/// Multicast group information returned by a successful subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct McastInfo {
    /// Feed actually being multicast
    pub feed: FeedType,

    /// Multicast group (`address:port`)
    pub group: String,

    /// Retransmission server of the multicast sender
    pub server: String,
}

/// Bounds of a backlog request.
///
/// Products strictly after `after` up to (but excluding) `before`. Without
/// `after`, the lower bound is `time_offset_secs` before now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacklogSpec {
    #[serde(default)]
    pub after: Option<Signature>,
    pub before: Signature,
    pub time_offset_secs: u32,
}

/// Hex encoding/decoding utilities.
mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes
            .as_ref()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }

    pub fn decode(s: &str) -> Result<Vec<u8>, ()> {
        if s.len() % 2 != 0 || !s.is_ascii() {
            return Err(());
        }
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| ()))
            .collect()
    }
}
