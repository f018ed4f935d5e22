//! Application envelopes carried inside published items.
//!
//! Every payload the agent publishes is wrapped in an envelope naming the
//! channel, the topic and a random 12-byte id. The envelope reuses the
//! [`NamedItem`] encoding with a three-component name:
//!
//! ```text
//! /<channel>/<topic>/<id-hex>        plain
//! /ENC-<channel>/<topic>/<nonce-hex> sealed with the group key
//! ```
//!
//! When sealed, the id doubles as the encryption nonce.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use namesync_core::{Component, Name, NamedItem};
use namesync_seal::{GroupKey, Nonce};
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};

/// Channel prefix marking a sealed envelope.
pub const SEALED_PREFIX: &str = "ENC-";

/// What an envelope carries and how the receiver treats it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Channel {
    /// Document update, delivered at least once.
    Update,
    /// Name of a segmented blob; fetched in the background.
    Blob,
    /// Latest-only status.
    Status,
    /// Name of a blob holding an update too large for one item.
    BlobUpdate,
}

impl Channel {
    pub const ALL: [Channel; 4] = [
        Channel::Update,
        Channel::Blob,
        Channel::Status,
        Channel::BlobUpdate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Update => "update",
            Channel::Blob => "blob",
            Channel::Status => "status",
            Channel::BlobUpdate => "blobUpdate",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        Channel::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| AgentError::MalformedEnvelope(format!("unknown channel {s:?}")))
    }
}

/// A decoded envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub channel: Channel,
    pub topic: String,
    pub content: Bytes,
    /// Whether the content arrived sealed.
    pub sealed: bool,
}

impl Envelope {
    pub fn new(channel: Channel, topic: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Self {
            channel,
            topic: topic.into(),
            content: content.into(),
            sealed: false,
        }
    }

    /// Encode, sealing the content when `key` is given.
    pub fn encode(&self, key: Option<&GroupKey>) -> Result<Bytes> {
        let id = Nonce::generate();
        let (channel, content) = match key {
            Some(key) => (
                format!("{SEALED_PREFIX}{}", self.channel),
                key.encrypt(&self.content, &id)?,
            ),
            None => (self.channel.to_string(), self.content.clone()),
        };
        let name = Name::from_components(vec![
            Component::generic(&channel),
            Component::generic(&self.topic),
            Component::generic(&id.to_hex()),
        ]);
        Ok(NamedItem::new(name, content).encode())
    }

    /// Decode, opening sealed content with `key`.
    pub fn decode(wire: &[u8], key: Option<&GroupKey>) -> Result<Self> {
        let item = NamedItem::decode(wire)
            .map_err(|e| AgentError::MalformedEnvelope(e.to_string()))?;
        let text = |i: usize| {
            item.name
                .get(i)
                .and_then(Component::as_text)
                .ok_or_else(|| AgentError::MalformedEnvelope(format!("bad envelope name {}", item.name)))
        };
        if item.name.len() != 3 {
            return Err(AgentError::MalformedEnvelope(format!(
                "bad envelope name {}",
                item.name
            )));
        }

        let channel_text = text(0)?;
        let topic = text(1)?.to_string();
        match channel_text.strip_prefix(SEALED_PREFIX) {
            Some(channel) => {
                let channel = channel.parse()?;
                let key = key.ok_or(AgentError::MissingGroupKey)?;
                let nonce = Nonce::from_hex(text(2)?)?;
                let content = key.decrypt(&item.content, &nonce)?;
                Ok(Self {
                    channel,
                    topic,
                    content,
                    sealed: true,
                })
            }
            None => Ok(Self {
                channel: channel_text.parse()?,
                topic,
                content: item.content,
                sealed: false,
            }),
        }
    }
}
