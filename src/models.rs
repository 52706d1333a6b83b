//! # Chat Data Model
//!
//! Types shared by every layer of the client: the persisted [`Message`], the
//! derived conversation identity ([`ConversationSelector`]), and the device
//! snapshot types ([`Contact`], [`ChannelInfo`], [`SelfInfo`]) that are loaded
//! wholesale from the radio on every connect.
//!
//! ## Identity and deduplication
//!
//! Two messages are the same message when their ids match, or when their
//! [`DedupKey`] matches: conversation kind, channel index or peer name, sender
//! display name and text. Delivery notifications that the device mailbox
//! yields twice therefore collapse into one stored line.
//!
//! ## Timestamps
//!
//! Inbound records can carry a missing or zero clock. Those are stored as
//! `None` and rendered with [`format_timestamp`] as a placeholder instead of
//! failing the load.

use chrono::{Local, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Length of the public-key prefix carried by mesh packets in place of a full key.
pub const KEY_PREFIX_LEN: usize = 6;

/// First six bytes of a contact public key.
pub type KeyPrefix = [u8; KEY_PREFIX_LEN];

/// Name used for channel 0 when the device does not report one.
pub const PUBLIC_CHANNEL_NAME: &str = "Public";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConversationKind {
    Channel,
    Direct,
}

/// Identity of one conversation. Derived from a message, never stored on its own.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConversationSelector {
    Channel(u8),
    Direct(String),
}

impl ConversationSelector {
    pub fn kind(&self) -> ConversationKind {
        match self {
            ConversationSelector::Channel(_) => ConversationKind::Channel,
            ConversationSelector::Direct(_) => ConversationKind::Direct,
        }
    }
}

impl fmt::Display for ConversationSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationSelector::Channel(idx) => write!(f, "channel {}", idx),
            ConversationSelector::Direct(name) => write!(f, "dm {}", name),
        }
    }
}

/// Delivery state of an outgoing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    Sending,
    Sent,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    /// Short marker used by text front-ends.
    pub fn glyph(self) -> &'static str {
        match self {
            DeliveryStatus::Sending => "…",
            DeliveryStatus::Sent => "✓",
            DeliveryStatus::Delivered => "✓✓",
            DeliveryStatus::Failed => "✗",
        }
    }
}

/// A single chat line, inbound or outgoing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_kind: ConversationKind,
    /// Present iff `conversation_kind` is `Channel`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_index: Option<u8>,
    /// Present iff `conversation_kind` is `Direct`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_name: Option<String>,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_display_name: Option<String>,
    #[serde(default)]
    pub outgoing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_status: Option<DeliveryStatus>,
    #[serde(default)]
    pub is_automated_reply: bool,
    /// Epoch milliseconds; `None` when the source clock was missing or invalid.
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub timestamp: Option<i64>,
}

/// Compound content key. No two stored messages may share one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    kind: ConversationKind,
    channel_index: Option<u8>,
    peer_name: Option<String>,
    sender: Option<String>,
    text: String,
}

impl Message {
    fn base(selector: &ConversationSelector, text: &str) -> Self {
        let (channel_index, peer_name) = match selector {
            ConversationSelector::Channel(idx) => (Some(*idx), None),
            ConversationSelector::Direct(name) => (None, Some(name.clone())),
        };
        Message {
            id: new_message_id(),
            conversation_kind: selector.kind(),
            channel_index,
            peer_name,
            text: text.to_string(),
            sender_display_name: None,
            outgoing: false,
            delivery_status: None,
            is_automated_reply: false,
            timestamp: None,
        }
    }

    /// Build a received message. `timestamp` is whatever the device reported.
    pub fn inbound(
        selector: &ConversationSelector,
        sender: Option<String>,
        text: &str,
        timestamp: Option<i64>,
    ) -> Self {
        let mut msg = Self::base(selector, text);
        msg.sender_display_name = sender.filter(|s| !s.trim().is_empty());
        msg.timestamp = timestamp.filter(|t| *t > 0);
        msg
    }

    /// Build an outgoing message in the `Sending` state, stamped with the local clock.
    pub fn outgoing(selector: &ConversationSelector, sender: Option<String>, text: &str) -> Self {
        let mut msg = Self::base(selector, text);
        msg.sender_display_name = sender.filter(|s| !s.trim().is_empty());
        msg.outgoing = true;
        msg.delivery_status = Some(DeliveryStatus::Sending);
        msg.timestamp = Some(Utc::now().timestamp_millis());
        msg
    }

    /// Conversation this message belongs to, or `None` for a malformed record
    /// (e.g. a cached Channel line without an index).
    pub fn conversation(&self) -> Option<ConversationSelector> {
        match self.conversation_kind {
            ConversationKind::Channel => self.channel_index.map(ConversationSelector::Channel),
            ConversationKind::Direct => self.peer_name.clone().map(ConversationSelector::Direct),
        }
    }

    pub fn belongs_to(&self, selector: &ConversationSelector) -> bool {
        match selector {
            ConversationSelector::Channel(idx) => {
                self.conversation_kind == ConversationKind::Channel
                    && self.channel_index == Some(*idx)
            }
            ConversationSelector::Direct(name) => {
                self.conversation_kind == ConversationKind::Direct
                    && self.peer_name.as_deref() == Some(name.as_str())
            }
        }
    }

    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            kind: self.conversation_kind,
            channel_index: match self.conversation_kind {
                ConversationKind::Channel => self.channel_index,
                ConversationKind::Direct => None,
            },
            peer_name: match self.conversation_kind {
                ConversationKind::Direct => self.peer_name.clone(),
                ConversationKind::Channel => None,
            },
            sender: self.sender_display_name.clone(),
            text: self.text.clone(),
        }
    }

    /// Sender for display. An absent sender never renders as an empty string.
    pub fn sender_label(&self) -> &str {
        match self.sender_display_name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => "(unknown)",
        }
    }
}

/// Accept a number, `null`, or garbage; anything that is not a positive integer becomes `None`.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(raw.and_then(|v| v.as_i64()).filter(|t| *t > 0))
}

pub fn new_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Local `HH:MM` for a message time, or `--:--` when it is missing or out of range.
pub fn format_timestamp(ts: Option<i64>) -> String {
    ts.and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .map(|dt| dt.with_timezone(&Local).format("%H:%M").to_string())
        .unwrap_or_else(|| "--:--".to_string())
}

/// Lowercase hex of a key prefix, used as the sender label for unknown keys.
pub fn hex_prefix(bytes: &[u8]) -> String {
    bytes
        .iter()
        .take(KEY_PREFIX_LEN)
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join("")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContactRole {
    Chat,
    Repeater,
    Room,
}

impl ContactRole {
    /// Repeaters relay traffic but cannot receive text.
    pub fn accepts_text(self) -> bool {
        !matches!(self, ContactRole::Repeater)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub name: String,
    pub public_key: Vec<u8>,
    pub role: ContactRole,
}

impl Contact {
    pub fn prefix(&self) -> Option<KeyPrefix> {
        let head = self.public_key.get(..KEY_PREFIX_LEN)?;
        let mut out = [0u8; KEY_PREFIX_LEN];
        out.copy_from_slice(head);
        Some(out)
    }

    pub fn matches_prefix(&self, prefix: &[u8]) -> bool {
        prefix.len() == KEY_PREFIX_LEN && self.public_key.starts_with(prefix)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub index: u8,
    pub name: String,
}

impl ChannelInfo {
    /// The channel every device has, used when enumeration fails.
    pub fn public() -> Self {
        ChannelInfo {
            index: 0,
            name: PUBLIC_CHANNEL_NAME.to_string(),
        }
    }

    /// Display name for a channel the snapshot does not know.
    pub fn fallback_name(index: u8) -> String {
        if index == 0 {
            PUBLIC_CHANNEL_NAME.to_string()
        } else {
            format!("Channel {}", index)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelfInfo {
    pub name: String,
    pub public_key: Vec<u8>,
}
