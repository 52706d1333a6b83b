//! # Device Transport Boundary
//!
//! The companion radio is reached over BLE, serial or TCP. Everything above this
//! module talks to it only through two traits:
//!
//! - [`Connector`] opens a link to a target and wires the link's unsolicited
//!   events (disconnects, push notifications, send confirmations) into an
//!   [`EventSink`] tagged with a session number.
//! - [`Radio`] is the open link: snapshot queries, the mailbox pull, and the
//!   two text send paths.
//!
//! Session tags let the client discard events from a link it has already
//! replaced. A late `Disconnected` from an abandoned connection must never
//! tear down the current one.
//!
//! [`sim::SimDevice`] implements both traits in-process for tests and the
//! `--simulate` mode of the binary.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::models::{ChannelInfo, Contact, KeyPrefix, SelfInfo};

pub mod sim;

/// Correlation code the device returns for a direct send and later echoes in
/// its confirmation.
pub type AckCode = u32;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {target} timed out after {after:?}")]
    ConnectTimeout { target: String, after: Duration },

    #[error("device unreachable: {0}")]
    Unreachable(String),

    #[error("link is not connected")]
    NotConnected,

    #[error("device rejected request: {0}")]
    Rejected(String),

    /// A frame arrived but could not be decoded. The link itself is still usable.
    #[error("malformed frame: {0}")]
    Protocol(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Unsolicited notifications the device pushes over an open link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushKind {
    /// New records are waiting in the device mailbox.
    MessagesWaiting,
    /// A contact advertised itself.
    Advert,
    PathUpdated,
    Other(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Disconnected { reason: Option<String> },
    Push(PushKind),
    /// A direct send reached its recipient.
    SendConfirmed { ack_code: AckCode, round_trip_ms: u64 },
}

/// A [`TransportEvent`] stamped with the connect attempt that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub session: u64,
    pub event: TransportEvent,
}

/// Where a link posts its unsolicited events. Cloned into the transport's
/// reader task at connect time.
#[derive(Debug, Clone)]
pub struct EventSink {
    session: u64,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSink {
    pub fn new(session: u64, tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { session, tx }
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    /// Post an event. Returns `false` once the client has gone away.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(SessionEvent {
                session: self.session,
                event,
            })
            .is_ok()
    }
}

/// One record pulled from the device mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundRecord {
    Channel {
        channel_index: u8,
        /// Name the sender embedded in the payload, if any.
        sender_name: Option<String>,
        sender_prefix: Option<KeyPrefix>,
        text: String,
        /// Sender clock in epoch seconds. Zero or absent when unknown.
        timestamp_secs: Option<u32>,
    },
    Direct {
        sender_prefix: KeyPrefix,
        text: String,
        timestamp_secs: Option<u32>,
    },
}

/// What the device reports back for a direct send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendReceipt {
    pub expected_ack: AckCode,
    /// Device estimate of how long the ack may take over the current path.
    pub estimated_timeout_ms: u64,
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a link to `target`. Events for the new link go to `events`.
    async fn connect(
        &self,
        target: &str,
        timeout: Duration,
        events: EventSink,
    ) -> Result<Arc<dyn Radio>, TransportError>;
}

#[async_trait]
pub trait Radio: Send + Sync {
    async fn self_info(&self) -> Result<SelfInfo, TransportError>;

    async fn contacts(&self) -> Result<Vec<Contact>, TransportError>;

    async fn channels(&self) -> Result<Vec<ChannelInfo>, TransportError>;

    /// Pop the next mailbox record, `None` once the mailbox is drained.
    async fn sync_next_message(&self) -> Result<Option<InboundRecord>, TransportError>;

    async fn send_channel_text(&self, channel_index: u8, text: &str)
        -> Result<(), TransportError>;

    async fn send_text(&self, public_key: &[u8], text: &str)
        -> Result<SendReceipt, TransportError>;

    /// Best effort; errors are swallowed by the implementation.
    async fn close(&self);
}
