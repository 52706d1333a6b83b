//! Event types crossing the client loop boundary.
//!
//! [`CoreEvent`] is the loop's own queue: timer expiries, mailbox records
//! streamed from the pull task, and auto-responder replies. [`UiCommand`] and
//! [`UiEvent`] are the two directions of the presentation surface.

use serde::Serialize;

use crate::models::{
    ChannelInfo, Contact, ConversationSelector, DeliveryStatus, Message, SelfInfo,
};
use crate::supervisor::ConnectionState;
use crate::transport::{AckCode, InboundRecord};
use crate::validation::InputError;
use tokio::sync::mpsc;

#[derive(Debug)]
pub enum CoreEvent {
    /// Ack deadline for a pending direct send.
    AckTimeout { ack_code: AckCode, timer_id: u64 },
    ReconnectDue { generation: u64 },
    CountdownTick { generation: u64 },
    PollTick,
    SyncRecord { pass: u64, record: InboundRecord },
    /// The pull task for `pass` stopped, after `pulled` records.
    SyncFinished { pass: u64, pulled: usize },
    AutoReply {
        conversation: ConversationSelector,
        text: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiCommand {
    SendMessage {
        conversation: ConversationSelector,
        text: String,
    },
    SelectConversation(ConversationSelector),
    /// Connect now to the current target, skipping any pending backoff wait.
    /// The backoff attempt counter is kept.
    Reconnect,
    ConnectTo(String),
    Disconnect,
    Shutdown,
}

/// User-visible notices. None of these change stored state on their own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Rejected(InputError),
    SendFailed { message_id: String },
    ReconnectScheduled { attempt: u32, delay_ms: u64 },
    ConnectFailed { reason: String },
    Connected { device_name: Option<String> },
    ConnectionLost,
    /// Channel enumeration failed; only the public channel is offered.
    ChannelsUnavailable,
}

impl std::fmt::Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Notice::Rejected(e) => write!(f, "{}", e),
            Notice::SendFailed { message_id } => write!(f, "Message {} was not delivered", message_id),
            Notice::ReconnectScheduled { attempt, delay_ms } => write!(
                f,
                "Reconnecting in {}s (attempt {})",
                delay_ms.div_ceil(1000),
                attempt
            ),
            Notice::ConnectFailed { reason } => write!(f, "Connect failed: {}", reason),
            Notice::Connected { device_name } => match device_name {
                Some(name) => write!(f, "Connected to {}", name),
                None => write!(f, "Connected"),
            },
            Notice::ConnectionLost => write!(f, "Connection lost"),
            Notice::ChannelsUnavailable => {
                write!(f, "Could not read channels from device; showing Public only")
            }
        }
    }
}

/// Everything a front-end needs to redraw.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub connection: ConnectionState,
    pub target: String,
    pub retry_in_secs: Option<u32>,
    pub self_info: Option<SelfInfo>,
    pub contacts: Vec<Contact>,
    pub channels: Vec<ChannelInfo>,
    pub selected: Option<ConversationSelector>,
    pub unread: Vec<(ConversationSelector, u32)>,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone)]
pub enum UiEvent {
    StateChanged(Box<StateSnapshot>),
    MessageAdded(Message),
    MessageStatusChanged { id: String, status: DeliveryStatus },
    Notice(Notice),
}

/// Sending half of the UI event stream. A front-end that went away is not an
/// error for the core.
#[derive(Debug, Clone)]
pub struct UiSink {
    tx: mpsc::UnboundedSender<UiEvent>,
}

impl UiSink {
    pub fn new(tx: mpsc::UnboundedSender<UiEvent>) -> Self {
        Self { tx }
    }

    pub fn emit(&self, event: UiEvent) {
        let _ = self.tx.send(event);
    }

    pub fn notice(&self, notice: Notice) {
        self.emit(UiEvent::Notice(notice));
    }

    pub fn message_added(&self, message: &Message) {
        self.emit(UiEvent::MessageAdded(message.clone()));
    }

    pub fn status_changed(&self, id: &str, status: DeliveryStatus) {
        self.emit(UiEvent::MessageStatusChanged {
            id: id.to_string(),
            status,
        });
    }
}
