//! Optional auto-responder.
//!
//! Runs off the client loop: the client spawns [`Responder::respond`] for each
//! accepted inbound message and feeds any reply back through its own queue, so
//! a slow responder never stalls sync or delivery. Replies go out as ordinary
//! sends flagged as automated.

use async_trait::async_trait;

use crate::config::ResponderConfig;
use crate::models::{ConversationKind, ConversationSelector, Message};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyRequest {
    pub conversation: ConversationSelector,
    pub sender: Option<String>,
    pub text: String,
}

#[async_trait]
pub trait Responder: Send + Sync {
    /// Reply text for `request`, or `None` to stay quiet.
    async fn respond(&self, request: &ReplyRequest) -> Option<String>;
}

/// Answers everything with one fixed line.
pub struct CannedResponder {
    reply: String,
}

impl CannedResponder {
    pub fn new(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
        }
    }
}

#[async_trait]
impl Responder for CannedResponder {
    async fn respond(&self, request: &ReplyRequest) -> Option<String> {
        // Never answer our own canned line; two responders would ping-pong.
        if self.reply.trim().is_empty() || request.text == self.reply {
            return None;
        }
        Some(self.reply.clone())
    }
}

/// Whether an accepted inbound message should be offered to the responder.
pub fn wants_reply(message: &Message, config: &ResponderConfig) -> Option<ReplyRequest> {
    if !config.enabled || message.outgoing {
        return None;
    }
    if message.conversation_kind == ConversationKind::Channel && !config.reply_to_channels {
        return None;
    }
    Some(ReplyRequest {
        conversation: message.conversation()?,
        sender: message.sender_display_name.clone(),
        text: message.text.clone(),
    })
}
