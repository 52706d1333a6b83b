//! Unread counters and the current selection. Lives only for the session.

use std::collections::HashMap;

use crate::models::ConversationSelector;

#[derive(Debug, Default)]
pub struct UnreadIndex {
    selected: Option<ConversationSelector>,
    counts: HashMap<ConversationSelector, u32>,
}

impl UnreadIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn selected(&self) -> Option<&ConversationSelector> {
        self.selected.as_ref()
    }

    /// Show a conversation; its unread count drops to zero.
    pub fn select(&mut self, conversation: ConversationSelector) {
        self.counts.remove(&conversation);
        self.selected = Some(conversation);
    }

    /// Count a new inbound message. Returns `false` when the conversation is
    /// on screen and nothing was counted.
    pub fn record_inbound(&mut self, conversation: &ConversationSelector) -> bool {
        if self.selected.as_ref() == Some(conversation) {
            return false;
        }
        *self.counts.entry(conversation.clone()).or_insert(0) += 1;
        true
    }

    pub fn count(&self, conversation: &ConversationSelector) -> u32 {
        self.counts.get(conversation).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u32 {
        self.counts.values().sum()
    }

    /// Non-zero counts, channels first then direct peers by name.
    pub fn entries(&self) -> Vec<(ConversationSelector, u32)> {
        let mut out: Vec<_> = self
            .counts
            .iter()
            .filter(|(_, n)| **n > 0)
            .map(|(c, n)| (c.clone(), *n))
            .collect();
        out.sort_by(|(a, _), (b, _)| order_key(a).cmp(&order_key(b)));
        out
    }
}

fn order_key(c: &ConversationSelector) -> (u8, u8, &str) {
    match c {
        ConversationSelector::Channel(idx) => (0, *idx, ""),
        ConversationSelector::Direct(name) => (1, 0, name.as_str()),
    }
}
