//! # Inbound Sync
//!
//! Drains the device mailbox into the message store.
//!
//! A pass is started by the poll timer or by a `MessagesWaiting` push. Only
//! one pass runs at a time: a trigger that arrives while a pass is in flight
//! is dropped, not queued, since the running pass will drain whatever the
//! trigger announced.
//!
//! The pull itself runs on a spawned task that streams each record back into
//! the client loop as [`CoreEvent::SyncRecord`] and ends with
//! [`CoreEvent::SyncFinished`]. Classification and storage happen on the loop,
//! so records are processed strictly in mailbox order.

use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::client::events::{CoreEvent, UiSink};
use crate::logutil::preview;
use crate::metrics;
use crate::models::{hex_prefix, ConversationSelector, Message};
use crate::storage::{AppendOutcome, MessageStore};
use crate::supervisor::DeviceSnapshot;
use crate::transport::{InboundRecord, Radio, TransportError};
use crate::unread::UnreadIndex;

/// Consecutive undecodable frames tolerated before a pass gives up.
const MAX_BAD_FRAMES: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    Connect,
    Poll,
    Push,
}

#[derive(Default)]
pub struct InboundSync {
    in_flight: Option<u64>,
    next_pass: u64,
    accepted_this_pass: usize,
    task: Option<JoinHandle<()>>,
}

impl InboundSync {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Start a pass unless one is running. Returns `false` when the trigger was dropped.
    pub fn trigger(
        &mut self,
        radio: Arc<dyn Radio>,
        tx: mpsc::UnboundedSender<CoreEvent>,
        reason: SyncTrigger,
    ) -> bool {
        if let Some(pass) = self.in_flight {
            debug!("Sync trigger {:?} dropped; pass {} in flight", reason, pass);
            return false;
        }
        self.next_pass += 1;
        let pass = self.next_pass;
        self.in_flight = Some(pass);
        self.accepted_this_pass = 0;
        debug!("Sync pass {} started ({:?})", pass, reason);
        self.task = Some(tokio::spawn(pull_mailbox(radio, tx, pass)));
        true
    }

    /// Returns `true` for a record from the running pass.
    pub fn is_current(&self, pass: u64) -> bool {
        self.in_flight == Some(pass)
    }

    pub fn note_accepted(&mut self) {
        self.accepted_this_pass += 1;
    }

    /// Pass `pass` ended. Returns how many records it stored, or `None` for a
    /// pass that was already abandoned.
    pub fn finish(&mut self, pass: u64, pulled: usize) -> Option<usize> {
        if !self.is_current(pass) {
            return None;
        }
        self.in_flight = None;
        self.task = None;
        let accepted = self.accepted_this_pass;
        if pulled > 0 {
            info!(
                "Sync pass {}: {} pulled, {} new",
                pass, pulled, accepted
            );
        }
        Some(accepted)
    }

    /// Abandon the running pass, e.g. when the link goes away. Records it
    /// already pulled are still queued and get stored when they arrive.
    pub fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(pass) = self.in_flight.take() {
            debug!("Sync pass {} abandoned", pass);
        }
    }
}

async fn pull_mailbox(radio: Arc<dyn Radio>, tx: mpsc::UnboundedSender<CoreEvent>, pass: u64) {
    let mut pulled = 0usize;
    let mut bad_frames = 0u32;
    loop {
        match radio.sync_next_message().await {
            Ok(Some(record)) => {
                bad_frames = 0;
                pulled += 1;
                if tx.send(CoreEvent::SyncRecord { pass, record }).is_err() {
                    return;
                }
            }
            Ok(None) => break,
            Err(TransportError::Protocol(what)) => {
                bad_frames += 1;
                warn!("Skipping undecodable mailbox record: {}", what);
                if bad_frames >= MAX_BAD_FRAMES {
                    warn!("Too many bad mailbox records; ending pass {}", pass);
                    break;
                }
            }
            Err(e) => {
                warn!("Mailbox pull failed: {}", e);
                break;
            }
        }
    }
    let _ = tx.send(CoreEvent::SyncFinished { pass, pulled });
}

/// Turn a mailbox record into a stored message, resolving names against the
/// current device snapshot.
///
/// Direct senders are matched by key prefix (first matching contact wins) and
/// fall back to the hex prefix. Channel senders use, in order: the name in the
/// payload, a contact matching the prefix, the hex prefix, or nothing.
pub fn classify(record: InboundRecord, snapshot: &DeviceSnapshot) -> Message {
    match record {
        InboundRecord::Direct {
            sender_prefix,
            text,
            timestamp_secs,
        } => {
            let name = snapshot
                .contact_by_prefix(&sender_prefix)
                .map(|c| c.name.clone())
                .unwrap_or_else(|| hex_prefix(&sender_prefix));
            Message::inbound(
                &ConversationSelector::Direct(name.clone()),
                Some(name),
                &text,
                to_millis(timestamp_secs),
            )
        }
        InboundRecord::Channel {
            channel_index,
            sender_name,
            sender_prefix,
            text,
            timestamp_secs,
        } => {
            let sender = sender_name
                .filter(|n| !n.trim().is_empty())
                .or_else(|| {
                    sender_prefix.map(|p| {
                        snapshot
                            .contact_by_prefix(&p)
                            .map(|c| c.name.clone())
                            .unwrap_or_else(|| hex_prefix(&p))
                    })
                });
            Message::inbound(
                &ConversationSelector::Channel(channel_index),
                sender,
                &text,
                to_millis(timestamp_secs),
            )
        }
    }
}

fn to_millis(secs: Option<u32>) -> Option<i64> {
    secs.filter(|s| *s > 0).map(|s| i64::from(s) * 1000)
}

/// Store an inbound message and bump unread for its conversation unless that
/// conversation is on screen. Duplicates change nothing.
pub fn deliver_inbound(
    message: Message,
    store: &mut MessageStore,
    unread: &mut UnreadIndex,
    ui: &UiSink,
) -> AppendOutcome {
    let conversation = message.conversation();
    let outcome = store.append(message.clone());
    if outcome == AppendOutcome::RejectedDuplicate {
        return outcome;
    }
    metrics::inc_inbound_received();
    debug!(
        "Inbound {} from {}: '{}'",
        conversation
            .as_ref()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "?".into()),
        message.sender_label(),
        preview(&message.text, 80)
    );
    if let Some(conv) = conversation {
        unread.record_inbound(&conv);
    }
    ui.message_added(&message);
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChannelInfo, Contact, ContactRole};
    use crate::transport::sim::SimDevice;
    use crate::transport::{Connector, EventSink};
    use std::time::Duration;

    fn contact(name: &str, key: &[u8]) -> Contact {
        Contact {
            name: name.into(),
            public_key: key.to_vec(),
            role: ContactRole::Chat,
        }
    }

    fn snapshot() -> DeviceSnapshot {
        DeviceSnapshot {
            self_info: None,
            contacts: vec![
                contact("bob", &[0xa1, 0xb2, 0xc3, 0x00, 0x00, 0x01, 0x99]),
                contact("bobby", &[0xa1, 0xb2, 0xc3, 0x00, 0x00, 0x01, 0x42]),
            ],
            channels: vec![ChannelInfo::public()],
            channels_fallback: false,
        }
    }

    #[test]
    fn direct_sender_resolves_first_prefix_match() {
        let msg = classify(
            InboundRecord::Direct {
                sender_prefix: [0xa1, 0xb2, 0xc3, 0x00, 0x00, 0x01],
                text: "hi".into(),
                timestamp_secs: Some(1_700_000_000),
            },
            &snapshot(),
        );
        assert_eq!(msg.conversation(), Some(ConversationSelector::Direct("bob".into())));
        assert_eq!(msg.sender_display_name.as_deref(), Some("bob"));
        assert_eq!(msg.timestamp, Some(1_700_000_000_000));
    }

    #[test]
    fn unknown_direct_sender_uses_hex_prefix() {
        let msg = classify(
            InboundRecord::Direct {
                sender_prefix: [0xde, 0xad, 0xbe, 0xef, 0x00, 0x01],
                text: "hi".into(),
                timestamp_secs: Some(0),
            },
            &snapshot(),
        );
        assert_eq!(msg.peer_name.as_deref(), Some("deadbeef0001"));
        assert_eq!(msg.timestamp, None);
    }

    #[test]
    fn channel_sender_resolution_order() {
        let snap = snapshot();
        let named = classify(
            InboundRecord::Channel {
                channel_index: 1,
                sender_name: Some("carol".into()),
                sender_prefix: Some([0xa1, 0xb2, 0xc3, 0x00, 0x00, 0x01]),
                text: "x".into(),
                timestamp_secs: None,
            },
            &snap,
        );
        assert_eq!(named.sender_display_name.as_deref(), Some("carol"));

        let by_prefix = classify(
            InboundRecord::Channel {
                channel_index: 1,
                sender_name: None,
                sender_prefix: Some([0xa1, 0xb2, 0xc3, 0x00, 0x00, 0x01]),
                text: "x".into(),
                timestamp_secs: None,
            },
            &snap,
        );
        assert_eq!(by_prefix.sender_display_name.as_deref(), Some("bob"));

        let anonymous = classify(
            InboundRecord::Channel {
                channel_index: 1,
                sender_name: None,
                sender_prefix: None,
                text: "x".into(),
                timestamp_secs: None,
            },
            &snap,
        );
        assert_eq!(anonymous.sender_display_name, None);
        assert_eq!(anonymous.channel_index, Some(1));
    }

    #[test]
    fn duplicate_inbound_leaves_unread_alone() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ui = UiSink::new(tx);
        let mut store = MessageStore::in_memory();
        let mut unread = UnreadIndex::new();
        let rec = || InboundRecord::Direct {
            sender_prefix: [0xa1, 0xb2, 0xc3, 0x00, 0x00, 0x01],
            text: "hi".into(),
            timestamp_secs: None,
        };
        let bob = ConversationSelector::Direct("bob".into());
        assert_eq!(
            deliver_inbound(classify(rec(), &snapshot()), &mut store, &mut unread, &ui),
            AppendOutcome::Accepted
        );
        assert_eq!(
            deliver_inbound(classify(rec(), &snapshot()), &mut store, &mut unread, &ui),
            AppendOutcome::RejectedDuplicate
        );
        assert_eq!(unread.count(&bob), 1);
        assert_eq!(store.len(), 1);
        let added = std::iter::from_fn(|| rx.try_recv().ok()).count();
        assert_eq!(added, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_triggers_run_one_pass() {
        let dev = SimDevice::new();
        dev.set_pull_delay(Some(Duration::from_millis(200)));
        for i in 0..3 {
            dev.queue_inbound(InboundRecord::Channel {
                channel_index: 0,
                sender_name: None,
                sender_prefix: None,
                text: format!("m{}", i),
                timestamp_secs: None,
            });
        }
        let (link_tx, _link_rx) = mpsc::unbounded_channel();
        let radio = dev
            .connect("sim", Duration::from_secs(1), EventSink::new(1, link_tx))
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sync = InboundSync::new();
        assert!(sync.trigger(radio.clone(), tx.clone(), SyncTrigger::Poll));
        assert!(!sync.trigger(radio.clone(), tx.clone(), SyncTrigger::Push));
        assert!(!sync.trigger(radio.clone(), tx.clone(), SyncTrigger::Push));

        let mut texts = Vec::new();
        loop {
            match rx.recv().await {
                Some(CoreEvent::SyncRecord { pass, record }) => {
                    assert!(sync.is_current(pass));
                    if let InboundRecord::Channel { text, .. } = record {
                        texts.push(text);
                    }
                }
                Some(CoreEvent::SyncFinished { pass, pulled }) => {
                    assert_eq!(pulled, 3);
                    assert!(sync.finish(pass, pulled).is_some());
                    break;
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(texts, vec!["m0", "m1", "m2"]);
        assert_eq!(dev.pulls(), 4);
        assert!(!sync.in_flight());
        assert!(sync.trigger(radio, tx, SyncTrigger::Poll));
    }

    #[tokio::test]
    async fn bad_frames_are_skipped() {
        let dev = SimDevice::new();
        dev.queue_malformed("short frame");
        dev.queue_inbound(InboundRecord::Direct {
            sender_prefix: [1, 2, 3, 4, 5, 6],
            text: "ok".into(),
            timestamp_secs: None,
        });
        let (link_tx, _link_rx) = mpsc::unbounded_channel();
        let radio = dev
            .connect("sim", Duration::from_secs(1), EventSink::new(1, link_tx))
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sync = InboundSync::new();
        sync.trigger(radio, tx, SyncTrigger::Connect);
        assert!(matches!(rx.recv().await, Some(CoreEvent::SyncRecord { .. })));
        assert!(matches!(
            rx.recv().await,
            Some(CoreEvent::SyncFinished { pulled: 1, .. })
        ));
    }
}
