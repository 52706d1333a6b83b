//! # Delivery Tracker
//!
//! Drives outgoing messages through `Sending -> Sent -> Delivered | Failed`.
//!
//! Direct messages are reliable: the device answers each send with an ack code
//! and a timeout estimate, and the tracker arms a timer for
//! `estimated_timeout + ack_margin`. A confirmation carrying the code marks the
//! message Delivered; an expiry re-sends it, up to `max_retries` extra attempts,
//! then marks it Failed. Every re-send gets a fresh ack code from the device,
//! so the pending entry is re-keyed and a late ack for an abandoned code is
//! simply unknown. Retries are linear; there is no backoff between attempts.
//!
//! A transport error on any attempt counts as a spent attempt and the next one
//! goes out immediately.
//!
//! Channel messages are fire-and-forget on the mesh. They stop at Sent and
//! never reach Delivered.

use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::client::events::{CoreEvent, Notice, UiSink};
use crate::client::timers::{self, TimerHandle};
use crate::logutil::preview;
use crate::metrics;
use crate::models::{DeliveryStatus, Message};
use crate::storage::{AppendOutcome, MessageStore};
use crate::transport::{AckCode, Radio};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryPolicy {
    /// Extra attempts after the first. Total attempts = `max_retries + 1`.
    pub max_retries: u32,
    pub ack_margin: Duration,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            ack_margin: Duration::from_millis(3000),
        }
    }
}

/// Where an outgoing message is addressed on the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    Channel(u8),
    Direct { public_key: Vec<u8> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Stored and handed to the radio (status tells how far it got).
    Submitted,
    /// An identical message is already in the conversation; nothing was sent.
    Duplicate,
}

/// Borrowed view of the client the tracker works against.
pub struct SendContext<'a> {
    /// `None` while disconnected.
    pub radio: Option<Arc<dyn Radio>>,
    pub store: &'a mut MessageStore,
    pub ui: &'a UiSink,
}

struct PendingSend {
    message_id: String,
    /// Zero-based attempt number that produced the current ack code.
    attempt: u32,
    public_key: Vec<u8>,
    text: String,
    timer_id: u64,
    _timer: TimerHandle,
    sent_at: Instant,
}

pub struct DeliveryTracker {
    policy: DeliveryPolicy,
    pending: HashMap<AckCode, PendingSend>,
    timer_tx: mpsc::UnboundedSender<CoreEvent>,
    next_timer_id: u64,
}

impl DeliveryTracker {
    pub fn new(policy: DeliveryPolicy, timer_tx: mpsc::UnboundedSender<CoreEvent>) -> Self {
        Self {
            policy,
            pending: HashMap::new(),
            timer_tx,
            next_timer_id: 0,
        }
    }

    pub fn policy(&self) -> DeliveryPolicy {
        self.policy
    }

    /// Number of direct sends waiting for an ack.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, ack_code: AckCode) -> bool {
        self.pending.contains_key(&ack_code)
    }

    /// Store `message` as Sending and push it to the radio.
    pub async fn send(
        &mut self,
        ctx: &mut SendContext<'_>,
        message: Message,
        recipient: Recipient,
    ) -> SendOutcome {
        let id = message.id.clone();
        let text = message.text.clone();
        if ctx.store.append(message.clone()) == AppendOutcome::RejectedDuplicate {
            return SendOutcome::Duplicate;
        }
        ctx.ui.message_added(&message);

        match recipient {
            Recipient::Channel(index) => self.send_channel(ctx, &id, index, &text).await,
            Recipient::Direct { public_key } => {
                self.attempt_direct(ctx, id, public_key, text, 0).await
            }
        }
        SendOutcome::Submitted
    }

    async fn send_channel(&mut self, ctx: &mut SendContext<'_>, id: &str, index: u8, text: &str) {
        let mut attempt = 0u32;
        loop {
            let result = match &ctx.radio {
                Some(radio) => radio.send_channel_text(index, text).await,
                None => Err(crate::transport::TransportError::NotConnected),
            };
            match result {
                Ok(()) => {
                    metrics::inc_channel_sent();
                    debug!("Channel {} send ok id={} '{}'", index, id, preview(text, 60));
                    set_status(ctx, id, DeliveryStatus::Sent);
                    return;
                }
                Err(e) => {
                    warn!(
                        "Channel {} send attempt {} failed id={}: {}",
                        index,
                        attempt + 1,
                        id,
                        e
                    );
                    if attempt >= self.policy.max_retries {
                        metrics::inc_channel_failed();
                        self.fail(ctx, id);
                        return;
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Send attempt `attempt` of a direct message, falling through to further
    /// attempts while the transport keeps erroring.
    async fn attempt_direct(
        &mut self,
        ctx: &mut SendContext<'_>,
        message_id: String,
        public_key: Vec<u8>,
        text: String,
        mut attempt: u32,
    ) {
        loop {
            let result = match &ctx.radio {
                Some(radio) => radio.send_text(&public_key, &text).await,
                None => Err(crate::transport::TransportError::NotConnected),
            };
            match result {
                Ok(receipt) => {
                    metrics::inc_direct_sent();
                    set_status(ctx, &message_id, DeliveryStatus::Sent);
                    let wait =
                        Duration::from_millis(receipt.estimated_timeout_ms) + self.policy.ack_margin;
                    self.next_timer_id += 1;
                    let timer_id = self.next_timer_id;
                    let timer = timers::after(
                        wait,
                        self.timer_tx.clone(),
                        CoreEvent::AckTimeout {
                            ack_code: receipt.expected_ack,
                            timer_id,
                        },
                    );
                    debug!(
                        "DM id={} attempt {} awaiting ack {:08x} for {:?}",
                        message_id,
                        attempt + 1,
                        receipt.expected_ack,
                        wait
                    );
                    let previous = self.pending.insert(
                        receipt.expected_ack,
                        PendingSend {
                            message_id,
                            attempt,
                            public_key,
                            text,
                            timer_id,
                            _timer: timer,
                            sent_at: Instant::now(),
                        },
                    );
                    if let Some(prev) = previous {
                        warn!(
                            "Ack code {:08x} reused by device; dropping tracking for id={}",
                            receipt.expected_ack, prev.message_id
                        );
                    }
                    return;
                }
                Err(e) => {
                    warn!(
                        "DM send attempt {} failed id={}: {}",
                        attempt + 1,
                        message_id,
                        e
                    );
                    if attempt >= self.policy.max_retries {
                        metrics::inc_direct_failed();
                        self.fail(ctx, &message_id);
                        return;
                    }
                    attempt += 1;
                    metrics::inc_direct_retries();
                }
            }
        }
    }

    /// Ack deadline passed. Stale timers (already acked, or superseded) are ignored.
    pub async fn on_ack_timeout(
        &mut self,
        ctx: &mut SendContext<'_>,
        ack_code: AckCode,
        timer_id: u64,
    ) {
        match self.pending.get(&ack_code) {
            Some(p) if p.timer_id == timer_id => {}
            _ => {
                debug!("Ignoring stale ack timer for {:08x}", ack_code);
                return;
            }
        }
        let Some(entry) = self.pending.remove(&ack_code) else {
            return;
        };
        if entry.attempt >= self.policy.max_retries {
            info!(
                "DM id={} unacknowledged after {} attempts",
                entry.message_id,
                entry.attempt + 1
            );
            metrics::inc_direct_failed();
            self.fail(ctx, &entry.message_id);
            return;
        }
        metrics::inc_direct_retries();
        info!(
            "DM id={} ack {:08x} timed out; resending (attempt {}/{})",
            entry.message_id,
            ack_code,
            entry.attempt + 2,
            self.policy.max_retries + 1
        );
        self.attempt_direct(
            ctx,
            entry.message_id,
            entry.public_key,
            entry.text,
            entry.attempt + 1,
        )
        .await;
    }

    /// Device confirmed delivery. Returns `false` for codes we are not tracking.
    pub fn on_ack_received(
        &mut self,
        store: &mut MessageStore,
        ui: &UiSink,
        ack_code: AckCode,
        round_trip_ms: u64,
    ) -> bool {
        let Some(entry) = self.pending.remove(&ack_code) else {
            debug!("Ack {:08x} matches no pending send", ack_code);
            return false;
        };
        metrics::inc_direct_acked();
        metrics::observe_ack_round_trip(round_trip_ms);
        debug!(
            "DM id={} delivered (ack {:08x}, rtt {}ms, waited {:?})",
            entry.message_id,
            ack_code,
            round_trip_ms,
            entry.sent_at.elapsed()
        );
        if store.update_status(&entry.message_id, DeliveryStatus::Delivered) {
            ui.status_changed(&entry.message_id, DeliveryStatus::Delivered);
        }
        true
    }

    /// Stop tracking everything. Messages keep whatever status they reached.
    pub fn cancel_all(&mut self) {
        if !self.pending.is_empty() {
            debug!("Dropping {} pending ack timers", self.pending.len());
        }
        self.pending.clear();
    }

    fn fail(&mut self, ctx: &mut SendContext<'_>, id: &str) {
        set_status(ctx, id, DeliveryStatus::Failed);
        ctx.ui.notice(Notice::SendFailed {
            message_id: id.to_string(),
        });
    }
}

fn set_status(ctx: &mut SendContext<'_>, id: &str, status: DeliveryStatus) {
    if ctx.store.update_status(id, status) {
        ctx.ui.status_changed(id, status);
    }
}
