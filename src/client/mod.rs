//! # Client Core
//!
//! [`MeshClient`] owns the store, delivery tracker, connection supervisor,
//! inbound sync and unread index, and drives them from one dispatch loop.
//! Nothing in here is shared across tasks; the loop is the only mutator.
//!
//! ## Inputs
//!
//! The loop selects over three queues:
//!
//! - UI commands from a [`ClientHandle`]
//! - session-tagged transport events from the current link
//! - [`CoreEvent`]s: timer expiries, streamed mailbox records, auto-replies
//!
//! Transport events from a replaced link and timer events from a cancelled
//! timer carry generations that no longer match and are dropped.
//!
//! ## Outputs
//!
//! [`UiEvent`]s on the handle's receiver: full [`StateSnapshot`]s whenever
//! connection, snapshot, selection or unread counts change, plus incremental
//! message and status events.

pub mod events;
pub mod timers;

use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::{Config, ResponderConfig};
use crate::delivery::{DeliveryTracker, Recipient, SendContext, SendOutcome};
use crate::metrics;
use crate::models::{ConversationSelector, Message};
use crate::responder::{wants_reply, ReplyRequest, Responder};
use crate::storage::{AppendOutcome, MessageStore};
use crate::supervisor::{ConnectionState, ConnectionSupervisor, LinkChange};
use crate::sync::{classify, deliver_inbound, InboundSync, SyncTrigger};
use crate::transport::{Connector, PushKind, SessionEvent, TransportEvent};
use crate::unread::UnreadIndex;
use crate::validation::{validate_outbound_text, InputError};

pub use events::{CoreEvent, Notice, StateSnapshot, UiCommand, UiEvent, UiSink};
use timers::TimerHandle;

/// Front-end side of a running client.
pub struct ClientHandle {
    commands: mpsc::UnboundedSender<UiCommand>,
    pub events: mpsc::UnboundedReceiver<UiEvent>,
}

impl ClientHandle {
    /// Queue a command. Returns `false` once the client loop has exited.
    pub fn send(&self, command: UiCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn commander(&self) -> mpsc::UnboundedSender<UiCommand> {
        self.commands.clone()
    }
}

pub struct MeshClient {
    store: MessageStore,
    tracker: DeliveryTracker,
    supervisor: ConnectionSupervisor,
    sync: InboundSync,
    unread: UnreadIndex,
    responder: Option<Arc<dyn Responder>>,
    responder_config: ResponderConfig,
    max_message_bytes: usize,
    poll_interval: std::time::Duration,
    auto_connect: bool,
    poll_timer: Option<TimerHandle>,
    ui: UiSink,
    core_tx: mpsc::UnboundedSender<CoreEvent>,
    core_rx: mpsc::UnboundedReceiver<CoreEvent>,
    link_rx: mpsc::UnboundedReceiver<SessionEvent>,
    commands_rx: mpsc::UnboundedReceiver<UiCommand>,
    commands_closed: bool,
}

impl MeshClient {
    pub fn new(
        config: &Config,
        store: MessageStore,
        connector: Arc<dyn Connector>,
        responder: Option<Arc<dyn Responder>>,
    ) -> (Self, ClientHandle) {
        let (core_tx, core_rx) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (ui_tx, ui_rx) = mpsc::unbounded_channel();

        let supervisor = ConnectionSupervisor::new(
            connector,
            config.device.target.clone(),
            config.connect_timeout(),
            config.backoff_policy(),
            link_tx,
            core_tx.clone(),
        );
        let client = MeshClient {
            store,
            tracker: DeliveryTracker::new(config.delivery_policy(), core_tx.clone()),
            supervisor,
            sync: InboundSync::new(),
            unread: UnreadIndex::new(),
            responder,
            responder_config: config.responder.clone(),
            max_message_bytes: config.max_message_bytes(),
            poll_interval: config.poll_interval(),
            auto_connect: config.device.auto_connect,
            poll_timer: None,
            ui: UiSink::new(ui_tx),
            core_tx,
            core_rx,
            link_rx,
            commands_rx,
            commands_closed: false,
        };
        let handle = ClientHandle {
            commands: commands_tx,
            events: ui_rx,
        };
        (client, handle)
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn unread(&self) -> &UnreadIndex {
        &self.unread
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.supervisor
    }

    pub fn tracker(&self) -> &DeliveryTracker {
        &self.tracker
    }

    pub fn sync_in_flight(&self) -> bool {
        self.sync.in_flight()
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let device = self.supervisor.snapshot();
        StateSnapshot {
            connection: self.supervisor.state(),
            target: self.supervisor.target().to_string(),
            retry_in_secs: self.supervisor.retry_in_secs(),
            self_info: device.self_info.clone(),
            contacts: device.contacts.clone(),
            channels: device.channels.clone(),
            selected: self.unread.selected().cloned(),
            unread: self.unread.entries(),
            messages: self.store.messages().to_vec(),
        }
    }

    fn publish_state(&self) {
        self.ui.emit(UiEvent::StateChanged(Box::new(self.snapshot())));
    }

    /// Run until shutdown. Connects first when the config asks for it.
    pub async fn run(mut self) {
        info!(
            "Client starting ({} cached messages, target '{}')",
            self.store.len(),
            self.supervisor.target()
        );
        self.publish_state();
        if self.auto_connect && !self.supervisor.target().is_empty() {
            self.connect().await;
        }
        while self.step().await {}
        self.shutdown().await;
    }

    /// Process one event from any input. Returns `false` once shutdown was requested.
    pub async fn step(&mut self) -> bool {
        // UI commands first, then link events, then internal events
        tokio::select! {
            biased;
            cmd = self.commands_rx.recv(), if !self.commands_closed => match cmd {
                Some(cmd) => self.handle_command(cmd).await,
                None => {
                    debug!("UI command channel closed");
                    self.commands_closed = true;
                    true
                }
            },
            Some(ev) = self.link_rx.recv() => {
                self.handle_link_event(ev).await;
                true
            }
            Some(ev) = self.core_rx.recv() => {
                self.handle_core_event(ev).await;
                true
            }
            else => false,
        }
    }

    async fn shutdown(&mut self) {
        self.stop_polling();
        self.sync.abort();
        self.tracker.cancel_all();
        self.supervisor.disconnect().await;
        if let Err(e) = self.store.persist() {
            warn!("Final cache write failed: {}", e);
        }
        let m = metrics::snapshot();
        info!(
            "Client stopped: dm sent={} acked={} failed={} retries={} channel sent={} failed={} inbound={} dup={} reconnects={}",
            m.direct_sent,
            m.direct_acked,
            m.direct_failed,
            m.direct_retries,
            m.channel_sent,
            m.channel_failed,
            m.inbound_received,
            m.duplicates_rejected,
            m.reconnect_attempts
        );
    }

    async fn handle_command(&mut self, cmd: UiCommand) -> bool {
        match cmd {
            UiCommand::SendMessage { conversation, text } => {
                self.send_message(conversation, text, false).await;
            }
            UiCommand::SelectConversation(conversation) => {
                self.unread.select(conversation);
                self.publish_state();
            }
            UiCommand::Reconnect => self.connect().await,
            UiCommand::ConnectTo(target) => {
                self.supervisor.set_target(target);
                self.connect().await;
            }
            UiCommand::Disconnect => {
                self.stop_polling();
                self.sync.abort();
                self.tracker.cancel_all();
                self.supervisor.disconnect().await;
                self.publish_state();
            }
            UiCommand::Shutdown => return false,
        }
        true
    }

    async fn connect(&mut self) {
        self.stop_polling();
        self.sync.abort();
        self.supervisor.begin_connect();
        self.publish_state();
        match self.supervisor.finish_connect().await {
            Ok(()) => {
                let device = self.supervisor.snapshot();
                self.ui.notice(Notice::Connected {
                    device_name: device.self_name(),
                });
                if device.channels_fallback {
                    self.ui.notice(Notice::ChannelsUnavailable);
                }
                self.start_polling();
                self.trigger_sync(SyncTrigger::Connect);
            }
            Err(e) => {
                self.ui.notice(Notice::ConnectFailed {
                    reason: e.to_string(),
                });
                self.notify_retry();
            }
        }
        self.publish_state();
    }

    fn notify_retry(&self) {
        if let Some(secs) = self.supervisor.retry_in_secs() {
            self.ui.notice(Notice::ReconnectScheduled {
                attempt: self.supervisor.attempt(),
                delay_ms: u64::from(secs) * 1000,
            });
        }
    }

    fn start_polling(&mut self) {
        self.poll_timer = Some(timers::every(
            self.poll_interval,
            self.core_tx.clone(),
            || CoreEvent::PollTick,
        ));
    }

    fn stop_polling(&mut self) {
        if let Some(t) = self.poll_timer.take() {
            t.cancel();
        }
    }

    fn trigger_sync(&mut self, reason: SyncTrigger) {
        let Some(radio) = self.supervisor.radio() else {
            debug!("Sync trigger {:?} ignored while disconnected", reason);
            return;
        };
        self.sync.trigger(radio, self.core_tx.clone(), reason);
    }

    async fn handle_link_event(&mut self, ev: SessionEvent) {
        match self.supervisor.on_link_event(&ev).await {
            LinkChange::Stale => return,
            LinkChange::Lost { .. } => {
                self.stop_polling();
                self.sync.abort();
                self.ui.notice(Notice::ConnectionLost);
                self.notify_retry();
                self.publish_state();
                return;
            }
            LinkChange::Passthrough => {}
        }
        match ev.event {
            TransportEvent::Connected => debug!("Link session {} up", ev.session),
            TransportEvent::Disconnected { .. } => {}
            TransportEvent::Push(PushKind::MessagesWaiting) => {
                self.trigger_sync(SyncTrigger::Push)
            }
            TransportEvent::Push(kind) => debug!("Push {:?} ignored", kind),
            TransportEvent::SendConfirmed {
                ack_code,
                round_trip_ms,
            } => {
                self.tracker
                    .on_ack_received(&mut self.store, &self.ui, ack_code, round_trip_ms);
            }
        }
    }

    async fn handle_core_event(&mut self, ev: CoreEvent) {
        match ev {
            CoreEvent::AckTimeout { ack_code, timer_id } => {
                let mut ctx = SendContext {
                    radio: self.supervisor.radio(),
                    store: &mut self.store,
                    ui: &self.ui,
                };
                self.tracker.on_ack_timeout(&mut ctx, ack_code, timer_id).await;
            }
            CoreEvent::ReconnectDue { generation } => {
                if self.supervisor.on_reconnect_due(generation) {
                    self.connect().await;
                }
            }
            CoreEvent::CountdownTick { generation } => {
                if self.supervisor.on_countdown_tick(generation) {
                    self.publish_state();
                }
            }
            CoreEvent::PollTick => {
                if self.supervisor.state() == ConnectionState::Connected {
                    self.trigger_sync(SyncTrigger::Poll);
                }
            }
            CoreEvent::SyncRecord { pass, record } => {
                // The device already dropped this record from its mailbox, so
                // it is stored even when its pass was abandoned.
                let current = self.sync.is_current(pass);
                if !current {
                    debug!("Storing record pulled by abandoned sync pass {}", pass);
                }
                let message = classify(record, self.supervisor.snapshot());
                let reply = wants_reply(&message, &self.responder_config);
                if deliver_inbound(message, &mut self.store, &mut self.unread, &self.ui)
                    == AppendOutcome::Accepted
                {
                    if current {
                        self.sync.note_accepted();
                    } else {
                        self.publish_state();
                    }
                    if let Some(request) = reply {
                        self.spawn_reply(request);
                    }
                }
            }
            CoreEvent::SyncFinished { pass, pulled } => {
                if let Some(accepted) = self.sync.finish(pass, pulled) {
                    if accepted > 0 {
                        self.publish_state();
                    }
                }
            }
            CoreEvent::AutoReply { conversation, text } => {
                self.send_message(conversation, text, true).await;
            }
        }
    }

    fn spawn_reply(&self, request: ReplyRequest) {
        let Some(responder) = self.responder.clone() else {
            return;
        };
        let tx = self.core_tx.clone();
        tokio::spawn(async move {
            if let Some(text) = responder.respond(&request).await {
                let _ = tx.send(CoreEvent::AutoReply {
                    conversation: request.conversation,
                    text,
                });
            }
        });
    }

    /// Validate and submit an outgoing message. Rejections surface as notices
    /// and never reach the radio.
    pub async fn send_message(
        &mut self,
        conversation: ConversationSelector,
        text: String,
        automated: bool,
    ) -> Option<String> {
        match self.prepare_send(&conversation, &text) {
            Ok((recipient, sender)) => {
                let mut message = Message::outgoing(&conversation, sender, &text);
                message.is_automated_reply = automated;
                let id = message.id.clone();
                let mut ctx = SendContext {
                    radio: self.supervisor.radio(),
                    store: &mut self.store,
                    ui: &self.ui,
                };
                match self.tracker.send(&mut ctx, message, recipient).await {
                    SendOutcome::Submitted => Some(id),
                    SendOutcome::Duplicate => {
                        self.ui.notice(Notice::Rejected(InputError::Duplicate));
                        None
                    }
                }
            }
            Err(e) => {
                debug!("Send to {} rejected: {}", conversation, e);
                self.ui.notice(Notice::Rejected(e));
                None
            }
        }
    }

    fn prepare_send(
        &self,
        conversation: &ConversationSelector,
        text: &str,
    ) -> Result<(Recipient, Option<String>), InputError> {
        validate_outbound_text(text, self.max_message_bytes)?;
        if self.supervisor.radio().is_none() {
            return Err(InputError::NotConnected);
        }
        let device = self.supervisor.snapshot();
        let recipient = match conversation {
            ConversationSelector::Channel(index) => Recipient::Channel(*index),
            ConversationSelector::Direct(name) => {
                let contact = device
                    .contact_by_name(name)
                    .ok_or_else(|| InputError::UnknownPeer(name.clone()))?;
                if !contact.role.accepts_text() {
                    return Err(InputError::NotChatCapable(name.clone()));
                }
                Recipient::Direct {
                    public_key: contact.public_key.clone(),
                }
            }
        };
        Ok((recipient, device.self_name()))
    }
}
