//! In-process companion radio.
//!
//! [`SimDevice`] is both the [`Connector`] and the script controlling what the
//! links it opens do: which connects fail, what sits in the mailbox, which
//! sends are rejected, and when acks and pushes arrive. Every link it hands
//! out shares the device state, and only the most recently opened link is live.

use async_trait::async_trait;
use log::debug;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{
    AckCode, Connector, EventSink, InboundRecord, PushKind, Radio, SendReceipt, TransportError,
    TransportEvent,
};
use crate::models::{ChannelInfo, Contact, ContactRole, SelfInfo, KEY_PREFIX_LEN};

/// A frame the device was asked to transmit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentFrame {
    Channel {
        channel_index: u8,
        text: String,
    },
    Direct {
        public_key: Vec<u8>,
        text: String,
        ack: AckCode,
    },
}

struct SimState {
    self_info: SelfInfo,
    contacts: Vec<Contact>,
    channels: Vec<ChannelInfo>,
    channels_fail: bool,
    /// `Err` entries stand in for frames that fail to decode.
    mailbox: VecDeque<Result<InboundRecord, String>>,
    pull_delay: Option<Duration>,
    pulls: u32,
    connect_failures: u32,
    connect_hang: bool,
    connect_targets: Vec<String>,
    send_failures: u32,
    next_ack: AckCode,
    estimated_timeout_ms: u64,
    auto_ack: Option<Duration>,
    echo_direct: bool,
    sent: Vec<SentFrame>,
    closes: u32,
    link_id: u64,
    link_open: bool,
    sink: Option<EventSink>,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            self_info: SelfInfo {
                name: "sim-node".to_string(),
                public_key: vec![0x5e, 0x1f, 0x00, 0x00, 0x00, 0x01],
            },
            contacts: Vec::new(),
            channels: vec![ChannelInfo::public()],
            channels_fail: false,
            mailbox: VecDeque::new(),
            pull_delay: None,
            pulls: 0,
            connect_failures: 0,
            connect_hang: false,
            connect_targets: Vec::new(),
            send_failures: 0,
            next_ack: 0x1000,
            estimated_timeout_ms: 4000,
            auto_ack: None,
            echo_direct: false,
            sent: Vec::new(),
            closes: 0,
            link_id: 0,
            link_open: false,
            sink: None,
        }
    }
}

#[derive(Clone, Default)]
pub struct SimDevice {
    state: Arc<Mutex<SimState>>,
}

impl SimDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// A device with a few contacts and channels that confirms direct sends
    /// after a short delay and echoes them back as inbound mail.
    pub fn demo() -> Self {
        let dev = Self::new();
        dev.set_self_info(SelfInfo {
            name: "meshchat-sim".to_string(),
            public_key: vec![0x5e, 0x1f, 0x00, 0x00, 0x00, 0x01, 0x02, 0x03],
        });
        dev.set_contacts(vec![
            contact("alice", [0xa1, 0xb2, 0xc3, 0xd4, 0xe5, 0xf6], ContactRole::Chat),
            contact("bob", [0xb0, 0xb0, 0x00, 0x11, 0x22, 0x33], ContactRole::Chat),
            contact("hilltop", [0x7e, 0x7e, 0x01, 0x02, 0x03, 0x04], ContactRole::Repeater),
        ]);
        dev.set_channels(vec![
            ChannelInfo::public(),
            ChannelInfo {
                index: 1,
                name: "ops".to_string(),
            },
        ]);
        dev.queue_inbound(InboundRecord::Channel {
            channel_index: 0,
            sender_name: Some("bob".to_string()),
            sender_prefix: None,
            text: "anyone on tonight?".to_string(),
            timestamp_secs: None,
        });
        dev.queue_inbound(InboundRecord::Direct {
            sender_prefix: [0xa1, 0xb2, 0xc3, 0xd4, 0xe5, 0xf6],
            text: "ping me when you're up".to_string(),
            timestamp_secs: None,
        });
        dev.set_auto_ack(Some(Duration::from_millis(1500)));
        dev.set_echo_direct(true);
        dev
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn set_self_info(&self, info: SelfInfo) {
        self.lock().self_info = info;
    }

    pub fn set_contacts(&self, contacts: Vec<Contact>) {
        self.lock().contacts = contacts;
    }

    pub fn set_channels(&self, channels: Vec<ChannelInfo>) {
        self.lock().channels = channels;
    }

    /// Make channel enumeration fail until reset.
    pub fn fail_channels(&self, fail: bool) {
        self.lock().channels_fail = fail;
    }

    pub fn fail_next_connects(&self, n: u32) {
        self.lock().connect_failures = n;
    }

    /// Connect attempts never complete on their own.
    pub fn hang_connects(&self, hang: bool) {
        self.lock().connect_hang = hang;
    }

    pub fn fail_next_sends(&self, n: u32) {
        self.lock().send_failures = n;
    }

    pub fn set_estimated_timeout_ms(&self, ms: u64) {
        self.lock().estimated_timeout_ms = ms;
    }

    /// Confirm every direct send after `delay`. `None` leaves acks to [`SimDevice::confirm`].
    pub fn set_auto_ack(&self, delay: Option<Duration>) {
        self.lock().auto_ack = delay;
    }

    pub fn set_echo_direct(&self, echo: bool) {
        self.lock().echo_direct = echo;
    }

    /// Delay applied to every mailbox pull.
    pub fn set_pull_delay(&self, delay: Option<Duration>) {
        self.lock().pull_delay = delay;
    }

    pub fn queue_inbound(&self, record: InboundRecord) {
        self.lock().mailbox.push_back(Ok(record));
    }

    pub fn queue_malformed(&self, what: &str) {
        self.lock().mailbox.push_back(Err(what.to_string()));
    }

    /// Emit a push notification on the live link.
    pub fn push(&self, kind: PushKind) -> bool {
        self.emit(TransportEvent::Push(kind))
    }

    /// Confirm a direct send on the live link.
    pub fn confirm(&self, ack_code: AckCode, round_trip_ms: u64) -> bool {
        self.emit(TransportEvent::SendConfirmed {
            ack_code,
            round_trip_ms,
        })
    }

    /// Drop the live link as if the radio went out of range.
    pub fn drop_link(&self) -> bool {
        let sink = {
            let mut st = self.lock();
            st.link_open = false;
            st.sink.take()
        };
        match sink {
            Some(sink) => sink.emit(TransportEvent::Disconnected {
                reason: Some("link lost".to_string()),
            }),
            None => false,
        }
    }

    fn emit(&self, event: TransportEvent) -> bool {
        let sink = self.lock().sink.clone();
        sink.map(|s| s.emit(event)).unwrap_or(false)
    }

    pub fn sent(&self) -> Vec<SentFrame> {
        self.lock().sent.clone()
    }

    pub fn connect_targets(&self) -> Vec<String> {
        self.lock().connect_targets.clone()
    }

    pub fn closes(&self) -> u32 {
        self.lock().closes
    }

    pub fn pulls(&self) -> u32 {
        self.lock().pulls
    }

    pub fn mailbox_len(&self) -> usize {
        self.lock().mailbox.len()
    }

    pub fn is_link_open(&self) -> bool {
        self.lock().link_open
    }
}

fn contact(name: &str, prefix: [u8; KEY_PREFIX_LEN], role: ContactRole) -> Contact {
    let mut public_key = prefix.to_vec();
    public_key.extend_from_slice(&[0u8; 26]);
    Contact {
        name: name.to_string(),
        public_key,
        role,
    }
}

#[async_trait]
impl Connector for SimDevice {
    async fn connect(
        &self,
        target: &str,
        timeout: Duration,
        events: EventSink,
    ) -> Result<Arc<dyn Radio>, TransportError> {
        let hang = {
            let mut st = self.lock();
            st.connect_targets.push(target.to_string());
            st.connect_hang
        };
        if hang {
            tokio::time::sleep(timeout).await;
            return Err(TransportError::ConnectTimeout {
                target: target.to_string(),
                after: timeout,
            });
        }

        let link_id = {
            let mut st = self.lock();
            if st.connect_failures > 0 {
                st.connect_failures -= 1;
                return Err(TransportError::Unreachable(target.to_string()));
            }
            st.link_id += 1;
            st.link_open = true;
            st.sink = Some(events.clone());
            st.link_id
        };
        debug!("sim: link {} open to {}", link_id, target);
        events.emit(TransportEvent::Connected);
        Ok(Arc::new(SimLink {
            device: self.clone(),
            link_id,
        }))
    }
}

struct SimLink {
    device: SimDevice,
    link_id: u64,
}

impl SimLink {
    fn live(&self) -> Result<MutexGuard<'_, SimState>, TransportError> {
        let st = self.device.lock();
        if st.link_open && st.link_id == self.link_id {
            Ok(st)
        } else {
            Err(TransportError::NotConnected)
        }
    }
}

#[async_trait]
impl Radio for SimLink {
    async fn self_info(&self) -> Result<SelfInfo, TransportError> {
        Ok(self.live()?.self_info.clone())
    }

    async fn contacts(&self) -> Result<Vec<Contact>, TransportError> {
        Ok(self.live()?.contacts.clone())
    }

    async fn channels(&self) -> Result<Vec<ChannelInfo>, TransportError> {
        let st = self.live()?;
        if st.channels_fail {
            return Err(TransportError::Rejected("channel query unsupported".into()));
        }
        Ok(st.channels.clone())
    }

    async fn sync_next_message(&self) -> Result<Option<InboundRecord>, TransportError> {
        let delay = self.live()?.pull_delay;
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        let mut st = self.live()?;
        st.pulls += 1;
        match st.mailbox.pop_front() {
            None => Ok(None),
            Some(Ok(record)) => Ok(Some(record)),
            Some(Err(what)) => Err(TransportError::Protocol(what)),
        }
    }

    async fn send_channel_text(
        &self,
        channel_index: u8,
        text: &str,
    ) -> Result<(), TransportError> {
        let mut st = self.live()?;
        if st.send_failures > 0 {
            st.send_failures -= 1;
            return Err(TransportError::Rejected("transmit queue full".into()));
        }
        st.sent.push(SentFrame::Channel {
            channel_index,
            text: text.to_string(),
        });
        Ok(())
    }

    async fn send_text(&self, public_key: &[u8], text: &str) -> Result<SendReceipt, TransportError> {
        let (receipt, auto_ack, sink) = {
            let mut st = self.live()?;
            if st.send_failures > 0 {
                st.send_failures -= 1;
                return Err(TransportError::Rejected("transmit queue full".into()));
            }
            let ack = st.next_ack;
            st.next_ack = st.next_ack.wrapping_add(1);
            st.sent.push(SentFrame::Direct {
                public_key: public_key.to_vec(),
                text: text.to_string(),
                ack,
            });
            if st.echo_direct && public_key.len() >= KEY_PREFIX_LEN {
                let mut prefix = [0u8; KEY_PREFIX_LEN];
                prefix.copy_from_slice(&public_key[..KEY_PREFIX_LEN]);
                st.mailbox.push_back(Ok(InboundRecord::Direct {
                    sender_prefix: prefix,
                    text: format!("echo: {}", text),
                    timestamp_secs: None,
                }));
            }
            let receipt = SendReceipt {
                expected_ack: ack,
                estimated_timeout_ms: st.estimated_timeout_ms,
            };
            let sink = if st.echo_direct || st.auto_ack.is_some() {
                st.sink.clone()
            } else {
                None
            };
            (receipt, st.auto_ack, sink)
        };

        if let Some(sink) = sink {
            let echo = self.device.lock().echo_direct;
            tokio::spawn(async move {
                if let Some(delay) = auto_ack {
                    tokio::time::sleep(delay).await;
                    sink.emit(TransportEvent::SendConfirmed {
                        ack_code: receipt.expected_ack,
                        round_trip_ms: delay.as_millis() as u64,
                    });
                }
                if echo {
                    sink.emit(TransportEvent::Push(PushKind::MessagesWaiting));
                }
            });
        }
        Ok(receipt)
    }

    async fn close(&self) {
        let mut st = self.device.lock();
        if st.link_id == self.link_id && st.link_open {
            st.link_open = false;
            st.sink = None;
        }
        st.closes += 1;
    }
}
