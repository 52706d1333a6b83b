//! Shared rig for driving a client against the simulated radio.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use meshchat::client::{ClientHandle, MeshClient, Notice, UiCommand, UiEvent};
use meshchat::config::Config;
use meshchat::models::{Contact, ContactRole, DeliveryStatus, KEY_PREFIX_LEN};
use meshchat::responder::Responder;
use meshchat::storage::MessageStore;
use meshchat::transport::sim::SimDevice;

pub fn test_config() -> Config {
    let mut cfg = Config::default();
    cfg.device.target = "sim".into();
    cfg.device.auto_connect = false;
    cfg.logging.file = None;
    cfg
}

pub fn contact(name: &str, prefix: [u8; KEY_PREFIX_LEN], role: ContactRole) -> Contact {
    let mut public_key = prefix.to_vec();
    public_key.extend_from_slice(&[0x42; 26]);
    Contact {
        name: name.into(),
        public_key,
        role,
    }
}

pub struct Rig {
    pub dev: SimDevice,
    pub client: MeshClient,
    pub handle: ClientHandle,
    pub seen: Vec<UiEvent>,
}

pub fn rig(dev: SimDevice) -> Rig {
    rig_with(test_config(), dev, None)
}

pub fn rig_with(config: Config, dev: SimDevice, responder: Option<Arc<dyn Responder>>) -> Rig {
    let (client, handle) = MeshClient::new(
        &config,
        MessageStore::in_memory(),
        Arc::new(dev.clone()),
        responder,
    );
    Rig {
        dev,
        client,
        handle,
        seen: Vec::new(),
    }
}

impl Rig {
    /// Queue a command and process exactly that command.
    pub async fn command(&mut self, cmd: UiCommand) {
        assert!(self.handle.send(cmd));
        self.client.step().await;
        self.collect();
    }

    pub async fn connect(&mut self) {
        self.command(UiCommand::Reconnect).await;
    }

    /// Step the loop until `pred` holds. Panics after a generous number of steps.
    pub async fn step_until<F>(&mut self, what: &str, pred: F)
    where
        F: Fn(&MeshClient) -> bool,
    {
        for _ in 0..500 {
            if pred(&self.client) {
                return;
            }
            self.client.step().await;
            self.collect();
        }
        panic!("condition never reached: {}", what);
    }

    /// Keep the loop running for `d` of (virtual) time.
    pub async fn run_for(&mut self, d: Duration) {
        let client = &mut self.client;
        let _ = tokio::time::timeout(d, async {
            loop {
                client.step().await;
            }
        })
        .await;
        self.collect();
    }

    /// Wait for the connect-time sync pass to drain the mailbox.
    pub async fn settle(&mut self) {
        let dev = self.dev.clone();
        self.step_until("mailbox drained", move |c| {
            !c.sync_in_flight() && dev.mailbox_len() == 0
        })
        .await;
    }

    pub fn collect(&mut self) {
        while let Ok(ev) = self.handle.events.try_recv() {
            self.seen.push(ev);
        }
    }

    pub fn notices(&self) -> Vec<Notice> {
        self.seen
            .iter()
            .filter_map(|e| match e {
                UiEvent::Notice(n) => Some(n.clone()),
                _ => None,
            })
            .collect()
    }

    /// Every status the message passed through, in order.
    pub fn status_trail(&self, id: &str) -> Vec<DeliveryStatus> {
        self.seen
            .iter()
            .filter_map(|e| match e {
                UiEvent::MessageAdded(m) if m.id == id => m.delivery_status,
                UiEvent::MessageStatusChanged { id: i, status } if i == id => Some(*status),
                _ => None,
            })
            .collect()
    }

    pub fn status(&self, id: &str) -> Option<DeliveryStatus> {
        self.client.store().get(id).and_then(|m| m.delivery_status)
    }

    pub fn last_outgoing_id(&self) -> String {
        self.client
            .store()
            .messages()
            .iter()
            .rev()
            .find(|m| m.outgoing)
            .map(|m| m.id.clone())
            .expect("no outgoing message stored")
    }
}
