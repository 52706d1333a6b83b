//! # Connection Supervisor
//!
//! Owns the single link to the companion radio.
//!
//! ## States
//!
//! `Disconnected -> Connecting -> Connected`, and back to `Disconnected` on a
//! failed attempt, a surprise drop, or an explicit disconnect.
//!
//! ## Reconnect policy
//!
//! After a failed attempt the supervisor arms one retry timer with delay
//! `min(base * 2^attempt, cap)` (2s, 4s, 8s, 16s, 30s, 30s, ... by default) and
//! a one-second countdown for display. The attempt counter goes back to zero on
//! any successful connect and on a surprise drop of an established link, so a
//! flapping radio always starts again at the base delay. An explicit
//! disconnect cancels everything and does not reconnect.
//!
//! ## Device snapshot
//!
//! Self info, contacts and channels are fetched fresh on every connect and
//! replace the previous snapshot wholesale. Failing to enumerate channels is
//! not fatal: the snapshot falls back to the public channel alone.

use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::client::events::CoreEvent;
use crate::client::timers::{self, TimerHandle};
use crate::logutil::preview;
use crate::metrics;
use crate::models::{ChannelInfo, Contact, SelfInfo};
use crate::transport::{Connector, EventSink, Radio, SessionEvent, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(2000),
            cap: Duration::from_millis(30000),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map(|d| d.min(self.cap))
            .unwrap_or(self.cap)
    }
}

/// Contacts, channels and identity read from the device on connect.
#[derive(Debug, Clone, Default)]
pub struct DeviceSnapshot {
    pub self_info: Option<SelfInfo>,
    pub contacts: Vec<Contact>,
    pub channels: Vec<ChannelInfo>,
    /// Channel enumeration failed and `channels` is the fallback.
    pub channels_fallback: bool,
}

impl DeviceSnapshot {
    /// First contact whose key starts with `prefix`.
    pub fn contact_by_prefix(&self, prefix: &[u8]) -> Option<&Contact> {
        self.contacts.iter().find(|c| c.matches_prefix(prefix))
    }

    pub fn contact_by_name(&self, name: &str) -> Option<&Contact> {
        self.contacts.iter().find(|c| c.name == name)
    }

    pub fn channel_name(&self, index: u8) -> String {
        self.channels
            .iter()
            .find(|c| c.index == index)
            .map(|c| c.name.clone())
            .unwrap_or_else(|| ChannelInfo::fallback_name(index))
    }

    pub fn self_name(&self) -> Option<String> {
        self.self_info
            .as_ref()
            .map(|s| s.name.clone())
            .filter(|n| !n.is_empty())
    }
}

/// What a link event meant for the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkChange {
    /// Event from a link that has since been replaced; dropped.
    Stale,
    /// Current link went away unexpectedly; a reconnect is scheduled.
    Lost { retry_in: Duration },
    /// Nothing changed for the supervisor; the caller handles the event.
    Passthrough,
}

pub struct ConnectionSupervisor {
    connector: Arc<dyn Connector>,
    target: String,
    connect_timeout: Duration,
    backoff: BackoffPolicy,
    state: ConnectionState,
    attempt: u32,
    link: Option<Arc<dyn Radio>>,
    /// Link replaced by an in-progress connect; closed before the new attempt.
    retiring: Option<Arc<dyn Radio>>,
    session: u64,
    link_tx: mpsc::UnboundedSender<SessionEvent>,
    timer_tx: mpsc::UnboundedSender<CoreEvent>,
    retry_generation: u64,
    retry_timer: Option<TimerHandle>,
    countdown_timer: Option<TimerHandle>,
    retry_in_secs: Option<u32>,
    snapshot: DeviceSnapshot,
}

impl ConnectionSupervisor {
    pub fn new(
        connector: Arc<dyn Connector>,
        target: String,
        connect_timeout: Duration,
        backoff: BackoffPolicy,
        link_tx: mpsc::UnboundedSender<SessionEvent>,
        timer_tx: mpsc::UnboundedSender<CoreEvent>,
    ) -> Self {
        Self {
            connector,
            target,
            connect_timeout,
            backoff,
            state: ConnectionState::Disconnected,
            attempt: 0,
            link: None,
            retiring: None,
            session: 0,
            link_tx,
            timer_tx,
            retry_generation: 0,
            retry_timer: None,
            countdown_timer: None,
            retry_in_secs: None,
            snapshot: DeviceSnapshot::default(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn retry_in_secs(&self) -> Option<u32> {
        self.retry_in_secs
    }

    pub fn retry_pending(&self) -> bool {
        self.retry_timer.is_some()
    }

    pub fn snapshot(&self) -> &DeviceSnapshot {
        &self.snapshot
    }

    /// The open link, if connected.
    pub fn radio(&self) -> Option<Arc<dyn Radio>> {
        match self.state {
            ConnectionState::Connected => self.link.clone(),
            _ => None,
        }
    }

    pub fn is_current(&self, session: u64) -> bool {
        session == self.session
    }

    /// Point the supervisor at a new target. The attempt counter restarts.
    pub fn set_target(&mut self, target: String) {
        if target != self.target {
            info!("Connect target changed: {} -> {}", self.target, target);
            self.target = target;
        }
        self.attempt = 0;
    }

    /// First half of a connect: cancel pending retries, retire the current
    /// link and enter `Connecting`. Split from [`Self::finish_connect`] so the
    /// caller can publish the intermediate state.
    pub fn begin_connect(&mut self) {
        self.cancel_retry();
        if let Some(old) = self.link.take() {
            self.retiring = Some(old);
        }
        self.session += 1;
        self.state = ConnectionState::Connecting;
        debug!(
            "Connecting to {} (session {}, attempt {})",
            self.target, self.session, self.attempt
        );
    }

    /// Second half of a connect. On failure a retry is already scheduled when
    /// this returns.
    pub async fn finish_connect(&mut self) -> Result<(), TransportError> {
        if let Some(old) = self.retiring.take() {
            old.close().await;
        }
        let sink = EventSink::new(self.session, self.link_tx.clone());
        let attempt = tokio::time::timeout(
            self.connect_timeout,
            self.connector
                .connect(&self.target, self.connect_timeout, sink),
        )
        .await;
        let result = match attempt {
            Ok(r) => r,
            Err(_) => Err(TransportError::ConnectTimeout {
                target: self.target.clone(),
                after: self.connect_timeout,
            }),
        };
        match result {
            Ok(radio) => {
                self.link = Some(radio.clone());
                self.state = ConnectionState::Connected;
                self.attempt = 0;
                self.refresh_snapshot(&*radio).await;
                info!(
                    "Connected to {} ({} contacts, {} channels)",
                    self.target,
                    self.snapshot.contacts.len(),
                    self.snapshot.channels.len()
                );
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                warn!("Connect to {} failed: {}", self.target, e);
                self.schedule_retry();
                Err(e)
            }
        }
    }

    pub async fn connect(&mut self) -> Result<(), TransportError> {
        self.begin_connect();
        self.finish_connect().await
    }

    async fn refresh_snapshot(&mut self, radio: &dyn Radio) {
        let self_info = match radio.self_info().await {
            Ok(info) => Some(info),
            Err(e) => {
                warn!("Failed to read device identity: {}", e);
                None
            }
        };
        let contacts = match radio.contacts().await {
            Ok(c) => c,
            Err(e) => {
                warn!("Failed to read contacts: {}", e);
                Vec::new()
            }
        };
        let (channels, channels_fallback) = match radio.channels().await {
            Ok(ch) if !ch.is_empty() => (ch, false),
            Ok(_) => {
                warn!("Device reported no channels; using Public");
                (vec![ChannelInfo::public()], true)
            }
            Err(e) => {
                warn!("Failed to read channels ({}); using Public", e);
                (vec![ChannelInfo::public()], true)
            }
        };
        for c in &contacts {
            debug!("contact '{}' {:?}", preview(&c.name, 32), c.role);
        }
        self.snapshot = DeviceSnapshot {
            self_info,
            contacts,
            channels,
            channels_fallback,
        };
    }

    /// Arm the next retry and return its delay.
    fn schedule_retry(&mut self) -> Duration {
        self.cancel_retry();
        let delay = self.backoff.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        let generation = self.retry_generation;
        self.retry_timer = Some(timers::after(
            delay,
            self.timer_tx.clone(),
            CoreEvent::ReconnectDue { generation },
        ));
        self.countdown_timer = Some(timers::every(
            Duration::from_secs(1),
            self.timer_tx.clone(),
            move || CoreEvent::CountdownTick { generation },
        ));
        self.retry_in_secs = Some(delay.as_millis().div_ceil(1000) as u32);
        info!(
            "Reconnect attempt {} scheduled in {:?}",
            self.attempt, delay
        );
        delay
    }

    /// Drop the retry timer and countdown. Already-queued events from them
    /// become stale.
    pub fn cancel_retry(&mut self) {
        self.retry_generation += 1;
        if let Some(t) = self.retry_timer.take() {
            t.cancel();
        }
        if let Some(t) = self.countdown_timer.take() {
            t.cancel();
        }
        self.retry_in_secs = None;
    }

    /// One countdown second elapsed. Returns `true` if the display value changed.
    pub fn on_countdown_tick(&mut self, generation: u64) -> bool {
        if generation != self.retry_generation {
            return false;
        }
        match self.retry_in_secs {
            Some(secs) if secs > 0 => {
                self.retry_in_secs = Some(secs - 1);
                true
            }
            _ => false,
        }
    }

    /// Retry timer fired. Returns `true` if the caller should connect now.
    pub fn on_reconnect_due(&mut self, generation: u64) -> bool {
        if generation != self.retry_generation || self.retry_timer.is_none() {
            debug!("Ignoring stale reconnect timer (generation {})", generation);
            return false;
        }
        self.retry_timer = None;
        if let Some(t) = self.countdown_timer.take() {
            t.cancel();
        }
        self.retry_in_secs = None;
        metrics::inc_reconnect_attempts();
        true
    }

    /// Classify a session-tagged event from the transport.
    pub async fn on_link_event(&mut self, event: &SessionEvent) -> LinkChange {
        if !self.is_current(event.session) {
            debug!(
                "Dropping event from stale session {} (current {}): {:?}",
                event.session, self.session, event.event
            );
            return LinkChange::Stale;
        }
        match &event.event {
            crate::transport::TransportEvent::Disconnected { reason } => {
                if self.state != ConnectionState::Connected {
                    return LinkChange::Passthrough;
                }
                warn!(
                    "Link to {} lost{}",
                    self.target,
                    reason
                        .as_deref()
                        .map(|r| format!(": {}", r))
                        .unwrap_or_default()
                );
                if let Some(link) = self.link.take() {
                    link.close().await;
                }
                self.session += 1;
                self.state = ConnectionState::Disconnected;
                self.attempt = 0;
                let retry_in = self.schedule_retry();
                LinkChange::Lost { retry_in }
            }
            _ => LinkChange::Passthrough,
        }
    }

    /// User-requested disconnect: no reconnect follows.
    pub async fn disconnect(&mut self) {
        self.cancel_retry();
        self.session += 1;
        if let Some(link) = self.link.take() {
            link.close().await;
        }
        if let Some(old) = self.retiring.take() {
            old.close().await;
        }
        if self.state != ConnectionState::Disconnected {
            info!("Disconnected from {}", self.target);
        }
        self.state = ConnectionState::Disconnected;
    }
}
