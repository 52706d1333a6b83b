//! # Meshchat - Delivery Core for a Mesh Radio Chat Client
//!
//! Meshchat keeps one resilient link to a companion radio on a packet-radio
//! mesh and turns it into a deduplicated, persisted conversation log with
//! tracked delivery state.
//!
//! ## Features
//!
//! - **Message Store**: content-deduplicated, append-only JSON log written atomically on every change.
//! - **Delivery Tracking**: direct messages go `Sending -> Sent -> Delivered | Failed` with ack timeouts and bounded linear retry.
//! - **Connection Supervision**: exponential reconnect backoff (2s doubling to a 30s cap) with a display countdown.
//! - **Mailbox Sync**: single-flight drain of the device mailbox on a poll timer or push notification.
//! - **Unread Tracking**: per-conversation counters that ignore the conversation on screen.
//! - **Auto-Responder**: optional responder seam that replies off the main loop.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use meshchat::client::MeshClient;
//! use meshchat::config::Config;
//! use meshchat::storage::MessageStore;
//! use meshchat::transport::sim::SimDevice;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let store = MessageStore::load(&config.storage.cache_file);
//!     let (client, mut handle) =
//!         MeshClient::new(&config, store, Arc::new(SimDevice::demo()), None);
//!     tokio::spawn(client.run());
//!     while let Some(event) = handle.events.recv().await {
//!         println!("{:?}", event);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`client`] - dispatch loop owning every component, UI commands and events
//! - [`storage`] - local message store
//! - [`delivery`] - outgoing message state machine
//! - [`supervisor`] - device link ownership and reconnect policy
//! - [`sync`] - mailbox drain and inbound classification
//! - [`unread`] - unread counters and selection
//! - [`transport`] - radio traits and the simulated device
//! - [`responder`] - auto-responder seam
//! - [`config`] - configuration management
//! - [`validation`] - outbound text checks
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐   UiCommand / UiEvent
//! │   MeshClient    │ ← single dispatch loop
//! └─────────────────┘
//!    │    │     │
//!    │    │  ┌──────────────┐
//!    │    │  │ Supervisor   │ ← owns the one live Radio link
//!    │    │  └──────────────┘
//!    │  ┌──────────────┐
//!    │  │ Tracker/Sync │ ← delivery state, mailbox drain
//!    │  └──────────────┘
//! ┌─────────────────┐
//! │  MessageStore   │ ← dedup + persistence
//! └─────────────────┘
//! ```

pub mod client;
pub mod config;
pub mod delivery;
pub mod logutil;
pub mod metrics;
pub mod models;
pub mod responder;
pub mod storage;
pub mod supervisor;
pub mod sync;
pub mod transport;
pub mod unread;
pub mod validation;
