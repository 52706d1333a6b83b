//! # Storage Module - Local Message Store
//!
//! Durable, deduplicated, append-only conversation log.
//!
//! ## Persistence
//!
//! The whole log is written as one JSON document after every accepted append
//! and every status change:
//!
//! ```json
//! { "lastUpdated": "2026-10-16T09:30:00Z", "messages": [ ... ] }
//! ```
//!
//! Writes go to a temp file in the same directory and are renamed over the
//! destination, so a crash mid-write leaves the previous snapshot intact.
//! Chat volumes are small enough that snapshot-per-mutation is cheap.
//!
//! ## Failure policy
//!
//! A missing or unreadable cache loads as an empty log, and individual
//! malformed entries are skipped. Write failures are logged; the in-memory
//! log stays authoritative for the running session.
//!
//! ## Ordering
//!
//! Insertion order is conversation order. Timestamps can be absent, so
//! [`MessageStore::filter_for`] never re-sorts.

use chrono::Utc;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self as sfs, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::logutil::preview;
use crate::metrics;
use crate::models::{ConversationSelector, DedupKey, DeliveryStatus, Message};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cache serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result of [`MessageStore::append`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Accepted,
    RejectedDuplicate,
}

/// Automated replies repeat the same text by nature and are only unique by id.
fn content_key(msg: &Message) -> Option<DedupKey> {
    if msg.is_automated_reply {
        None
    } else {
        Some(msg.dedup_key())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CacheDocument<'a> {
    last_updated: String,
    messages: &'a [Message],
}

/// Loose shape used on load so a single bad entry does not discard the file.
#[derive(Deserialize)]
struct RawCacheDocument {
    #[serde(default)]
    messages: Vec<serde_json::Value>,
}

pub struct MessageStore {
    path: Option<PathBuf>,
    messages: Vec<Message>,
    ids: HashSet<String>,
    keys: HashSet<DedupKey>,
}

impl MessageStore {
    /// Store that never touches disk.
    pub fn in_memory() -> Self {
        MessageStore {
            path: None,
            messages: Vec::new(),
            ids: HashSet::new(),
            keys: HashSet::new(),
        }
    }

    /// Read the cache at `path` and deduplicate it, keeping the first occurrence.
    /// Never fails: a missing or corrupt file yields an empty log.
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let path_ref = path.as_ref();
        let mut store = MessageStore::in_memory();
        store.path = Some(path_ref.to_path_buf());

        let content = match sfs::read_to_string(path_ref) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No message cache at {}; starting empty", path_ref.display());
                return store;
            }
            Err(e) => {
                warn!(
                    "Failed to read message cache {}: {} (starting empty)",
                    path_ref.display(),
                    e
                );
                return store;
            }
        };
        // Guard against leading NULs left by an interrupted write on some filesystems
        let cleaned = content.trim_start_matches('\0');
        let raw: RawCacheDocument = match serde_json::from_str(cleaned) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(
                    "Message cache {} is corrupt: {} (starting empty)",
                    path_ref.display(),
                    e
                );
                return store;
            }
        };

        let total = raw.messages.len();
        let mut skipped = 0usize;
        let mut dropped = 0usize;
        for value in raw.messages {
            let msg: Message = match serde_json::from_value(value) {
                Ok(m) => m,
                Err(e) => {
                    skipped += 1;
                    debug!("Skipping malformed cached message: {}", e);
                    continue;
                }
            };
            if store.is_duplicate(&msg) {
                dropped += 1;
                continue;
            }
            store.insert(msg);
        }
        if skipped > 0 || dropped > 0 {
            warn!(
                "Message cache {}: {} entries, {} malformed skipped, {} duplicates dropped",
                path_ref.display(),
                total,
                skipped,
                dropped
            );
        }
        debug!(
            "Loaded {} messages from {}",
            store.messages.len(),
            path_ref.display()
        );
        store
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn is_duplicate(&self, msg: &Message) -> bool {
        self.ids.contains(&msg.id)
            || content_key(msg).is_some_and(|key| self.keys.contains(&key))
    }

    fn insert(&mut self, msg: Message) {
        self.ids.insert(msg.id.clone());
        if let Some(key) = content_key(&msg) {
            self.keys.insert(key);
        }
        self.messages.push(msg);
    }

    /// Append unless the message duplicates one already held. The snapshot is
    /// written before this returns.
    pub fn append(&mut self, msg: Message) -> AppendOutcome {
        if self.is_duplicate(&msg) {
            metrics::inc_duplicates_rejected();
            debug!(
                "Duplicate message rejected ({:?}, '{}')",
                msg.conversation(),
                preview(&msg.text, 60)
            );
            return AppendOutcome::RejectedDuplicate;
        }
        self.insert(msg);
        self.persist_logged();
        AppendOutcome::Accepted
    }

    /// Change the delivery status of an outgoing message. Returns `true` when
    /// something changed; unknown ids, inbound messages and no-op transitions
    /// are ignored.
    pub fn update_status(&mut self, id: &str, status: DeliveryStatus) -> bool {
        let Some(msg) = self.messages.iter_mut().find(|m| m.id == id) else {
            debug!("Status update for unknown message id={}", id);
            return false;
        };
        if !msg.outgoing {
            warn!("Refusing status update on inbound message id={}", id);
            return false;
        }
        if msg.delivery_status == Some(status) {
            return false;
        }
        msg.delivery_status = Some(status);
        self.persist_logged();
        true
    }

    /// Messages of one conversation in insertion order.
    pub fn filter_for(&self, selector: &ConversationSelector) -> Vec<&Message> {
        self.messages
            .iter()
            .filter(|m| m.belongs_to(selector))
            .collect()
    }

    /// Distinct conversations in order of first appearance.
    pub fn conversations(&self) -> Vec<ConversationSelector> {
        let mut seen = HashSet::new();
        self.messages
            .iter()
            .filter_map(|m| m.conversation())
            .filter(|c| seen.insert(c.clone()))
            .collect()
    }

    /// Drop every message and write an empty snapshot.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.ids.clear();
        self.keys.clear();
        self.persist_logged();
    }

    fn persist_logged(&self) {
        if let Err(e) = self.persist() {
            warn!("Failed to persist message cache: {}", e);
        }
    }

    /// Write the full snapshot. No-op for in-memory stores.
    pub fn persist(&self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let doc = CacheDocument {
            last_updated: Utc::now().to_rfc3339(),
            messages: &self.messages,
        };
        let content = serde_json::to_string_pretty(&doc)?;
        write_atomic(path, content.as_bytes())
    }
}

fn io_err(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn write_atomic(path: &Path, content: &[u8]) -> Result<(), StoreError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    sfs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;

    let base = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("messages.json");
    let mut counter = 0u32;
    let tmp_path = loop {
        let candidate = dir.join(format!(".{}.tmp-{}-{}", base, std::process::id(), counter));
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
        {
            Ok(mut tmp) => {
                tmp.write_all(content).map_err(|e| io_err(&candidate, e))?;
                tmp.flush().map_err(|e| io_err(&candidate, e))?;
                let _ = tmp.sync_all();
                break candidate;
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                counter = counter.saturating_add(1);
                continue;
            }
            Err(e) => return Err(io_err(&candidate, e)),
        }
    };

    if let Err(e) = sfs::rename(&tmp_path, path) {
        let _ = sfs::remove_file(&tmp_path);
        return Err(io_err(path, e));
    }
    if let Ok(dir_file) = File::open(dir) {
        let _ = dir_file.sync_all();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dm(peer: &str, text: &str) -> Message {
        Message::inbound(
            &ConversationSelector::Direct(peer.into()),
            Some(peer.into()),
            text,
            None,
        )
    }

    #[test]
    fn append_rejects_content_duplicates() {
        let mut store = MessageStore::in_memory();
        assert_eq!(store.append(dm("alice", "hi")), AppendOutcome::Accepted);
        assert_eq!(
            store.append(dm("alice", "hi")),
            AppendOutcome::RejectedDuplicate
        );
        assert_eq!(store.append(dm("alice", "hi!")), AppendOutcome::Accepted);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn automated_replies_are_unique_by_id_only() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("messages.json");
        let mut store = MessageStore::load(&path);
        let sel = ConversationSelector::Direct("alice".into());
        let mut first = Message::outgoing(&sel, Some("me".into()), "brb");
        first.is_automated_reply = true;
        let mut second = Message::outgoing(&sel, Some("me".into()), "brb");
        second.is_automated_reply = true;
        assert_eq!(store.append(first.clone()), AppendOutcome::Accepted);
        assert_eq!(store.append(second), AppendOutcome::Accepted);
        assert_eq!(store.append(first), AppendOutcome::RejectedDuplicate);

        // A typed message with the same text still collides with neither.
        let typed = Message::outgoing(&sel, Some("me".into()), "brb");
        assert_eq!(store.append(typed), AppendOutcome::Accepted);
        drop(store);
        assert_eq!(MessageStore::load(&path).len(), 3);
    }

    #[test]
    fn append_rejects_id_duplicates() {
        let mut store = MessageStore::in_memory();
        let a = dm("alice", "one");
        let mut b = dm("bob", "two");
        b.id = a.id.clone();
        store.append(a);
        assert_eq!(store.append(b), AppendOutcome::RejectedDuplicate);
    }

    #[test]
    fn update_status_only_touches_outgoing() {
        let mut store = MessageStore::in_memory();
        let inbound = dm("alice", "hello");
        let inbound_id = inbound.id.clone();
        store.append(inbound);
        assert!(!store.update_status(&inbound_id, DeliveryStatus::Delivered));
        assert_eq!(store.get(&inbound_id).unwrap().delivery_status, None);

        let out = Message::outgoing(&ConversationSelector::Channel(0), None, "yo");
        let out_id = out.id.clone();
        store.append(out);
        assert!(store.update_status(&out_id, DeliveryStatus::Sent));
        assert!(!store.update_status(&out_id, DeliveryStatus::Sent));
        assert!(!store.update_status("missing", DeliveryStatus::Sent));
        assert_eq!(
            store.get(&out_id).unwrap().delivery_status,
            Some(DeliveryStatus::Sent)
        );
    }

    #[test]
    fn conversations_in_first_seen_order() {
        let mut store = MessageStore::in_memory();
        store.append(dm("bob", "1"));
        store.append(Message::inbound(&ConversationSelector::Channel(0), None, "2", None));
        store.append(dm("bob", "3"));
        assert_eq!(
            store.conversations(),
            vec![
                ConversationSelector::Direct("bob".into()),
                ConversationSelector::Channel(0)
            ]
        );
    }
}
