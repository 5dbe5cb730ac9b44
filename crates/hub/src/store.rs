//! Collaborator contracts: message persistence and channel membership.
//!
//! The relational store and the membership authority live outside this
//! process; the hub only sees these traits. Identifiers are opaque strings
//! everywhere in the hub; any numeric conversion happens behind these
//! implementations.

use std::{
    collections::HashMap,
    sync::{Mutex, atomic::{AtomicU64, Ordering}},
};

use async_trait::async_trait;

/// A chat row as the hub hands it to the store.
#[derive(Debug, Clone)]
pub struct NewChatMessage {
    pub channel_id: String,
    pub sender_id: String,
    pub text: Option<String>,
    pub url: Option<String>,
    pub file_name: Option<String>,
    /// Seconds since epoch, stamped at ingress.
    pub sent_at: u64,
}

/// A persisted chat row, joined with the sender profile fields used in the
/// outbound envelope.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub id: String,
    pub channel_id: String,
    pub sender_id: String,
    pub text: Option<String>,
    pub url: Option<String>,
    pub file_name: Option<String>,
    pub sender_name: Option<String>,
    pub sender_avatar: Option<String>,
    pub sent_at: u64,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist the row and assign its id.
    async fn create(&self, message: NewChatMessage) -> anyhow::Result<ChatMessage>;

    /// Load a row by id, joined with sender profile fields.
    async fn find_by_id(&self, id: &str) -> anyhow::Result<Option<ChatMessage>>;
}

#[async_trait]
pub trait MembershipOracle: Send + Sync {
    /// Whether the user is permitted in the channel. `Err` means the check
    /// itself failed and surfaces as `PERMISSION_ERROR`.
    async fn can_user_join_channel(&self, user_id: &str, channel_id: &str)
    -> anyhow::Result<bool>;
}

// ── In-memory implementations ────────────────────────────────────────────────
//
// Stand-ins for deployments that wire the real store, and the backbone of
// the integration tests.

#[derive(Default)]
pub struct MemoryMessageStore {
    rows: Mutex<HashMap<String, ChatMessage>>,
    profiles: Mutex<HashMap<String, (String, Option<String>)>>,
    next_id: AtomicU64,
}

impl MemoryMessageStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the profile fields joined on reload.
    pub fn set_profile(&self, user_id: &str, name: &str, avatar: Option<&str>) {
        self.profiles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                user_id.to_string(),
                (name.to_string(), avatar.map(str::to_string)),
            );
    }

    /// Number of persisted rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn create(&self, message: NewChatMessage) -> anyhow::Result<ChatMessage> {
        let id = (self.next_id.fetch_add(1, Ordering::Relaxed) + 1).to_string();
        let (sender_name, sender_avatar) = self
            .profiles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&message.sender_id)
            .cloned()
            .unwrap_or((format!("user-{}", message.sender_id), None));
        let row = ChatMessage {
            id: id.clone(),
            channel_id: message.channel_id,
            sender_id: message.sender_id,
            text: message.text,
            url: message.url,
            file_name: message.file_name,
            sender_name: Some(sender_name),
            sender_avatar,
            sent_at: message.sent_at,
        };
        self.rows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, row.clone());
        Ok(row)
    }

    async fn find_by_id(&self, id: &str) -> anyhow::Result<Option<ChatMessage>> {
        Ok(self
            .rows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned())
    }
}

/// Grants every join. The default wiring until a real oracle is attached.
pub struct AllowAllMembership;

#[async_trait]
impl MembershipOracle for AllowAllMembership {
    async fn can_user_join_channel(
        &self,
        _user_id: &str,
        _channel_id: &str,
    ) -> anyhow::Result<bool> {
        Ok(true)
    }
}
