//! Core types shared across the protocol

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Who wrote a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    User,
    Bot,
}

impl Sender {
    /// Normalize a raw sender label. Only `bot` (any case) maps to [`Sender::Bot`].
    pub fn from_label(label: &str) -> Self {
        if label.trim().eq_ignore_ascii_case("bot") {
            Sender::Bot
        } else {
            Sender::User
        }
    }
}

/// A single decoded record of a conversation log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Timestamp exactly as written in the log header
    pub timestamp: String,
    /// Parsed instant, when the timestamp is in a recognized format
    pub parsed_at: Option<NaiveDateTime>,
    pub sender: Sender,
    pub content: String,
    /// Bot "has entered the chat" announcement
    pub is_entry: bool,
}

/// Immutable message list. Replaced wholesale on every re-read, never mutated.
pub type MessageList = Arc<[Message]>;

/// bot id -> user id -> messages
pub type ConversationTree = BTreeMap<String, BTreeMap<String, MessageList>>;

/// Point-in-time copy of every known conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Store revision this snapshot reflects
    pub revision: u64,
    pub conversations: ConversationTree,
}

impl Snapshot {
    pub fn bot_count(&self) -> usize {
        self.conversations.len()
    }

    pub fn conversation_count(&self) -> usize {
        self.conversations.values().map(BTreeMap::len).sum()
    }

    pub fn messages(&self, bot: &str, user: &str) -> Option<&MessageList> {
        self.conversations.get(bot).and_then(|users| users.get(user))
    }
}
