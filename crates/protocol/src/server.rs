//! Server → Observer messages

use serde::{Deserialize, Serialize};

use crate::types::*;

/// Messages pushed from the server to observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    // Full state sync, sent once per connection
    InitialData {
        revision: u64,
        conversations: ConversationTree,
    },

    // Incremental updates
    ConversationUpdate {
        revision: u64,
        bot: String,
        user: String,
        messages: MessageList,
    },
    ConversationDelete {
        revision: u64,
        bot: String,
        user: String,
    },
    BotDelete {
        revision: u64,
        bot: String,
    },
    BotAdd {
        revision: u64,
        bot: String,
    },

    // Transport problems; the store is unaffected
    Error {
        code: String,
        message: String,
    },
}

impl ServerMessage {
    /// Revision of the store state this message brings the observer to.
    pub fn revision(&self) -> Option<u64> {
        match self {
            ServerMessage::InitialData { revision, .. }
            | ServerMessage::ConversationUpdate { revision, .. }
            | ServerMessage::ConversationDelete { revision, .. }
            | ServerMessage::BotDelete { revision, .. }
            | ServerMessage::BotAdd { revision, .. } => Some(*revision),
            ServerMessage::Error { .. } => None,
        }
    }

    /// Apply this message to an observer-side copy of the conversations.
    ///
    /// Mirrors the store operations exactly, including the cascade that drops
    /// a bot once its last conversation is deleted.
    pub fn apply_to(&self, view: &mut Snapshot) {
        match self {
            ServerMessage::InitialData {
                revision,
                conversations,
            } => {
                view.revision = *revision;
                view.conversations = conversations.clone();
            }
            ServerMessage::ConversationUpdate {
                revision,
                bot,
                user,
                messages,
            } => {
                view.revision = *revision;
                view.conversations
                    .entry(bot.clone())
                    .or_default()
                    .insert(user.clone(), messages.clone());
            }
            ServerMessage::ConversationDelete {
                revision,
                bot,
                user,
            } => {
                view.revision = *revision;
                if let Some(users) = view.conversations.get_mut(bot) {
                    users.remove(user);
                    if users.is_empty() {
                        view.conversations.remove(bot);
                    }
                }
            }
            ServerMessage::BotDelete { revision, bot } => {
                view.revision = *revision;
                view.conversations.remove(bot);
            }
            ServerMessage::BotAdd { revision, bot } => {
                view.revision = *revision;
                view.conversations.entry(bot.clone()).or_default();
            }
            ServerMessage::Error { .. } => {}
        }
    }
}
