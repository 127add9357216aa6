//! Conversation store
//!
//! The single source of truth: bot -> user -> messages. Owned by the watcher
//! pipeline task, which is the only writer. Every mutation that changes content
//! bumps the revision and returns the event observers need to replay it;
//! redundant updates return `None` and leave the revision alone.

use std::collections::BTreeMap;
use std::sync::Arc;

use chatwatch_protocol::{ConversationTree, Message, MessageList, ServerMessage, Snapshot};

#[derive(Debug, Default)]
pub struct ConversationStore {
    bots: ConversationTree,
    revision: u64,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Replace a conversation with a fresh decode of its file, creating the bot if needed.
    pub fn apply_file_updated(
        &mut self,
        bot: &str,
        user: &str,
        messages: Vec<Message>,
    ) -> Option<ServerMessage> {
        let users = self.bots.entry(bot.to_string()).or_default();
        if users
            .get(user)
            .is_some_and(|existing| **existing == messages[..])
        {
            return None;
        }

        let messages: MessageList = Arc::from(messages);
        users.insert(user.to_string(), messages.clone());
        let revision = self.bump();
        Some(ServerMessage::ConversationUpdate {
            revision,
            bot: bot.to_string(),
            user: user.to_string(),
            messages,
        })
    }

    /// Drop a conversation; a bot left without conversations goes with it.
    pub fn apply_file_removed(&mut self, bot: &str, user: &str) -> Option<ServerMessage> {
        let users = self.bots.get_mut(bot)?;
        users.remove(user)?;
        if users.is_empty() {
            self.bots.remove(bot);
        }
        let revision = self.bump();
        Some(ServerMessage::ConversationDelete {
            revision,
            bot: bot.to_string(),
            user: user.to_string(),
        })
    }

    pub fn apply_bot_directory_removed(&mut self, bot: &str) -> Option<ServerMessage> {
        self.bots.remove(bot)?;
        let revision = self.bump();
        Some(ServerMessage::BotDelete {
            revision,
            bot: bot.to_string(),
        })
    }

    pub fn apply_bot_directory_added(&mut self, bot: &str) -> Option<ServerMessage> {
        if self.bots.contains_key(bot) {
            return None;
        }
        self.bots.insert(bot.to_string(), BTreeMap::new());
        let revision = self.bump();
        Some(ServerMessage::BotAdd {
            revision,
            bot: bot.to_string(),
        })
    }

    /// Users with a stored conversation under `bot`.
    pub fn users(&self, bot: &str) -> Vec<String> {
        self.bots
            .get(bot)
            .map(|users| users.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Isolated copy of the whole tree. Message lists are immutable and shared.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            revision: self.revision,
            conversations: self.bots.clone(),
        }
    }

    fn bump(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }
}
