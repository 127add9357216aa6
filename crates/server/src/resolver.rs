//! Maps paths under the conversations root to bots and conversations.
//!
//! Layout: `<root>/<bot>/<user>.<suffix>`. This is the only place that convention lives.

use std::path::{Component, Path};

/// What the caller knows about the filesystem entry at a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    /// Entry is gone (removal events) or could not be inspected
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    ConversationFile { bot: String, user: String },
    BotDirectory { bot: String },
    Ignored,
}

/// Classify `path` relative to `root`. Never fails; anything unexpected is `Ignored`.
///
/// A one-segment path of [`EntryKind::Unknown`] resolves to a bot directory so that
/// removals of directories we can no longer stat still reach the store.
pub fn resolve(root: &Path, path: &Path, kind: EntryKind, suffix: &str) -> Resolved {
    let Ok(relative) = path.strip_prefix(root) else {
        return Resolved::Ignored;
    };

    let mut segments = Vec::with_capacity(2);
    for component in relative.components() {
        let Component::Normal(segment) = component else {
            return Resolved::Ignored;
        };
        let Some(segment) = segment.to_str() else {
            return Resolved::Ignored;
        };
        if segment.is_empty() || segment.starts_with('.') {
            return Resolved::Ignored;
        }
        segments.push(segment);
        if segments.len() > 2 {
            return Resolved::Ignored;
        }
    }

    match (segments.as_slice(), kind) {
        ([bot], EntryKind::Directory | EntryKind::Unknown) => Resolved::BotDirectory {
            bot: (*bot).to_string(),
        },
        ([bot, file], EntryKind::File | EntryKind::Unknown) => match user_from_file_name(file, suffix) {
            Some(user) => Resolved::ConversationFile {
                bot: (*bot).to_string(),
                user: user.to_string(),
            },
            None => Resolved::Ignored,
        },
        _ => Resolved::Ignored,
    }
}

/// `alice.log` -> `alice` for suffix `log`.
pub fn user_from_file_name<'a>(file_name: &'a str, suffix: &str) -> Option<&'a str> {
    let stem = file_name.strip_suffix(suffix)?.strip_suffix('.')?;
    (!stem.is_empty()).then_some(stem)
}

/// Inverse of [`resolve`] for conversation files.
pub fn conversation_path(root: &Path, bot: &str, user: &str, suffix: &str) -> std::path::PathBuf {
    root.join(bot).join(format!("{user}.{suffix}"))
}
