//! Filesystem watcher and ingest pipeline
//!
//! notify callbacks are mapped to [`RawChange`]s and pushed onto an unbounded channel.
//! A single pipeline task resolves them to entity keys, debounces per key, and on
//! settle re-reads the affected file, applies the result to the store and relays it.
//! The boot scan goes through the same [`Pipeline::apply`] as live updates.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chatwatch_protocol::{Message, Snapshot};
use notify::event::{AccessKind, AccessMode, CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broadcaster::Broadcaster;
use crate::debounce::{Debouncer, Settled};
use crate::decoder::{self, DecodeError};
use crate::resolver::{self, EntryKind, Resolved};
use crate::store::ConversationStore;

#[derive(Debug, Clone)]
pub struct WatcherSettings {
    pub root: PathBuf,
    /// Log file suffix without the leading dot
    pub suffix: String,
    pub debounce: Duration,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to read {path}: {source}")]
    UnreadableFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to decode {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: DecodeError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Upsert,
    Remove,
}

/// One path-level change reported by the filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChange {
    pub path: PathBuf,
    pub kind: EntryKind,
    pub change: ChangeKind,
}

/// Debounce key: the logical entity a raw change belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityKey {
    Conversation { bot: String, user: String },
    Bot { bot: String },
}

impl EntityKey {
    pub fn bot(&self) -> &str {
        match self {
            EntityKey::Conversation { bot, .. } | EntityKey::Bot { bot } => bot,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogicalUpdate {
    FileUpdated { bot: String, user: String },
    FileRemoved { bot: String, user: String },
    BotDirectoryAdded { bot: String },
    BotDirectoryRemoved { bot: String },
}

impl LogicalUpdate {
    fn from_settled(key: EntityKey, change: ChangeKind) -> Self {
        match (key, change) {
            (EntityKey::Conversation { bot, user }, ChangeKind::Upsert) => {
                LogicalUpdate::FileUpdated { bot, user }
            }
            (EntityKey::Conversation { bot, user }, ChangeKind::Remove) => {
                LogicalUpdate::FileRemoved { bot, user }
            }
            (EntityKey::Bot { bot }, ChangeKind::Upsert) => LogicalUpdate::BotDirectoryAdded { bot },
            (EntityKey::Bot { bot }, ChangeKind::Remove) => {
                LogicalUpdate::BotDirectoryRemoved { bot }
            }
        }
    }
}

/// Translate a notify event into path-level changes.
///
/// Events without a file/folder detail are probed on disk; a path that is already
/// gone becomes a removal so the latest state wins after debouncing.
pub fn map_event(event: &Event) -> Vec<RawChange> {
    let paths = &event.paths;
    match &event.kind {
        EventKind::Create(kind) => {
            let entry = match kind {
                CreateKind::File => Some(EntryKind::File),
                CreateKind::Folder => Some(EntryKind::Directory),
                _ => None,
            };
            paths.iter().map(|path| upsert(path, entry)).collect()
        }
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::From => paths.iter().map(|path| removal(path, None)).collect(),
            RenameMode::To => paths.iter().map(|path| upsert(path, None)).collect(),
            RenameMode::Both => {
                let mut changes = Vec::with_capacity(2);
                if let Some(from) = paths.first() {
                    changes.push(removal(from, None));
                }
                if let Some(to) = paths.get(1) {
                    changes.push(upsert(to, None));
                }
                changes
            }
            _ => paths.iter().map(|path| upsert(path, None)).collect(),
        },
        EventKind::Modify(_) | EventKind::Access(AccessKind::Close(AccessMode::Write)) => {
            paths.iter().map(|path| upsert(path, None)).collect()
        }
        EventKind::Remove(kind) => {
            let entry = match kind {
                RemoveKind::File => Some(EntryKind::File),
                RemoveKind::Folder => Some(EntryKind::Directory),
                _ => None,
            };
            paths.iter().map(|path| removal(path, entry)).collect()
        }
        EventKind::Any => paths.iter().map(|path| upsert(path, None)).collect(),
        _ => Vec::new(),
    }
}

fn upsert(path: &Path, entry: Option<EntryKind>) -> RawChange {
    match entry.or_else(|| probe(path)) {
        Some(kind) => RawChange {
            path: path.to_path_buf(),
            kind,
            change: ChangeKind::Upsert,
        },
        None => removal(path, None),
    }
}

fn removal(path: &Path, entry: Option<EntryKind>) -> RawChange {
    RawChange {
        path: path.to_path_buf(),
        kind: entry.unwrap_or(EntryKind::Unknown),
        change: ChangeKind::Remove,
    }
}

fn probe(path: &Path) -> Option<EntryKind> {
    let metadata = std::fs::metadata(path).ok()?;
    if metadata.is_dir() {
        Some(EntryKind::Directory)
    } else if metadata.is_file() {
        Some(EntryKind::File)
    } else {
        None
    }
}

/// Bot directories and the files inside them, bots first, in name order.
fn collect_tree(root: &Path, start: &Path) -> Vec<(PathBuf, EntryKind)> {
    let mut result = Vec::new();
    let mut stack = vec![start.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };

        for entry in entries.flatten() {
            let path = entry.path();
            match probe(&path) {
                Some(EntryKind::Directory) => {
                    if path.parent() == Some(root) {
                        stack.push(path.clone());
                    }
                    result.push((path, EntryKind::Directory));
                }
                Some(kind) => result.push((path, kind)),
                None => {}
            }
        }
    }

    result.sort_by(|(a, a_kind), (b, b_kind)| {
        let depth = |path: &Path| path.components().count();
        depth(a)
            .cmp(&depth(b))
            .then_with(|| (*a_kind == EntryKind::File).cmp(&(*b_kind == EntryKind::File)))
            .then_with(|| a.cmp(b))
    });
    result
}

pub struct Pipeline {
    store: ConversationStore,
    broadcaster: Arc<Broadcaster>,
    debouncer: Debouncer<EntityKey, ChangeKind>,
    root: PathBuf,
    suffix: String,
}

impl Pipeline {
    /// `root` must already be canonical; notify reports absolute paths.
    pub fn new(
        root: PathBuf,
        suffix: String,
        debounce: Duration,
        broadcaster: Arc<Broadcaster>,
    ) -> (Self, mpsc::UnboundedReceiver<Settled<EntityKey>>) {
        let (debouncer, settled_rx) = Debouncer::new(debounce);
        let pipeline = Self {
            store: ConversationStore::new(),
            broadcaster,
            debouncer,
            root,
            suffix,
        };
        (pipeline, settled_rx)
    }

    pub fn snapshot(&self) -> Snapshot {
        self.store.snapshot()
    }

    pub fn pending(&self) -> usize {
        self.debouncer.len()
    }

    /// Decode the whole tree once. Returns the number of updates that changed the store.
    pub async fn boot(&mut self) -> usize {
        let mut applied = 0;
        for (path, kind) in collect_tree(&self.root, &self.root) {
            let update = match resolver::resolve(&self.root, &path, kind, &self.suffix) {
                Resolved::BotDirectory { bot } => LogicalUpdate::BotDirectoryAdded { bot },
                Resolved::ConversationFile { bot, user } => {
                    LogicalUpdate::FileUpdated { bot, user }
                }
                Resolved::Ignored => continue,
            };
            if self.apply(update).await.is_some() {
                applied += 1;
            }
        }
        applied
    }

    /// Feed one raw change into the debouncer.
    pub fn schedule(&mut self, raw: RawChange) {
        let key = match resolver::resolve(&self.root, &raw.path, raw.kind, &self.suffix) {
            Resolved::ConversationFile { bot, user } => EntityKey::Conversation { bot, user },
            Resolved::BotDirectory { bot } => EntityKey::Bot { bot },
            Resolved::Ignored => {
                debug!(
                    component = "watcher",
                    event = "watcher.path_ignored",
                    path = %raw.path.display(),
                    "Ignoring path outside conversation layout"
                );
                return;
            }
        };

        if let EntityKey::Bot { bot } = &key {
            match raw.change {
                ChangeKind::Remove => {
                    // Pending removals stay: the directory may be back before they settle.
                    let cancelled = self.debouncer.cancel_where(|pending, change| {
                        matches!(pending, EntityKey::Conversation { .. })
                            && pending.bot() == bot
                            && *change == ChangeKind::Upsert
                    });
                    if cancelled > 0 {
                        debug!(
                            component = "watcher",
                            event = "watcher.pending_cancelled",
                            bot = %bot,
                            cancelled = cancelled,
                            "Cancelled pending conversation updates for removed bot"
                        );
                    }
                }
                // A directory moved into the root arrives as one create event.
                ChangeKind::Upsert => self.schedule_children(&raw.path),
            }
        }

        self.debouncer.schedule(key, raw.change);
    }

    fn schedule_children(&mut self, bot_dir: &Path) {
        for (path, kind) in collect_tree(&self.root, bot_dir) {
            if let Resolved::ConversationFile { bot, user } =
                resolver::resolve(&self.root, &path, kind, &self.suffix)
            {
                self.debouncer
                    .schedule(EntityKey::Conversation { bot, user }, ChangeKind::Upsert);
            }
        }
    }

    /// Apply a settled debounce token. Stale tokens are ignored.
    pub async fn settle(&mut self, settled: Settled<EntityKey>) -> Option<u64> {
        let (key, change) = self.debouncer.take_settled(settled)?;
        if let (EntityKey::Bot { bot }, ChangeKind::Upsert) = (&key, change) {
            // Files written before the recursive watch reached a new directory.
            let bot_dir = self.root.join(bot);
            self.schedule_children(&bot_dir);
            self.schedule_vanished(bot);
        }
        self.apply(LogicalUpdate::from_settled(key, change)).await
    }

    /// Schedule removal of every stored conversation of `bot` whose file is gone.
    fn schedule_vanished(&mut self, bot: &str) {
        for user in self.store.users(bot) {
            let path = resolver::conversation_path(&self.root, bot, &user, &self.suffix);
            if !path.is_file() {
                self.debouncer.schedule(
                    EntityKey::Conversation {
                        bot: bot.to_string(),
                        user,
                    },
                    ChangeKind::Remove,
                );
            }
        }
    }

    /// Apply one logical update to the store and relay the resulting event.
    /// Returns the new revision, or `None` when nothing changed.
    pub async fn apply(&mut self, update: LogicalUpdate) -> Option<u64> {
        let event = match &update {
            LogicalUpdate::FileUpdated { bot, user } => {
                let path = resolver::conversation_path(&self.root, bot, user, &self.suffix);
                match ingest(&path).await {
                    Ok(Some(messages)) => self.store.apply_file_updated(bot, user, messages),
                    Ok(None) => self.store.apply_file_removed(bot, user),
                    Err(err) => {
                        warn!(
                            component = "watcher",
                            event = "watcher.ingest_failed",
                            bot = %bot,
                            user = %user,
                            error = %err,
                            "Keeping previous conversation state"
                        );
                        None
                    }
                }
            }
            LogicalUpdate::FileRemoved { bot, user } => self.store.apply_file_removed(bot, user),
            LogicalUpdate::BotDirectoryAdded { bot } => {
                let exists = tokio::fs::metadata(self.root.join(bot))
                    .await
                    .is_ok_and(|metadata| metadata.is_dir());
                if exists {
                    self.store.apply_bot_directory_added(bot)
                } else {
                    self.store.apply_bot_directory_removed(bot)
                }
            }
            LogicalUpdate::BotDirectoryRemoved { bot } => {
                self.store.apply_bot_directory_removed(bot)
            }
        }?;

        let revision = self.store.revision();
        let observers = self.broadcaster.relay(self.store.snapshot(), event);
        info!(
            component = "watcher",
            event = "watcher.update_applied",
            update = ?update,
            revision = revision,
            observers = observers,
            "Applied conversation update"
        );
        Some(revision)
    }

    fn stop(&mut self) -> usize {
        self.debouncer.cancel_all()
    }
}

/// Read and decode one conversation file. `Ok(None)` when the file is gone.
async fn ingest(path: &Path) -> Result<Option<Vec<Message>>, IngestError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(IngestError::UnreadableFile {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let decoded = decoder::decode(&bytes).map_err(|source| IngestError::Malformed {
        path: path.to_path_buf(),
        source,
    })?;
    if decoded.skipped_records > 0 {
        warn!(
            component = "watcher",
            event = "watcher.records_skipped",
            path = %path.display(),
            skipped = decoded.skipped_records,
            "Skipped records without a valid header"
        );
    }
    Ok(Some(decoded.messages))
}

/// Resolve the watched root to the absolute form notify reports paths in.
pub fn canonical_root(root: &Path) -> anyhow::Result<PathBuf> {
    let canonical = std::fs::canonicalize(root).with_context(|| {
        format!("conversations directory {} is not accessible", root.display())
    })?;
    if !canonical.is_dir() {
        anyhow::bail!("conversations path {} is not a directory", root.display());
    }
    Ok(canonical)
}

/// Running watcher. Dropping the handle also stops the pipeline.
pub struct WatcherHandle {
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl WatcherHandle {
    /// Cancel pending debounce timers, release the filesystem subscription and wait
    /// for the pipeline task to exit.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(err) = self.task.await {
            warn!(
                component = "watcher",
                event = "watcher.join_failed",
                error = %err,
                "Watcher pipeline task ended abnormally"
            );
        }
    }
}

/// Register the filesystem watch, populate the store from disk and start the pipeline.
///
/// Fails only when the root is unusable or the watch cannot be registered.
pub async fn start(
    settings: WatcherSettings,
    broadcaster: Arc<Broadcaster>,
) -> anyhow::Result<WatcherHandle> {
    let root = canonical_root(&settings.root)?;

    let (raw_tx, raw_rx) = mpsc::unbounded_channel::<RawChange>();
    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| match res {
            Ok(event) => {
                for change in map_event(&event) {
                    let _ = raw_tx.send(change);
                }
            }
            Err(err) => {
                warn!(
                    component = "watcher",
                    event = "watcher.fs_event_error",
                    error = %err,
                    "Filesystem watcher event error"
                );
            }
        },
        notify::Config::default(),
    )?;
    watcher
        .watch(&root, RecursiveMode::Recursive)
        .with_context(|| format!("failed to watch {}", root.display()))?;

    info!(
        component = "watcher",
        event = "watcher.started",
        path = %root.display(),
        debounce_ms = settings.debounce.as_millis() as u64,
        "Conversation watcher started"
    );

    let (mut pipeline, settled_rx) =
        Pipeline::new(root, settings.suffix, settings.debounce, broadcaster);
    let applied = pipeline.boot().await;
    let snapshot = pipeline.snapshot();
    info!(
        component = "watcher",
        event = "watcher.boot_complete",
        applied = applied,
        bots = snapshot.bot_count(),
        conversations = snapshot.conversation_count(),
        "Initial conversation scan complete"
    );

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let task = tokio::spawn(run_pipeline(
        pipeline,
        watcher,
        raw_rx,
        settled_rx,
        shutdown_rx,
    ));

    Ok(WatcherHandle { shutdown_tx, task })
}

async fn run_pipeline(
    mut pipeline: Pipeline,
    watcher: RecommendedWatcher,
    mut raw_rx: mpsc::UnboundedReceiver<RawChange>,
    mut settled_rx: mpsc::UnboundedReceiver<Settled<EntityKey>>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            Some(raw) = raw_rx.recv() => pipeline.schedule(raw),
            Some(settled) = settled_rx.recv() => {
                pipeline.settle(settled).await;
            }
            else => break,
        }
    }

    let cancelled = pipeline.stop();
    drop(watcher);
    info!(
        component = "watcher",
        event = "watcher.stopped",
        cancelled = cancelled,
        "Conversation watcher stopped"
    );
}
