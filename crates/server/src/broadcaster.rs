//! Synchronization broadcaster
//!
//! The pipeline publishes every new store snapshot into an `ArcSwap` and then sends
//! the matching event on a broadcast channel. Observers subscribe to the channel
//! first and load the snapshot second, so any event missing from the snapshot is
//! guaranteed to be in their receiver; events the snapshot already reflects are
//! dropped by revision. Reads never block the pipeline and the pipeline never
//! waits on an observer.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use chatwatch_protocol::{ServerMessage, Snapshot};
use tokio::sync::broadcast;
use tracing::{debug, warn};

pub const DEFAULT_RELAY_CAPACITY: usize = 256;

pub struct Broadcaster {
    snapshot: ArcSwap<Snapshot>,
    tx: broadcast::Sender<ServerMessage>,
    observers: Arc<AtomicUsize>,
}

impl Broadcaster {
    /// `capacity` bounds how far one observer may fall behind before it is cut off.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            snapshot: ArcSwap::from_pointee(Snapshot::default()),
            tx,
            observers: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Lock-free read of the latest published snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.load_full()
    }

    fn publish(&self, snapshot: Snapshot) {
        self.snapshot.store(Arc::new(snapshot));
    }

    /// Publish `snapshot`, then relay `event` to every synchronized observer.
    /// Returns the number of receivers the event reached.
    pub fn relay(&self, snapshot: Snapshot, event: ServerMessage) -> usize {
        debug_assert_eq!(event.revision(), Some(snapshot.revision));
        self.publish(snapshot);
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> Subscription {
        let rx = self.tx.subscribe();
        let snapshot = self.snapshot.load_full();
        let count = self.observers.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(
            component = "broadcaster",
            event = "broadcaster.observer_subscribed",
            revision = snapshot.revision,
            observers = count,
            "Observer subscribed"
        );
        Subscription::new(
            rx,
            snapshot,
            ObserverGuard {
                observers: self.observers.clone(),
            },
        )
    }

    pub fn observer_count(&self) -> usize {
        self.observers.load(Ordering::Relaxed)
    }
}

/// Observer lifecycle: one snapshot, then increments, until closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverPhase {
    Connecting,
    Synchronized,
    Closed,
}

struct ObserverGuard {
    observers: Arc<AtomicUsize>,
}

impl Drop for ObserverGuard {
    fn drop(&mut self) {
        self.observers.fetch_sub(1, Ordering::Relaxed);
    }
}

/// One observer's view of the relay.
///
/// The first call to [`Subscription::next`] always yields `initialData`; every later
/// call yields events newer than that snapshot, in order. Falling behind by more
/// than the channel capacity yields a single `lagged` error and closes the
/// subscription, forcing a reconnect and a fresh snapshot.
pub struct Subscription {
    rx: broadcast::Receiver<ServerMessage>,
    initial: Option<Arc<Snapshot>>,
    revision: u64,
    phase: ObserverPhase,
    _guard: ObserverGuard,
}

impl Subscription {
    fn new(
        rx: broadcast::Receiver<ServerMessage>,
        snapshot: Arc<Snapshot>,
        guard: ObserverGuard,
    ) -> Self {
        Self {
            rx,
            revision: snapshot.revision,
            initial: Some(snapshot),
            phase: ObserverPhase::Connecting,
            _guard: guard,
        }
    }

    pub fn phase(&self) -> ObserverPhase {
        self.phase
    }

    /// Revision of the snapshot this observer was synchronized from.
    pub fn snapshot_revision(&self) -> u64 {
        self.revision
    }

    /// The `initialData` message. Only available once, while `Connecting`.
    pub fn initial_message(&mut self) -> Option<ServerMessage> {
        if self.phase != ObserverPhase::Connecting {
            return None;
        }
        self.phase = ObserverPhase::Synchronized;
        let snapshot = self.initial.take()?;
        Some(ServerMessage::InitialData {
            revision: snapshot.revision,
            conversations: snapshot.conversations.clone(),
        })
    }

    pub async fn next(&mut self) -> Option<ServerMessage> {
        match self.phase {
            ObserverPhase::Closed => return None,
            ObserverPhase::Connecting => return self.initial_message(),
            ObserverPhase::Synchronized => {}
        }

        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if event
                        .revision()
                        .is_some_and(|revision| revision <= self.revision)
                    {
                        continue;
                    }
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        component = "broadcaster",
                        event = "broadcaster.observer_lagged",
                        skipped = skipped,
                        "Observer lagged behind relay, closing"
                    );
                    self.phase = ObserverPhase::Closed;
                    return Some(ServerMessage::Error {
                        code: "lagged".to_string(),
                        message: format!(
                            "Observer fell {skipped} events behind; reconnect to resynchronize"
                        ),
                    });
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.phase = ObserverPhase::Closed;
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ConversationStore;
    use chatwatch_protocol::{Message, Sender};

    fn msg(content: &str) -> Message {
        Message {
            timestamp: "2024-01-01 10:00:00".to_string(),
            parsed_at: None,
            sender: Sender::User,
            content: content.to_string(),
            is_entry: false,
        }
    }

    fn apply(
        store: &mut ConversationStore,
        broadcaster: &Broadcaster,
        event: Option<ServerMessage>,
    ) {
        if let Some(event) = event {
            broadcaster.relay(store.snapshot(), event);
        }
    }

    async fn drain(subscription: &mut Subscription, view: &mut Snapshot, target: u64) {
        while view.revision < target {
            let message = subscription.next().await.expect("subscription open");
            message.apply_to(view);
        }
    }

    #[tokio::test]
    async fn first_message_is_initial_snapshot() {
        let broadcaster = Broadcaster::new(DEFAULT_RELAY_CAPACITY);
        let mut subscription = broadcaster.subscribe();
        assert_eq!(subscription.phase(), ObserverPhase::Connecting);

        let first = subscription.next().await.expect("initial");
        assert!(matches!(
            first,
            ServerMessage::InitialData { revision: 0, .. }
        ));
        assert_eq!(subscription.phase(), ObserverPhase::Synchronized);
    }

    #[test]
    fn initial_message_is_taken_once() {
        let broadcaster = Broadcaster::new(DEFAULT_RELAY_CAPACITY);
        let mut subscription = broadcaster.subscribe();

        assert!(subscription.initial_message().is_some());
        assert!(subscription.initial_message().is_none());
        assert_eq!(subscription.phase(), ObserverPhase::Synchronized);
    }

    #[tokio::test]
    async fn relays_events_after_snapshot_in_order() {
        let broadcaster = Broadcaster::new(DEFAULT_RELAY_CAPACITY);
        let mut store = ConversationStore::new();
        let mut subscription = broadcaster.subscribe();
        subscription.next().await.expect("initial");

        let event = store.apply_bot_directory_added("botA");
        apply(&mut store, &broadcaster, event);
        let event = store.apply_file_updated("botA", "alice", vec![msg("hi")]);
        apply(&mut store, &broadcaster, event);

        assert!(matches!(
            subscription.next().await,
            Some(ServerMessage::BotAdd { revision: 1, .. })
        ));
        assert!(matches!(
            subscription.next().await,
            Some(ServerMessage::ConversationUpdate { revision: 2, .. })
        ));
    }

    #[tokio::test]
    async fn events_already_in_snapshot_are_not_relayed_twice() {
        let broadcaster = Broadcaster::new(DEFAULT_RELAY_CAPACITY);
        let mut store = ConversationStore::new();

        // Receiver registered before the relay, snapshot loaded after it: the
        // interleaving `subscribe` permits when it races the pipeline.
        let rx = broadcaster.tx.subscribe();
        let event = store.apply_file_updated("botA", "alice", vec![msg("hi")]);
        apply(&mut store, &broadcaster, event);
        let mut subscription = Subscription::new(
            rx,
            broadcaster.snapshot(),
            ObserverGuard {
                observers: broadcaster.observers.clone(),
            },
        );

        let initial = subscription.next().await.expect("initial");
        assert_eq!(initial.revision(), Some(1));

        let event = store.apply_file_updated("botA", "alice", vec![msg("hi"), msg("again")]);
        apply(&mut store, &broadcaster, event);
        let next = subscription.next().await.expect("second update");
        assert_eq!(next.revision(), Some(2));
    }

    #[tokio::test]
    async fn late_observer_replay_matches_store() {
        let broadcaster = Broadcaster::new(DEFAULT_RELAY_CAPACITY);
        let mut store = ConversationStore::new();

        let mut early = broadcaster.subscribe();
        let mut early_view = Snapshot::default();
        early.next().await.expect("initial").apply_to(&mut early_view);

        let event = store.apply_file_updated("botA", "alice", vec![msg("1")]);
        apply(&mut store, &broadcaster, event);
        let event = store.apply_file_updated("botA", "bob", vec![msg("2")]);
        apply(&mut store, &broadcaster, event);
        let event = store.apply_bot_directory_added("botB");
        apply(&mut store, &broadcaster, event);

        let mut late = broadcaster.subscribe();
        let mut late_view = Snapshot::default();
        late.next().await.expect("initial").apply_to(&mut late_view);
        assert_eq!(late_view.revision, 3);

        let event = store.apply_file_removed("botA", "alice");
        apply(&mut store, &broadcaster, event);
        let event = store.apply_file_updated("botA", "bob", vec![msg("2"), msg("3")]);
        apply(&mut store, &broadcaster, event);
        let event = store.apply_bot_directory_removed("botB");
        apply(&mut store, &broadcaster, event);
        let event = store.apply_file_updated("botC", "dave", vec![msg("4")]);
        apply(&mut store, &broadcaster, event);

        let expected = store.snapshot();
        drain(&mut early, &mut early_view, expected.revision).await;
        drain(&mut late, &mut late_view, expected.revision).await;

        assert_eq!(early_view, expected);
        assert_eq!(late_view, expected);
        assert_eq!(*broadcaster.snapshot(), expected);
    }

    #[tokio::test]
    async fn lagging_observer_gets_error_then_closes() {
        let broadcaster = Broadcaster::new(2);
        let mut store = ConversationStore::new();
        let mut subscription = broadcaster.subscribe();
        subscription.next().await.expect("initial");

        for n in 0..5 {
            let event = store.apply_file_updated("botA", "alice", vec![msg(&n.to_string())]);
            apply(&mut store, &broadcaster, event);
        }

        match subscription.next().await {
            Some(ServerMessage::Error { code, .. }) => assert_eq!(code, "lagged"),
            other => panic!("expected lagged error, got {other:?}"),
        }
        assert_eq!(subscription.phase(), ObserverPhase::Closed);
        assert!(subscription.next().await.is_none());
    }

    #[tokio::test]
    async fn relay_without_observers_still_publishes() {
        let broadcaster = Broadcaster::new(DEFAULT_RELAY_CAPACITY);
        let mut store = ConversationStore::new();
        let event = store
            .apply_bot_directory_added("botA")
            .expect("new bot");

        assert_eq!(broadcaster.relay(store.snapshot(), event), 0);
        assert_eq!(broadcaster.snapshot().revision, 1);
    }

    #[tokio::test]
    async fn observer_count_follows_subscriptions() {
        let broadcaster = Broadcaster::new(DEFAULT_RELAY_CAPACITY);
        let first = broadcaster.subscribe();
        let second = broadcaster.subscribe();
        assert_eq!(broadcaster.observer_count(), 2);

        drop(first);
        assert_eq!(broadcaster.observer_count(), 1);
        drop(second);
        assert_eq!(broadcaster.observer_count(), 0);
    }
}
