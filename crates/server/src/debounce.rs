//! Per-key trailing debounce.
//!
//! Every `schedule` for a key replaces its pending value and restarts its timer.
//! When a timer runs out it posts a [`Settled`] token on the channel returned by
//! [`Debouncer::new`]; the owner hands the token back to [`Debouncer::take_settled`]
//! to claim the latest value. Tokens carry a generation so a timer that fired just
//! before its key was rescheduled cannot deliver early.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A key's quiescence window ran out.
#[derive(Debug)]
pub struct Settled<K> {
    pub key: K,
    generation: u64,
}

struct Pending<V> {
    value: V,
    generation: u64,
    timer: JoinHandle<()>,
}

pub struct Debouncer<K, V> {
    window: Duration,
    pending: HashMap<K, Pending<V>>,
    next_generation: u64,
    settled_tx: mpsc::UnboundedSender<Settled<K>>,
}

impl<K, V> Debouncer<K, V>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    pub fn new(window: Duration) -> (Self, mpsc::UnboundedReceiver<Settled<K>>) {
        let (settled_tx, settled_rx) = mpsc::unbounded_channel();
        let debouncer = Self {
            window,
            pending: HashMap::new(),
            next_generation: 0,
            settled_tx,
        };
        (debouncer, settled_rx)
    }

    /// Record `value` as the latest for `key` and restart its quiescence timer.
    pub fn schedule(&mut self, key: K, value: V) {
        if let Some(previous) = self.pending.remove(&key) {
            previous.timer.abort();
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let tx = self.settled_tx.clone();
        let window = self.window;
        let settled_key = key.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let _ = tx.send(Settled {
                key: settled_key,
                generation,
            });
        });

        self.pending.insert(
            key,
            Pending {
                value,
                generation,
                timer,
            },
        );
    }

    /// Claim the value for a settled key. `None` if the token is stale or cancelled.
    pub fn take_settled(&mut self, settled: Settled<K>) -> Option<(K, V)> {
        let current = self.pending.get(&settled.key)?.generation;
        if current != settled.generation {
            return None;
        }
        self.pending
            .remove(&settled.key)
            .map(|pending| (settled.key, pending.value))
    }

    pub fn cancel(&mut self, key: &K) -> Option<V> {
        let pending = self.pending.remove(key)?;
        pending.timer.abort();
        Some(pending.value)
    }

    /// Cancel every pending entry matching `predicate`, returning how many were dropped.
    pub fn cancel_where(&mut self, mut predicate: impl FnMut(&K, &V) -> bool) -> usize {
        let keys: Vec<K> = self
            .pending
            .iter()
            .filter(|(key, pending)| predicate(key, &pending.value))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &keys {
            self.cancel(key);
        }
        keys.len()
    }

    pub fn cancel_all(&mut self) -> usize {
        let count = self.pending.len();
        for (_, pending) in self.pending.drain() {
            pending.timer.abort();
        }
        count
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl<K, V> Drop for Debouncer<K, V> {
    fn drop(&mut self) {
        for pending in self.pending.values() {
            pending.timer.abort();
        }
    }
}
