//! The Blocking State Store: the only data shared between the dispatcher and operators.
use dashmap::DashMap;
use tokio::sync::watch;

use crate::record::TopicPartition;

/// A scope over which an operator override (or the dispatcher's own [`BlockingState::Blocked`]
/// bookkeeping) applies.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum BlockingTarget {
    /// Applies to every partition of the named topic.
    Topic(String),

    /// Applies to a single partition.
    TopicPartition(TopicPartition),
}

impl From<TopicPartition> for BlockingTarget {
    fn from(tp: TopicPartition) -> Self {
        BlockingTarget::TopicPartition(tp)
    }
}

/// A record the Blocking Retry Loop is currently holding while it sleeps between attempts.
#[derive(Clone, Debug, PartialEq)]
pub struct BlockedRecord {
    /// Key of the record being retried.
    pub key: Option<Vec<u8>>,

    /// Value of the record being retried.
    pub value: Vec<u8>,

    /// Headers of the record being retried.
    pub headers: Vec<(String, Vec<u8>)>,

    /// Partition the record is being retried on.
    pub topic_partition: TopicPartition,

    /// Offset of the record being retried.
    pub offset: i64,
}

/// The state of a [`BlockingTarget`] in the store.
///
/// Absence of an entry for a target is equivalent to [`BlockingState::Blocking`].
#[derive(Clone, Debug, PartialEq)]
pub enum BlockingState {
    /// Normal operation: blocking retries sleep and reinvoke the handler as configured.
    Blocking,

    /// The Blocking Retry Loop is holding this record while it sleeps. Only ever set by
    /// the loop itself, and only under a [`BlockingTarget::TopicPartition`].
    Blocked(BlockedRecord),

    /// Skip exactly one subsequent blocking retry matched by this target, then revert to
    /// [`BlockingState::Blocking`].
    IgnoringOnce,

    /// Skip every subsequent blocking retry matched by this target, indefinitely.
    IgnoringAll,
}

impl Default for BlockingState {
    fn default() -> Self {
        BlockingState::Blocking
    }
}

/// Concurrent store mapping [`BlockingTarget`]s to their [`BlockingState`].
///
/// Backed by a sharded map so that reads/writes to unrelated targets never contend
/// (`dashmap`), and a `tokio::sync::watch` channel per target so the Blocking Retry Loop
/// can wait for a change without polling and without missing a write that lands between
/// its last read and the moment it starts waiting (§9): a fresh `watch::Receiver` is
/// always subscribed at the current value, and `changed()` only resolves once that exact
/// value has been superseded.
#[derive(Default)]
pub struct BlockingStateStore {
    targets: DashMap<BlockingTarget, watch::Sender<BlockingState>>,
}

impl BlockingStateStore {
    /// Build an empty store. Every target starts out absent, i.e. [`BlockingState::Blocking`].
    pub fn new() -> Self {
        BlockingStateStore::default()
    }

    /// Read the current state of `target`. Absent targets read as [`BlockingState::Blocking`].
    pub fn get(&self, target: &BlockingTarget) -> BlockingState {
        match self.targets.get(target) {
            Some(sender) => sender.borrow().clone(),
            None => BlockingState::Blocking,
        }
    }

    /// Unconditionally replace the state of `target`.
    pub fn set(&self, target: BlockingTarget, state: BlockingState) {
        match self.targets.entry(target) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                // `send` only errors when every receiver (including our own retained
                // sender) was dropped, which cannot happen here.
                let _ = entry.get().send(state);
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let (sender, _receiver) = watch::channel(state);
                entry.insert(sender);
            }
        }
    }

    /// Atomically read-modify-write the state of `target`.
    ///
    /// `f` observes the state as of the atomic read (absence read as
    /// [`BlockingState::Blocking`]) and returns the new state to install.
    pub fn update_and_get<F>(&self, target: &BlockingTarget, f: F) -> BlockingState
    where
        F: FnOnce(&BlockingState) -> BlockingState,
    {
        let entry = self
            .targets
            .entry(target.clone())
            .or_insert_with(|| watch::channel(BlockingState::Blocking).0);
        entry.send_if_modified(|current| {
            let next = f(current);
            let changed = next != *current;
            *current = next;
            changed
        });
        entry.borrow().clone()
    }

    /// Atomically replace the state of `target` with `new`, but only if it currently
    /// equals `expected`. Returns whether the swap happened.
    ///
    /// This is the primitive the `IgnoringOnce -> Blocking` consumption in the Blocking
    /// Retry Loop relies on (§9): a concurrent operator who installs `IgnoringAll` right
    /// after the loop observed `IgnoringOnce` must not be clobbered back to `Blocking`.
    pub fn compare_and_set(
        &self,
        target: &BlockingTarget,
        expected: &BlockingState,
        new: BlockingState,
    ) -> bool {
        let entry = self
            .targets
            .entry(target.clone())
            .or_insert_with(|| watch::channel(BlockingState::Blocking).0);
        let mut swapped = false;
        entry.send_if_modified(|current| {
            if current == expected {
                *current = new.clone();
                swapped = true;
                true
            } else {
                false
            }
        });
        swapped
    }

    /// Wait until `target`'s state changes from whatever it is right now.
    ///
    /// Must be called (to subscribe) before the caller's own decision-making read is
    /// considered stable; every change after subscription, including one that landed
    /// concurrently, is observed.
    pub async fn wait_for_change(&self, target: &BlockingTarget) {
        let mut receiver = {
            let entry = self
                .targets
                .entry(target.clone())
                .or_insert_with(|| watch::channel(BlockingState::Blocking).0);
            entry.subscribe()
        };
        // An error here means every sender was dropped, i.e. the store itself is gone;
        // there is nothing further to wait for.
        let _ = receiver.changed().await;
    }
}
