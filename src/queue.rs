//! Ordered store of pending downloads.
//!
//! Every mutating call publishes exactly one [`QueueChangedEvent`], after the
//! internal lock is released, whether or not the mutation succeeded.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::engine::TransferProgress;
use crate::library::EpisodeId;
use crate::progress::{ProgressEvent, QueueChangedEvent, SharedProgressReporter};

/// Where a new entry lands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePosition {
    First,
    Last,
    /// Caller does not care; appended
    Anywhere,
    /// Explicit user request: goes to the front and bypasses the Wi-Fi-only rule
    StartedManually,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub episode_id: EpisodeId,
    pub enqueued_at: DateTime<Utc>,
    pub started_manually: bool,
    /// Transient; only meaningful for the active entry
    pub progress: TransferProgress,
}

impl QueueEntry {
    fn new(episode_id: EpisodeId, started_manually: bool) -> Self {
        Self {
            episode_id,
            enqueued_at: Utc::now(),
            started_manually,
            progress: TransferProgress::default(),
        }
    }
}

/// Result of a conditional pop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PopOutcome {
    Empty,
    /// The head exists but was not admitted; it stays in place
    Deferred,
    Popped(QueueEntry),
}

#[derive(Debug, Default)]
struct QueueState {
    entries: VecDeque<QueueEntry>,
    /// Episode popped for transfer and not yet released
    in_flight: Option<EpisodeId>,
}

impl QueueState {
    fn holds(&self, episode_id: &EpisodeId) -> bool {
        self.in_flight.as_ref() == Some(episode_id)
            || self.entries.iter().any(|e| &e.episode_id == episode_id)
    }
}

pub struct QueueStore {
    state: Mutex<QueueState>,
    reporter: SharedProgressReporter,
}

impl QueueStore {
    pub fn new(reporter: SharedProgressReporter) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            reporter,
        }
    }

    /// Insert an episode. Rejected when it is already queued or in flight.
    pub fn enqueue(&self, episode_id: EpisodeId, position: QueuePosition) -> bool {
        let added = {
            let mut state = self.lock();
            if state.holds(&episode_id) {
                tracing::debug!(episode = %episode_id, "Already queued, ignoring");
                false
            } else {
                let entry = QueueEntry::new(episode_id, position == QueuePosition::StartedManually);
                match position {
                    QueuePosition::First | QueuePosition::StartedManually => {
                        state.entries.push_front(entry)
                    }
                    QueuePosition::Last | QueuePosition::Anywhere => state.entries.push_back(entry),
                }
                true
            }
        };
        self.publish();
        added
    }

    pub fn remove_at(&self, index: usize) -> Option<QueueEntry> {
        let removed = self.lock().entries.remove(index);
        self.publish();
        removed
    }

    pub fn remove_episode(&self, episode_id: &EpisodeId) -> bool {
        let removed = {
            let mut state = self.lock();
            let position = state.entries.iter().position(|e| &e.episode_id == episode_id);
            position.and_then(|i| state.entries.remove(i)).is_some()
        };
        self.publish();
        removed
    }

    /// Move the entry at `from` to index `to`. Both must be in range.
    pub fn move_entry(&self, from: usize, to: usize) -> bool {
        let moved = {
            let mut state = self.lock();
            let len = state.entries.len();
            if from >= len || to >= len {
                false
            } else {
                if let Some(entry) = state.entries.remove(from) {
                    state.entries.insert(to, entry);
                }
                true
            }
        };
        self.publish();
        moved
    }

    /// Remove and return the head, marking it in flight
    pub fn pop_first(&self) -> Option<QueueEntry> {
        let popped = {
            let mut state = self.lock();
            let entry = state.entries.pop_front();
            if let Some(entry) = &entry {
                state.in_flight = Some(entry.episode_id.clone());
            }
            entry
        };
        self.publish();
        popped
    }

    /// Pop the head only if `admit` accepts it.
    ///
    /// Inspection and removal happen under one lock, so a concurrent
    /// mutation cannot slip in between.
    pub fn pop_first_if(&self, admit: impl FnOnce(&QueueEntry) -> bool) -> PopOutcome {
        let outcome = {
            let mut state = self.lock();
            let admitted = state.entries.front().map(admit);
            match admitted {
                None => PopOutcome::Empty,
                Some(false) => PopOutcome::Deferred,
                Some(true) => match state.entries.pop_front() {
                    Some(entry) => {
                        state.in_flight = Some(entry.episode_id.clone());
                        PopOutcome::Popped(entry)
                    }
                    None => PopOutcome::Empty,
                },
            }
        };

        if matches!(outcome, PopOutcome::Popped(_)) {
            self.publish();
        }
        outcome
    }

    /// Clear the in-flight marker once the transfer ended
    pub fn release(&self, episode_id: &EpisodeId) -> bool {
        let released = {
            let mut state = self.lock();
            if state.in_flight.as_ref() == Some(episode_id) {
                state.in_flight = None;
                true
            } else {
                false
            }
        };
        self.publish();
        released
    }

    pub fn get(&self, index: usize) -> Option<QueueEntry> {
        self.lock().entries.get(index).cloned()
    }

    pub fn snapshot(&self) -> Vec<QueueEntry> {
        self.lock().entries.iter().cloned().collect()
    }

    /// Pending entries; the in-flight episode is not counted
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Whether the episode waits in the queue (not counting in flight)
    pub fn is_queued(&self, episode_id: &EpisodeId) -> bool {
        self.lock().entries.iter().any(|e| &e.episode_id == episode_id)
    }

    pub fn contains(&self, episode_id: &EpisodeId) -> bool {
        self.lock().holds(episode_id)
    }

    /// Episode ids of every pending entry plus the in-flight one
    pub fn episode_ids(&self) -> Vec<EpisodeId> {
        let state = self.lock();
        state
            .in_flight
            .iter()
            .cloned()
            .chain(state.entries.iter().map(|e| e.episode_id.clone()))
            .collect()
    }

    /// Publish the current size to the reporter
    pub fn publish(&self) {
        let queue_size = self.len();
        self.reporter
            .report(ProgressEvent::QueueChanged(QueueChangedEvent { queue_size }));
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressReporter;
    use std::sync::Arc;

    #[derive(Default)]
    struct CountingReporter {
        sizes: Mutex<Vec<usize>>,
    }

    impl ProgressReporter for CountingReporter {
        fn report(&self, event: ProgressEvent) {
            if let ProgressEvent::QueueChanged(e) = event {
                self.sizes.lock().unwrap().push(e.queue_size);
            }
        }
    }

    fn store() -> (QueueStore, Arc<CountingReporter>) {
        let reporter = Arc::new(CountingReporter::default());
        (QueueStore::new(reporter.clone()), reporter)
    }

    fn ids(store: &QueueStore) -> Vec<String> {
        store
            .snapshot()
            .into_iter()
            .map(|e| e.episode_id.to_string())
            .collect()
    }

    #[test]
    fn move_remove_and_pop_sequence() {
        let (store, _) = store();
        for id in ["A", "B", "C"] {
            assert!(store.enqueue(id.into(), QueuePosition::Last));
        }

        assert!(store.move_entry(2, 0));
        assert_eq!(ids(&store), ["C", "A", "B"]);

        assert!(store.remove_episode(&"A".into()));
        assert_eq!(ids(&store), ["C", "B"]);

        let popped = store.pop_first().unwrap();
        assert_eq!(popped.episode_id.as_str(), "C");
        assert_eq!(ids(&store), ["B"]);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn entries_pop_in_insertion_order() {
        let (store, _) = store();
        store.enqueue("A".into(), QueuePosition::Last);
        store.enqueue("B".into(), QueuePosition::Anywhere);
        store.enqueue("C".into(), QueuePosition::Last);

        let mut order = Vec::new();
        while let Some(entry) = store.pop_first() {
            store.release(&entry.episode_id);
            order.push(entry.episode_id.to_string());
        }
        assert_eq!(order, ["A", "B", "C"]);
    }

    #[test]
    fn front_positions_jump_the_queue() {
        let (store, _) = store();
        store.enqueue("A".into(), QueuePosition::Last);
        store.enqueue("B".into(), QueuePosition::First);
        store.enqueue("C".into(), QueuePosition::StartedManually);

        assert_eq!(ids(&store), ["C", "B", "A"]);
        assert!(store.get(0).unwrap().started_manually);
        assert!(!store.get(1).unwrap().started_manually);
    }

    #[test]
    fn duplicates_are_rejected_while_queued_or_in_flight() {
        let (store, _) = store();
        assert!(store.enqueue("A".into(), QueuePosition::Last));
        assert!(!store.enqueue("A".into(), QueuePosition::First));

        store.pop_first();
        assert!(store.contains(&"A".into()));
        assert!(!store.is_queued(&"A".into()));
        assert!(!store.enqueue("A".into(), QueuePosition::Last));

        store.release(&"A".into());
        assert!(store.enqueue("A".into(), QueuePosition::Last));
    }

    #[test]
    fn move_out_of_bounds_fails_and_still_publishes() {
        let (store, reporter) = store();
        store.enqueue("A".into(), QueuePosition::Last);
        store.enqueue("B".into(), QueuePosition::Last);
        reporter.sizes.lock().unwrap().clear();

        assert!(!store.move_entry(2, 0));
        assert!(!store.move_entry(0, 2));
        assert!(store.remove_at(5).is_none());
        assert_eq!(ids(&store), ["A", "B"]);
        assert_eq!(*reporter.sizes.lock().unwrap(), vec![2, 2, 2]);
    }

    #[test]
    fn every_mutation_publishes_once() {
        let (store, reporter) = store();
        store.enqueue("A".into(), QueuePosition::Last);
        store.enqueue("A".into(), QueuePosition::Last);
        store.remove_episode(&"missing".into());
        store.remove_at(0);

        assert_eq!(*reporter.sizes.lock().unwrap(), vec![1, 1, 1, 0]);
    }

    #[test]
    fn conditional_pop_defers_without_removing() {
        let (store, _) = store();
        assert_eq!(store.pop_first_if(|_| true), PopOutcome::Empty);

        store.enqueue("auto".into(), QueuePosition::Last);
        assert_eq!(store.pop_first_if(|e| e.started_manually), PopOutcome::Deferred);
        assert_eq!(store.len(), 1);

        store.enqueue("manual".into(), QueuePosition::StartedManually);
        match store.pop_first_if(|e| e.started_manually) {
            PopOutcome::Popped(entry) => assert_eq!(entry.episode_id.as_str(), "manual"),
            other => panic!("Expected pop, got {other:?}"),
        }
        assert_eq!(store.episode_ids(), vec![EpisodeId::from("manual"), EpisodeId::from("auto")]);
    }
}
