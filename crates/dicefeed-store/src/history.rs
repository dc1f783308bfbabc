//! Bounded, newest-first round history.
//!
//! The in-memory list is authoritative. Every mutation writes the full
//! snapshot to the sink; a failed write is logged and the next mutation
//! writes again.

use std::sync::Arc;

use dicefeed_core::{RoundResult, SessionId, HISTORY_CAPACITY};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::sink::HistorySink;

pub struct HistoryStore {
    rounds: RwLock<Vec<RoundResult>>,
    sink: Arc<dyn HistorySink>,
}

impl HistoryStore {
    /// Load the persisted snapshot. An unreadable snapshot starts empty.
    pub fn open(sink: Arc<dyn HistorySink>) -> Self {
        let mut rounds = match sink.load() {
            Ok(rounds) => rounds,
            Err(e) => {
                warn!(backend = sink.name(), error = %e, "failed to load history, starting empty");
                Vec::new()
            }
        };
        rounds.truncate(HISTORY_CAPACITY);
        info!(backend = sink.name(), rounds = rounds.len(), "history loaded");
        Self {
            rounds: RwLock::new(rounds),
            sink,
        }
    }

    /// Prepend a round, evicting the oldest past capacity.
    ///
    /// The round is kept in memory even when the write fails.
    pub fn insert(&self, round: RoundResult) -> Result<(), StoreError> {
        let snapshot = {
            let mut rounds = self.rounds.write();
            rounds.insert(0, round);
            rounds.truncate(HISTORY_CAPACITY);
            rounds.clone()
        };
        self.persist(&snapshot)
    }

    /// Swap the whole history for `entries` (already ordered newest first).
    pub fn replace(&self, mut entries: Vec<RoundResult>) -> Result<(), StoreError> {
        entries.truncate(HISTORY_CAPACITY);
        let snapshot = {
            let mut rounds = self.rounds.write();
            *rounds = entries;
            rounds.clone()
        };
        self.persist(&snapshot)
    }

    /// Independent copy of the history, newest first.
    pub fn read(&self) -> Vec<RoundResult> {
        self.rounds.read().clone()
    }

    pub fn latest(&self) -> Option<RoundResult> {
        self.rounds.read().first().cloned()
    }

    /// Session id of the newest round.
    pub fn latest_sid(&self) -> Option<SessionId> {
        self.rounds.read().first().map(RoundResult::sid)
    }

    pub fn len(&self) -> usize {
        self.rounds.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.read().is_empty()
    }

    fn persist(&self, snapshot: &[RoundResult]) -> Result<(), StoreError> {
        match self.sink.save(snapshot) {
            Ok(()) => {
                debug!(backend = self.sink.name(), rounds = snapshot.len(), "history persisted");
                Ok(())
            }
            Err(e) => {
                warn!(backend = self.sink.name(), error = %e, "failed to persist history");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use dicefeed_core::Dice;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn round(sid: u64) -> RoundResult {
        RoundResult::new(SessionId::new(sid), Dice::new(2, 4, 6).unwrap(), None)
    }

    fn sids(rounds: &[RoundResult]) -> Vec<u64> {
        rounds.iter().map(|r| r.sid().get()).collect()
    }

    /// Fails every save while `failing` is set.
    #[derive(Default)]
    struct FlakySink {
        failing: AtomicBool,
        inner: MemorySink,
    }

    impl HistorySink for FlakySink {
        fn load(&self) -> Result<Vec<RoundResult>, StoreError> {
            self.inner.load()
        }

        fn save(&self, rounds: &[RoundResult]) -> Result<(), StoreError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StoreError::Io("disk full".into()));
            }
            self.inner.save(rounds)
        }

        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    /// Load always fails.
    struct BrokenSink;

    impl HistorySink for BrokenSink {
        fn load(&self) -> Result<Vec<RoundResult>, StoreError> {
            Err(StoreError::Serialization("corrupt".into()))
        }

        fn save(&self, _rounds: &[RoundResult]) -> Result<(), StoreError> {
            Ok(())
        }

        fn name(&self) -> &'static str {
            "broken"
        }
    }

    #[test]
    fn insert_prepends_and_persists() {
        let sink = Arc::new(MemorySink::new());
        let store = HistoryStore::open(sink.clone());
        store.insert(round(1)).unwrap();
        store.insert(round(2)).unwrap();

        assert_eq!(sids(&store.read()), vec![2, 1]);
        assert_eq!(sids(&sink.snapshot()), vec![2, 1]);
        assert_eq!(store.latest_sid(), Some(SessionId::new(2)));
    }

    #[test]
    fn insert_evicts_oldest_past_capacity() {
        let store = HistoryStore::open(Arc::new(MemorySink::new()));
        for sid in 1..=(HISTORY_CAPACITY as u64 + 25) {
            store.insert(round(sid)).unwrap();
            assert!(store.len() <= HISTORY_CAPACITY);
        }
        let rounds = store.read();
        assert_eq!(rounds.len(), HISTORY_CAPACITY);
        assert_eq!(rounds[0].sid().get(), 125);
        assert_eq!(rounds[HISTORY_CAPACITY - 1].sid().get(), 26);
    }

    #[test]
    fn replace_swaps_everything() {
        let sink = Arc::new(MemorySink::new());
        let store = HistoryStore::open(sink.clone());
        store.insert(round(100)).unwrap();
        store.replace(vec![round(9), round(5), round(3), round(1)]).unwrap();

        assert_eq!(sids(&store.read()), vec![9, 5, 3, 1]);
        assert_eq!(sids(&sink.snapshot()), vec![9, 5, 3, 1]);
    }

    #[test]
    fn replace_caps_length() {
        let store = HistoryStore::open(Arc::new(MemorySink::new()));
        store
            .replace((0..300).rev().map(round).collect())
            .unwrap();
        assert_eq!(store.len(), HISTORY_CAPACITY);
    }

    #[test]
    fn read_returns_independent_copy() {
        let store = HistoryStore::open(Arc::new(MemorySink::new()));
        store.insert(round(1)).unwrap();
        let mut copy = store.read();
        copy.clear();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn open_loads_persisted_snapshot() {
        let sink = Arc::new(MemorySink::with_rounds((1..=130).rev().map(round).collect()));
        let store = HistoryStore::open(sink);
        assert_eq!(store.len(), HISTORY_CAPACITY);
        assert_eq!(store.latest().unwrap().sid().get(), 130);
    }

    #[test]
    fn unreadable_snapshot_starts_empty() {
        let store = HistoryStore::open(Arc::new(BrokenSink));
        assert!(store.is_empty());
        assert!(store.latest().is_none());
    }

    #[test]
    fn failed_write_keeps_memory_and_next_mutation_retries() {
        let sink = Arc::new(FlakySink::default());
        let store = HistoryStore::open(sink.clone());

        sink.failing.store(true, Ordering::SeqCst);
        assert!(store.insert(round(1)).is_err());
        assert_eq!(store.len(), 1);
        assert!(sink.inner.snapshot().is_empty());

        sink.failing.store(false, Ordering::SeqCst);
        store.insert(round(2)).unwrap();
        assert_eq!(sids(&sink.inner.snapshot()), vec![2, 1]);
    }
}
