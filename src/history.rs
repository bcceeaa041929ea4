//! Linear undo/redo history of cross-namespace parameter snapshots.
//!
//! The stack is append-only apart from truncation: pushing after navigating
//! backward discards everything after the cursor. Restoring an entry is the
//! orchestrator's job (it needs batch updates); this module only keeps the
//! entries and the cursor consistent.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::FlowError;
use crate::model::ParamValues;

/// Parameter values of one or more namespaces, keyed by namespace.
pub type HistoryState = BTreeMap<String, ParamValues>;

/// One snapshot on the history stack. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct HistoryEntry {
    pub state: HistoryState,
    /// Epoch milliseconds. Strictly increasing along the stack.
    pub time: i64,
}

/// Undo/redo state for the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct HistoryInfo {
    pub can_undo: bool,
    pub can_redo: bool,
    pub index: Option<usize>,
    pub len: usize,
}

pub const DEFAULT_MAX_HISTORY_ENTRIES: usize = 50;

/// Ordered history entries plus a cursor.
#[derive(Debug, Clone)]
pub struct HistoryStack {
    entries: Vec<HistoryEntry>,
    index: Option<usize>,
    max_entries: usize,
}

impl Default for HistoryStack {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HISTORY_ENTRIES)
    }
}

impl HistoryStack {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Vec::new(),
            index: None,
            max_entries: max_entries.max(1),
        }
    }

    /// Append a snapshot taken now. Entries after the cursor are discarded
    /// first; the cursor moves to the new tail.
    pub fn push(&mut self, state: HistoryState) -> HistoryEntry {
        self.push_at(state, now_ms())
    }

    /// Append a snapshot with an explicit timestamp. The stored time is bumped
    /// past the previous entry's if needed so lookups by time stay unambiguous.
    pub fn push_at(&mut self, state: HistoryState, time: i64) -> HistoryEntry {
        if let Some(index) = self.index {
            self.entries.truncate(index + 1);
        } else {
            self.entries.clear();
        }
        let time = match self.entries.last() {
            Some(last) if time <= last.time => last.time + 1,
            _ => time,
        };
        let entry = HistoryEntry { state, time };
        self.entries.push(entry.clone());
        if self.entries.len() > self.max_entries {
            let overflow = self.entries.len() - self.max_entries;
            self.entries.drain(..overflow);
        }
        self.index = Some(self.entries.len() - 1);
        entry
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn get(&self, index: usize) -> Option<&HistoryEntry> {
        self.entries.get(index)
    }

    pub fn index(&self) -> Option<usize> {
        self.index
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry at `index`, or the out-of-range error the restore operations report.
    pub fn entry(&self, index: usize) -> Result<&HistoryEntry, FlowError> {
        self.entries
            .get(index)
            .ok_or(FlowError::HistoryIndexOutOfRange {
                index,
                len: self.entries.len(),
            })
    }

    /// Move the cursor. Does not touch any parameter state.
    pub fn set_index(&mut self, index: usize) -> Result<(), FlowError> {
        self.entry(index)?;
        self.index = Some(index);
        Ok(())
    }

    pub fn find_by_time(&self, time: i64) -> Option<usize> {
        self.entries.iter().position(|e| e.time == time)
    }

    /// Most recent entry whose namespaces, keys and values all equal `state`.
    pub fn find_matching(&self, state: &HistoryState) -> Option<usize> {
        self.entries.iter().rposition(|e| &e.state == state)
    }

    pub fn undo_index(&self) -> Option<usize> {
        self.index.and_then(|i| i.checked_sub(1))
    }

    pub fn redo_index(&self) -> Option<usize> {
        let next = self.index.map_or(0, |i| i + 1);
        (next < self.entries.len()).then_some(next)
    }

    pub fn info(&self) -> HistoryInfo {
        HistoryInfo {
            can_undo: self.undo_index().is_some(),
            can_redo: self.redo_index().is_some(),
            index: self.index,
            len: self.entries.len(),
        }
    }

    /// Clear all entries and the cursor (e.g. on session teardown).
    pub fn reset(&mut self) {
        self.entries.clear();
        self.index = None;
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::model::ParamValue;

    fn state(namespace: &str, id: &str, value: f64) -> HistoryState {
        let mut values = ParamValues::new();
        values.insert(id.to_string(), ParamValue::Float(value));
        let mut state = HistoryState::new();
        state.insert(namespace.to_string(), values);
        state
    }

    #[test]
    fn test_push_advances_cursor() {
        let mut stack = HistoryStack::default();
        assert_eq!(stack.index(), None);
        stack.push_at(state("m1", "width", 10.0), 100);
        stack.push_at(state("m1", "width", 20.0), 200);
        assert_eq!(stack.len(), 2);
        assert_eq!(stack.index(), Some(1));
        assert!(stack.info().can_undo);
        assert!(!stack.info().can_redo);
    }

    #[test]
    #[allow(clippy::cast_precision_loss)]
    fn test_push_after_navigating_back_truncates() {
        let mut stack = HistoryStack::default();
        for (i, t) in [100, 200, 300, 400].iter().enumerate() {
            stack.push_at(state("m1", "width", i as f64), *t);
        }
        stack.set_index(1).unwrap();
        assert!(stack.info().can_redo);

        stack.push_at(state("m1", "width", 99.0), 500);
        assert_eq!(stack.len(), 3);
        assert_eq!(stack.index(), Some(2));
        assert_eq!(stack.entries()[2].state, state("m1", "width", 99.0));
        assert_eq!(stack.find_by_time(300), None);
        assert_eq!(stack.find_by_time(400), None);
    }

    #[test]
    fn test_times_strictly_increase() {
        let mut stack = HistoryStack::default();
        let a = stack.push_at(state("m1", "width", 1.0), 100);
        let b = stack.push_at(state("m1", "width", 2.0), 100);
        let c = stack.push_at(state("m1", "width", 3.0), 50);
        assert_eq!(a.time, 100);
        assert_eq!(b.time, 101);
        assert_eq!(c.time, 102);
    }

    #[test]
    fn test_bounded_length_drops_oldest() {
        let mut stack = HistoryStack::new(2);
        stack.push_at(state("m1", "width", 1.0), 1);
        stack.push_at(state("m1", "width", 2.0), 2);
        stack.push_at(state("m1", "width", 3.0), 3);
        assert_eq!(stack.len(), 2);
        assert_eq!(stack.entries()[0].time, 2);
        assert_eq!(stack.index(), Some(1));
    }

    #[test]
    fn test_out_of_range_index_is_error() {
        let mut stack = HistoryStack::default();
        stack.push_at(state("m1", "width", 1.0), 1);
        let err = stack.set_index(3).unwrap_err();
        assert_eq!(err, FlowError::HistoryIndexOutOfRange { index: 3, len: 1 });
        assert_eq!(stack.index(), Some(0));
    }

    #[test]
    fn test_find_matching_prefers_latest() {
        let mut stack = HistoryStack::default();
        stack.push_at(state("m1", "width", 1.0), 1);
        stack.push_at(state("m1", "width", 2.0), 2);
        stack.push_at(state("m1", "width", 1.0), 3);
        assert_eq!(stack.find_matching(&state("m1", "width", 1.0)), Some(2));
        assert_eq!(stack.find_matching(&state("m1", "width", 7.0)), None);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut stack = HistoryStack::default();
        stack.push_at(state("m1", "width", 1.0), 1);
        stack.reset();
        assert!(stack.is_empty());
        assert_eq!(stack.info(), HistoryInfo { can_undo: false, can_redo: false, index: None, len: 0 });
    }
}
