//! Bounded undo log.
//!
//! Each recorded mutation pushes one [`HistoryEntry`]; the log drops its
//! oldest entry past the capacity. Remote-originated mutations are applied
//! with `HistoryOpts::skip()` and never reach this log, so undo only ever
//! replays the local user's own edits.

use std::collections::VecDeque;

use crate::document::DocumentEvent;

/// One recorded local mutation.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub event: DocumentEvent,
}

/// Fixed-capacity mutation log.
#[derive(Debug)]
pub struct History {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
}

impl History {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(64)),
            capacity,
        }
    }

    /// Record a mutation, evicting the oldest entry when full.
    pub fn push(&mut self, event: DocumentEvent) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(HistoryEntry { event });
    }

    /// Most recent entry, without removing it.
    pub fn last(&self) -> Option<&HistoryEntry> {
        self.entries.back()
    }

    /// Remove and return the most recent entry.
    pub fn pop(&mut self) -> Option<HistoryEntry> {
        self.entries.pop_back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for History {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Table;

    fn sample_event() -> DocumentEvent {
        DocumentEvent::TablesAdded {
            tables: vec![Table::new("t")],
        }
    }

    #[test]
    fn test_push_and_len() {
        let mut history = History::new(10);
        assert!(history.is_empty());
        history.push(sample_event());
        history.push(sample_event());
        assert_eq!(history.len(), 2);
        assert!(history.last().is_some());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut history = History::new(3);
        for _ in 0..5 {
            history.push(sample_event());
        }
        assert_eq!(history.len(), 3);
    }

    #[test]
    fn test_pop() {
        let mut history = History::new(10);
        history.push(sample_event());
        assert!(history.pop().is_some());
        assert!(history.pop().is_none());
    }
}
