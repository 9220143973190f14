// Copyright (c) 2024 Graphcore Ltd. All rights reserved.

//! A FIFO whose entries mature at an explicit cycle.
//!
//! Pipeline stages are modelled as one of these queues: work is pushed in a
//! *pending* state when it enters the stage, given a due cycle when the stage
//! accepts it, and drained once the current cycle reaches the due cycle.
//! Entries are kept in arrival order; a pending entry at the head blocks the
//! entries behind it, which preserves per-stage ordering.

use std::collections::VecDeque;

use crate::time::Cycle;

/// The decision made for a pending entry when a stage schedules it.
pub enum Timing {
    /// The entry matures at the given cycle.
    At(Cycle),
    /// The entry is removed from the stage without maturing.
    Cancel,
}

struct Entry<T> {
    /// `None` while the entry is pending.
    due: Option<Cycle>,
    item: T,
}

/// An ordered queue of delayed work items.
pub struct DelayQueue<T> {
    entries: VecDeque<Entry<T>>,
}

impl<T> DelayQueue<T> {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    /// Whether the queue holds no entries at all.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries, pending or scheduled.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Add a pending entry; it will not mature until scheduled.
    pub fn push(&mut self, item: T) {
        self.entries.push_back(Entry { due: None, item });
    }

    /// Add an entry with a known due cycle.
    pub fn push_at(&mut self, due: Cycle, item: T) {
        if let Some(back) = self.entries.back() {
            assert!(back.due.is_none_or(|d| d <= due));
        }
        self.entries.push_back(Entry {
            due: Some(due),
            item,
        });
    }

    /// Visit every pending entry and either give it a due cycle or cancel it.
    ///
    /// Scheduled entries are not visited.
    pub fn schedule(&mut self, mut decide: impl FnMut(&mut T) -> Timing) {
        self.entries.retain_mut(|entry| {
            if entry.due.is_some() {
                return true;
            }
            match decide(&mut entry.item) {
                Timing::At(due) => {
                    entry.due = Some(due);
                    true
                }
                Timing::Cancel => false,
            }
        });
    }

    /// Remove and return the head entry if it matures at `now`.
    ///
    /// A pending head blocks the queue; call again after the next
    /// [`schedule`](Self::schedule) pass.
    pub fn pop_due(&mut self, now: Cycle) -> Option<T> {
        let head = self.entries.front()?;
        match head.due {
            Some(due) if due == now => {
                let entry = self.entries.pop_front();
                entry.map(|e| e.item)
            }
            Some(due) => {
                assert!(due > now, "stage entry overdue: {due} < {now}");
                None
            }
            None => None,
        }
    }

    /// Iterate over the items in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().map(|e| &e.item)
    }

    /// Iterate mutably over the items in arrival order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.entries.iter_mut().map(|e| &mut e.item)
    }

    /// Iterate mutably over the items together with their due cycle.
    ///
    /// Used by stages that re-validate already-scheduled work just before it
    /// matures.
    pub fn iter_with_due_mut(&mut self) -> impl Iterator<Item = (Option<Cycle>, &mut T)> {
        self.entries.iter_mut().map(|e| (e.due, &mut e.item))
    }

    /// Remove entries for which the predicate returns false.
    pub fn retain(&mut self, mut keep: impl FnMut(&T) -> bool) {
        self.entries.retain(|e| keep(&e.item));
    }
}

impl<T> Default for DelayQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
