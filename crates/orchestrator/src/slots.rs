//! Work-unit index distribution.

use std::collections::BTreeSet;
use std::sync::{Mutex, PoisonError};

#[derive(Debug)]
struct SlotState {
    next: usize,
    /// Indices handed back by workers that found no free resource
    returned: BTreeSet<usize>,
}

/// Hands out slot indices `0..target` exactly once each, in increasing order.
///
/// All mutation goes through one mutex. A returned index is handed out again
/// before any fresh one, so nothing is ever outstanding twice.
#[derive(Debug)]
pub struct SlotTracker {
    target: usize,
    state: Mutex<SlotState>,
}

impl SlotTracker {
    pub fn new(target: usize) -> Self {
        Self {
            target,
            state: Mutex::new(SlotState {
                next: 0,
                returned: BTreeSet::new(),
            }),
        }
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub fn claim_next(&self) -> Option<usize> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(index) = state.returned.pop_first() {
            return Some(index);
        }
        if state.next >= self.target {
            return None;
        }
        let index = state.next;
        state.next += 1;
        Some(index)
    }

    /// Requeue a claimed index that was never attempted.
    pub fn return_slot(&self, index: usize) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if index >= state.next {
            return;
        }
        if index + 1 == state.next {
            state.next -= 1;
        } else {
            state.returned.insert(index);
        }
    }

    /// Value of the next fresh index (`≤ target`).
    pub fn next_index(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next
    }

    /// Slots not yet handed out (fresh or returned).
    pub fn remaining(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.target - state.next + state.returned.len()
    }
}
