//! Window buffer: the last N accepted readings, in arrival order.
//!
//! - `push` appends at the tail and evicts from the head while `len > N` (strict FIFO).
//! - No deduplication and no reordering by timestamp: the window counts arrivals.
//! - `snapshot` copies the contents, so a forecast keeps working on a frozen window
//!   even if the buffer moves on underneath it.

use std::collections::VecDeque;

use crate::ingest::reading::Reading;

/// View of the buffer right after a push.
#[derive(Debug)]
pub struct WindowState<'a> {
    pub readings: &'a VecDeque<Reading>,
    pub is_full: bool,
}

#[derive(Debug, Clone)]
pub struct WindowBuffer {
    capacity: usize,
    readings: VecDeque<Reading>,
}

impl WindowBuffer {
    /// `capacity` is clamped to at least one reading.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            readings: VecDeque::with_capacity(capacity + 1),
        }
    }

    pub fn push(&mut self, reading: Reading) -> WindowState<'_> {
        self.readings.push_back(reading);
        while self.readings.len() > self.capacity {
            self.readings.pop_front();
        }
        WindowState {
            readings: &self.readings,
            is_full: self.readings.len() == self.capacity,
        }
    }

    /// Copy-on-read: the returned vector is detached from the buffer.
    pub fn snapshot(&self) -> Vec<Reading> {
        self.readings.iter().cloned().collect()
    }

    pub fn is_full(&self) -> bool {
        self.readings.len() == self.capacity
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &Reading> {
        self.readings.iter()
    }
}
