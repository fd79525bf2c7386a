use crate::session::CaptureArchiveEntry;
use std::collections::VecDeque;

/// How many captures the live view keeps around.
pub const DEFAULT_RETENTION: usize = 8;

/// Recent captures, newest first. Inserting past the retention bound evicts the oldest.
#[derive(Debug, Clone)]
pub struct Gallery {
    entries: VecDeque<CaptureArchiveEntry>,
    retention: usize,
}

impl Gallery {
    pub fn new(retention: usize) -> Self {
        let retention = retention.max(1);
        Self {
            entries: VecDeque::with_capacity(retention + 1),
            retention,
        }
    }

    /// Prepends `entry` and returns the evicted entry, if any.
    pub fn insert(&mut self, entry: CaptureArchiveEntry) -> Option<CaptureArchiveEntry> {
        self.entries.push_front(entry);
        if self.entries.len() > self.retention {
            self.entries.pop_back()
        } else {
            None
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &CaptureArchiveEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_vec(&self) -> Vec<CaptureArchiveEntry> {
        self.entries.iter().cloned().collect()
    }
}

impl Default for Gallery {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}
