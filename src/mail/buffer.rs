//! Append-only record buffer with lock-free snapshot reads.

use crate::MessageRecord;

use arc_swap::ArcSwap;
use std::sync::Arc;

/// Ordered, deduplicated records for one mailbox.
///
/// The owning poller is the only writer; readers take an `Arc` snapshot that
/// never changes underneath them.
#[derive(Debug, Default)]
pub struct MessageBuffer {
    records: ArcSwap<Vec<MessageRecord>>,
}

impl MessageBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append records not already present, keeping insertion order.
    /// Returns how many were added.
    pub fn append_unique(&self, incoming: impl IntoIterator<Item = MessageRecord>) -> usize {
        let incoming: Vec<MessageRecord> = incoming.into_iter().collect();
        if incoming.is_empty() {
            return 0;
        }

        let mut added = 0;
        self.records.rcu(|current| {
            let mut next = Vec::clone(current);
            added = 0;
            for record in &incoming {
                if !next.contains(record) {
                    next.push(record.clone());
                    added += 1;
                }
            }
            next
        });
        added
    }

    pub fn snapshot(&self) -> Arc<Vec<MessageRecord>> {
        self.records.load_full()
    }

    pub fn len(&self) -> usize {
        self.records.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
