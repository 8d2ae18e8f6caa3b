//! Client-side buffer of received batches, keyed by revision.

use crate::proto::ResponseBatch;
use std::collections::BTreeMap;

/// Revision-indexed store of [`ResponseBatch`]es.
///
/// Keys are unique and writes are last-write-wins: a second batch carrying a
/// revision already present replaces the first. Entries are never removed,
/// and since a well-behaved server only uses revisions 1..=3 the buffer stays
/// tiny.
#[derive(Debug, Default, Clone)]
pub struct VersionBuffer {
    batches: BTreeMap<u32, ResponseBatch>,
}

impl VersionBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `batch` under its revision, returning the batch it replaced.
    pub fn insert(&mut self, batch: ResponseBatch) -> Option<ResponseBatch> {
        self.batches.insert(batch.revision, batch)
    }

    pub fn get(&self, revision: u32) -> Option<&ResponseBatch> {
        self.batches.get(&revision)
    }

    /// The batch with the highest revision seen so far.
    pub fn latest(&self) -> Option<&ResponseBatch> {
        self.batches.last_key_value().map(|(_, batch)| batch)
    }

    /// Consumes the buffer, keeping only the highest revision.
    pub fn into_latest(mut self) -> Option<ResponseBatch> {
        self.batches.pop_last().map(|(_, batch)| batch)
    }

    pub fn highest_revision(&self) -> Option<u32> {
        self.batches.last_key_value().map(|(rev, _)| *rev)
    }

    /// Buffered revisions in ascending order.
    pub fn revisions(&self) -> Vec<u32> {
        self.batches.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::ResponseItem;

    fn batch(revision: u32, item_id: &str) -> ResponseBatch {
        ResponseBatch {
            items: vec![ResponseItem {
                subject_id: "B000123".into(),
                item_id: item_id.into(),
                score: 0.5,
            }],
            revision,
        }
    }

    #[test]
    fn duplicate_revision_replaces_earlier_batch() {
        let mut buffer = VersionBuffer::new();
        assert!(buffer.insert(batch(1, "first")).is_none());
        assert!(buffer.insert(batch(2, "second")).is_none());

        let replaced = buffer.insert(batch(1, "dup")).expect("revision 1 was present");
        assert_eq!(replaced.items[0].item_id, "first");

        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.get(1).unwrap().items[0].item_id, "dup");
        assert_eq!(buffer.get(2).unwrap().items[0].item_id, "second");

        // a late duplicate of a lower revision never affects selection
        let latest = buffer.latest().unwrap();
        assert_eq!(latest.revision, 2);
        assert_eq!(latest.items[0].item_id, "second");
    }

    #[test]
    fn latest_ignores_arrival_order() {
        let mut buffer = VersionBuffer::new();
        buffer.insert(batch(3, "c"));
        buffer.insert(batch(1, "a"));
        buffer.insert(batch(2, "b"));

        assert_eq!(buffer.highest_revision(), Some(3));
        assert_eq!(buffer.revisions(), vec![1, 2, 3]);
        assert_eq!(buffer.into_latest().unwrap().items[0].item_id, "c");
    }

    #[test]
    fn empty_buffer_has_no_latest() {
        let buffer = VersionBuffer::new();
        assert!(buffer.is_empty());
        assert!(buffer.latest().is_none());
        assert!(buffer.highest_revision().is_none());
        assert!(buffer.into_latest().is_none());
    }
}
