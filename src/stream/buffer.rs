//! Accumulation buffer owned by the flush loop

use std::collections::VecDeque;

use super::Record;

/// Immutable snapshot of records handed to the sink in one append call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    records: Vec<Record>,
}

impl Batch {
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Ordered records waiting to be flushed.
///
/// Batches are cut from the front and a failed batch goes back to the
/// front, so retried records always precede anything that arrived later.
#[derive(Debug)]
pub struct Buffer {
    records: VecDeque<Record>,
    batch_size: usize,
}

impl Buffer {
    pub fn new(batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            records: VecDeque::with_capacity(batch_size),
            batch_size,
        }
    }

    pub fn push(&mut self, record: Record) {
        self.records.push_back(record);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// True once the buffer holds at least one full batch.
    pub fn is_full(&self) -> bool {
        self.records.len() >= self.batch_size
    }

    /// Remove up to `batch_size` records from the front.
    pub fn take_batch(&mut self) -> Batch {
        let n = self.records.len().min(self.batch_size);
        Batch {
            records: self.records.drain(..n).collect(),
        }
    }

    /// Put a batch back in front of everything still buffered, keeping its
    /// internal order.
    pub fn requeue_front(&mut self, batch: Batch) {
        for record in batch.records.into_iter().rev() {
            self.records.push_front(record);
        }
    }

    /// Drop everything, returning how many records were discarded.
    pub fn clear(&mut self) -> usize {
        let n = self.records.len();
        self.records.clear();
        n
    }
}
