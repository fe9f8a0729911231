//! # Command Stream
//!
//! Append-only list of records waiting for the next flush.

use alloc::vec::Vec;

use basalt_core::{Error, Result};

use crate::record::Record;

/// Bounded, append-only record buffer
#[derive(Debug)]
pub struct CommandStream {
    records: Vec<Record>,
    capacity: usize,
}

impl CommandStream {
    /// Create a stream holding up to `capacity` records
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Vec::new(),
            capacity: capacity.max(1),
        }
    }

    /// Append a record
    pub fn push(&mut self, record: Record) -> Result<()> {
        if self.records.len() >= self.capacity {
            return Err(Error::CommandStreamFull);
        }
        self.records.push(record);
        Ok(())
    }

    /// Free record slots
    pub fn remaining(&self) -> usize {
        self.capacity - self.records.len()
    }

    /// Number of pending records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if nothing is pending
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Pending records
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Take every pending record, leaving the stream empty
    pub fn take(&mut self) -> Vec<Record> {
        core::mem::take(&mut self.records)
    }

    /// Put records returned by a failed submission back in front
    pub fn restore(&mut self, mut records: Vec<Record>) {
        records.append(&mut self.records);
        self.records = records;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_push() {
        let mut stream = CommandStream::new(2);
        stream.push(Record::Serialize).unwrap();
        stream.push(Record::Serialize).unwrap();
        assert_eq!(stream.push(Record::Serialize), Err(Error::CommandStreamFull));
        assert_eq!(stream.remaining(), 0);
        assert_eq!(stream.take().len(), 2);
        assert!(stream.is_empty());
        assert_eq!(stream.remaining(), 2);
    }
}
