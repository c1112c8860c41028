use std::cmp::Ordering;

use super::error::{Nip77Error, Result};
use super::model::{Accumulator, Bound, EventId, FINGERPRINT_SIZE, ID_SIZE, Record, sort_records};

/// Ordered `(created_at, id)` set handed to the engine.
///
/// Items may only be inserted before [`seal`](Self::seal); every read
/// requires a sealed vector.
#[derive(Debug, Clone, Default)]
pub struct NegentropyStorage {
    records: Vec<Record>,
    sealed: bool,
}

impl NegentropyStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert one item. Only the first 32 bytes of `id` are kept.
    pub fn insert(&mut self, created_at: u64, id: &[u8]) -> Result<()> {
        if self.sealed {
            return Err(Nip77Error::AlreadySealed);
        }
        if id.len() < ID_SIZE {
            return Err(Nip77Error::InvalidIdLength(id.len()));
        }
        let mut prefix = [0u8; ID_SIZE];
        prefix.copy_from_slice(&id[..ID_SIZE]);
        self.records.push(Record::new(created_at, prefix));
        Ok(())
    }

    /// Sort and freeze. Duplicate items collapse into one.
    pub fn seal(&mut self) -> Result<()> {
        if self.sealed {
            return Err(Nip77Error::AlreadySealed);
        }
        sort_records(&mut self.records);
        self.records.dedup();
        self.sealed = true;
        Ok(())
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub(crate) fn record(&self, index: usize) -> &Record {
        &self.records[index]
    }

    /// First index in `[begin, end)` whose record is not below `bound`.
    pub(crate) fn find_lower_bound(&self, begin: usize, end: usize, bound: &Bound) -> usize {
        begin
            + self.records[begin..end]
                .partition_point(|record| bound.cmp_record(record) == Ordering::Less)
    }

    pub(crate) fn fingerprint(&self, begin: usize, end: usize) -> [u8; FINGERPRINT_SIZE] {
        let mut acc = Accumulator::default();
        for record in &self.records[begin..end] {
            acc.add(&record.id);
        }
        acc.fingerprint(end - begin)
    }

    pub(crate) fn ids(&self, begin: usize, end: usize) -> impl Iterator<Item = &EventId> {
        self.records[begin..end].iter().map(|record| &record.id)
    }
}
