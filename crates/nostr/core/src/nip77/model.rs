use std::cmp::Ordering;

use sha2::{Digest, Sha256};

use super::codec::{Reader, encode_varint, put_varint};
use super::error::{Nip77Error, Result};

/// Leading byte of every message.
pub const PROTOCOL_VERSION_1: u8 = 0x61;

/// Upper bound that sorts after every real timestamp.
pub const TIMESTAMP_INFINITY: u64 = u64::MAX;

pub const ID_SIZE: usize = 32;
pub const FINGERPRINT_SIZE: usize = 16;

pub type EventId = [u8; ID_SIZE];

/// Exclusive upper end of a range: a timestamp plus enough of an id to
/// separate neighbours sharing that timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bound {
    pub timestamp: u64,
    pub id_prefix: Vec<u8>,
}

impl Bound {
    pub fn new(timestamp: u64, id_prefix: Vec<u8>) -> Result<Self> {
        check_prefix_len(id_prefix.len() as u64)?;
        Ok(Self {
            timestamp,
            id_prefix,
        })
    }

    fn at(timestamp: u64) -> Self {
        Self {
            timestamp,
            id_prefix: Vec::new(),
        }
    }

    pub fn zero() -> Self {
        Self::at(0)
    }

    pub fn infinity() -> Self {
        Self::at(TIMESTAMP_INFINITY)
    }

    /// Bound sitting exactly on `record`.
    pub fn from_record(record: &Record) -> Self {
        Self {
            timestamp: record.timestamp,
            id_prefix: record.id.to_vec(),
        }
    }

    /// Shortest bound that sorts after `prev` and at or before `curr`.
    pub fn minimal(prev: &Record, curr: &Record) -> Self {
        if curr.timestamp != prev.timestamp {
            return Self::at(curr.timestamp);
        }

        let shared = curr
            .id
            .iter()
            .zip(prev.id.iter())
            .take_while(|(a, b)| a == b)
            .count();
        Self {
            timestamp: curr.timestamp,
            id_prefix: curr.id[..(shared + 1).min(ID_SIZE)].to_vec(),
        }
    }

    /// Append the wire form. `last_timestamp` carries the delta-encoding state
    /// across bounds of one message and becomes sticky at infinity.
    pub fn encode_into(&self, out: &mut Vec<u8>, last_timestamp: &mut u64) {
        if self.timestamp == TIMESTAMP_INFINITY {
            *last_timestamp = TIMESTAMP_INFINITY;
            put_varint(out, 0);
        } else {
            let delta = self.timestamp.saturating_sub(*last_timestamp);
            *last_timestamp = self.timestamp;
            put_varint(out, delta.saturating_add(1));
        }
        put_varint(out, self.id_prefix.len() as u64);
        out.extend_from_slice(&self.id_prefix);
    }

    pub(crate) fn decode(reader: &mut Reader<'_>, last_timestamp: &mut u64) -> Result<Self> {
        let timestamp = match (reader.varint()?, *last_timestamp) {
            (0, _) | (_, TIMESTAMP_INFINITY) => TIMESTAMP_INFINITY,
            (delta, last) => (delta - 1).saturating_add(last),
        };
        *last_timestamp = timestamp;

        let prefix_len = reader.varint()?;
        check_prefix_len(prefix_len)?;
        let id_prefix = reader.bytes(prefix_len as usize)?.to_vec();
        Ok(Self {
            timestamp,
            id_prefix,
        })
    }

    /// Order of `record` relative to this bound. The prefix is compared as if
    /// zero-padded to a full id.
    pub fn cmp_record(&self, record: &Record) -> Ordering {
        record.timestamp.cmp(&self.timestamp).then_with(|| {
            let mut padded = [0u8; ID_SIZE];
            padded[..self.id_prefix.len()].copy_from_slice(&self.id_prefix);
            record.id.cmp(&padded)
        })
    }
}

fn check_prefix_len(len: u64) -> Result<()> {
    if len > ID_SIZE as u64 {
        return Err(Nip77Error::InvalidBound(format!(
            "id prefix of {len} bytes exceeds {ID_SIZE}"
        )));
    }
    Ok(())
}

/// How a range is described on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeMode {
    Skip = 0,
    Fingerprint = 1,
    IdList = 2,
}

impl RangeMode {
    pub(crate) fn from_u64(value: u64) -> Result<Self> {
        match value {
            0 => Ok(Self::Skip),
            1 => Ok(Self::Fingerprint),
            2 => Ok(Self::IdList),
            _ => Err(Nip77Error::InvalidMode(value)),
        }
    }

    pub(crate) fn encode_into(self, out: &mut Vec<u8>) {
        put_varint(out, self as u64);
    }
}

/// One reconciled item. Field order makes the derived `Ord` the protocol
/// order: timestamp first, then id bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Record {
    pub timestamp: u64,
    pub id: EventId,
}

impl Record {
    pub fn new(timestamp: u64, id: EventId) -> Self {
        Self { timestamp, id }
    }
}

pub fn sort_records(records: &mut [Record]) {
    records.sort_unstable();
}

/// Running sum of ids mod 2^256, read as little-endian integers.
#[derive(Debug, Default)]
pub(crate) struct Accumulator {
    sum: [u8; ID_SIZE],
}

impl Accumulator {
    pub(crate) fn add(&mut self, id: &EventId) {
        let mut carry = 0u16;
        for (acc, byte) in self.sum.iter_mut().zip(id.iter()) {
            let s = u16::from(*acc) + u16::from(*byte) + carry;
            *acc = s as u8;
            carry = s >> 8;
        }
    }

    pub(crate) fn fingerprint(&self, count: usize) -> [u8; FINGERPRINT_SIZE] {
        let hash = Sha256::new()
            .chain_update(self.sum)
            .chain_update(encode_varint(count as u64))
            .finalize();
        let mut fingerprint = [0u8; FINGERPRINT_SIZE];
        fingerprint.copy_from_slice(&hash[..FINGERPRINT_SIZE]);
        fingerprint
    }
}

/// First 16 bytes of `sha256(sum(ids) mod 2^256 || varint(len))`, the sum
/// taken over ids read as little-endian integers.
pub fn calculate_fingerprint(ids: &[EventId]) -> [u8; FINGERPRINT_SIZE] {
    let mut acc = Accumulator::default();
    ids.iter().for_each(|id| acc.add(id));
    acc.fingerprint(ids.len())
}
