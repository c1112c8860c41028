use std::collections::HashSet;

use super::codec::{Reader, put_varint};
use super::error::{Nip77Error, Result};
use super::model::{
    Bound, EventId, FINGERPRINT_SIZE, ID_SIZE, PROTOCOL_VERSION_1, RangeMode,
};
use super::storage::NegentropyStorage;

/// Smallest frame size limit accepted by [`Negentropy::new`]; 0 disables the limit.
pub const MIN_FRAME_SIZE_LIMIT: u64 = 4096;

const BUCKETS: usize = 16;
const FRAME_SIZE_SLACK: usize = 200;

/// Result of one initiator round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutput {
    /// Next message for the peer; empty once this side has converged.
    pub next: Vec<u8>,
    /// Ids we hold that the peer lacks, discovered this round.
    pub have: Vec<EventId>,
    /// Ids the peer holds that we lack, discovered this round.
    pub need: Vec<EventId>,
}

/// Range-based set reconciliation over a sealed [`NegentropyStorage`].
///
/// The initiator calls [`initiate`](Self::initiate) once and feeds each reply
/// to [`reconcile_with_ids`](Self::reconcile_with_ids). The responder answers
/// every incoming message with [`reconcile`](Self::reconcile).
#[derive(Debug)]
pub struct Negentropy {
    storage: NegentropyStorage,
    frame_size_limit: u64,
    is_initiator: bool,
    last_timestamp_in: u64,
    last_timestamp_out: u64,
}

impl Negentropy {
    pub fn new(storage: NegentropyStorage, frame_size_limit: u64) -> Result<Self> {
        if !storage.is_sealed() {
            return Err(Nip77Error::NotSealed);
        }
        if frame_size_limit != 0 && frame_size_limit < MIN_FRAME_SIZE_LIMIT {
            return Err(Nip77Error::FrameSizeLimitTooSmall(frame_size_limit));
        }
        Ok(Self {
            storage,
            frame_size_limit,
            is_initiator: false,
            last_timestamp_in: 0,
            last_timestamp_out: 0,
        })
    }

    pub fn storage(&self) -> &NegentropyStorage {
        &self.storage
    }

    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    /// First message of a session, covering the whole local set.
    pub fn initiate(&mut self) -> Result<Vec<u8>> {
        if self.is_initiator {
            return Err(Nip77Error::AlreadyInitiated);
        }
        self.is_initiator = true;
        self.last_timestamp_out = 0;

        let size = self.storage.len();
        let mut output = vec![PROTOCOL_VERSION_1];
        self.split_range(0, size, &Bound::infinity(), &mut output);
        Ok(output)
    }

    /// Responder step. The reply always carries at least the version byte.
    pub fn reconcile(&mut self, query: &[u8]) -> Result<Vec<u8>> {
        if self.is_initiator {
            return Err(Nip77Error::InitiatorCannotReconcile);
        }
        self.reconcile_aux(query, &mut Vec::new(), &mut Vec::new())
    }

    /// Initiator step, reporting the ids discovered on each side this round.
    pub fn reconcile_with_ids(&mut self, query: &[u8]) -> Result<ReconcileOutput> {
        if !self.is_initiator {
            return Err(Nip77Error::NotInitiator);
        }
        let mut have = Vec::new();
        let mut need = Vec::new();
        let next = self.reconcile_aux(query, &mut have, &mut need)?;
        Ok(ReconcileOutput { next, have, need })
    }

    fn reconcile_aux(
        &mut self,
        query: &[u8],
        have: &mut Vec<EventId>,
        need: &mut Vec<EventId>,
    ) -> Result<Vec<u8>> {
        self.last_timestamp_in = 0;
        self.last_timestamp_out = 0;

        let mut full_output = vec![PROTOCOL_VERSION_1];
        let mut reader = Reader::new(query);

        let version = reader.byte()?;
        if !(0x60..=0x6f).contains(&version) {
            return Err(Nip77Error::InvalidProtocolVersion(version));
        }
        if version != PROTOCOL_VERSION_1 {
            if self.is_initiator {
                return Err(Nip77Error::UnsupportedProtocolVersion(version));
            }
            // Answer with our version so the peer can downgrade.
            return Ok(full_output);
        }

        let storage_size = self.storage.len();
        let mut prev_bound = Bound::zero();
        let mut prev_index = 0;
        let mut skip = false;

        while !reader.is_empty() {
            let mut output = Vec::new();

            let curr_bound = Bound::decode(&mut reader, &mut self.last_timestamp_in)?;
            let mode = RangeMode::from_u64(reader.varint()?)?;

            let lower = prev_index;
            let mut upper = self
                .storage
                .find_lower_bound(prev_index, storage_size, &curr_bound);

            match mode {
                RangeMode::Skip => skip = true,
                RangeMode::Fingerprint => {
                    let theirs: [u8; FINGERPRINT_SIZE] = reader.array()?;
                    if theirs == self.storage.fingerprint(lower, upper) {
                        skip = true;
                    } else {
                        self.flush_skip(&mut skip, &prev_bound, &mut output);
                        self.split_range(lower, upper, &curr_bound, &mut output);
                    }
                }
                RangeMode::IdList => {
                    let count = reader.varint()?;
                    let mut theirs = Vec::new();
                    for _ in 0..count {
                        theirs.push(reader.array::<ID_SIZE>()?);
                    }

                    if self.is_initiator {
                        skip = true;
                        let theirs_set: HashSet<&EventId> = theirs.iter().collect();
                        let ours: HashSet<&EventId> = self.storage.ids(lower, upper).collect();
                        have.extend(
                            self.storage
                                .ids(lower, upper)
                                .filter(|id| !theirs_set.contains(id)),
                        );
                        need.extend(theirs.iter().filter(|id| !ours.contains(id)));
                    } else {
                        self.flush_skip(&mut skip, &prev_bound, &mut output);

                        let mut response_ids = Vec::new();
                        let mut response_count = 0u64;
                        let mut end_bound = curr_bound.clone();

                        for index in lower..upper {
                            if self.exceeded_frame_size_limit(full_output.len() + response_ids.len())
                            {
                                end_bound = Bound::from_record(self.storage.record(index));
                                upper = index;
                                break;
                            }
                            response_ids.extend_from_slice(&self.storage.record(index).id);
                            response_count += 1;
                        }

                        end_bound.encode_into(&mut output, &mut self.last_timestamp_out);
                        RangeMode::IdList.encode_into(&mut output);
                        put_varint(&mut output, response_count);
                        output.extend_from_slice(&response_ids);

                        full_output.append(&mut output);
                    }
                }
            }

            if self.exceeded_frame_size_limit(full_output.len() + output.len()) {
                // Hand the rest of the range back as one fingerprint.
                let remaining = self.storage.fingerprint(upper, storage_size);
                Bound::infinity().encode_into(&mut full_output, &mut self.last_timestamp_out);
                RangeMode::Fingerprint.encode_into(&mut full_output);
                full_output.extend_from_slice(&remaining);
                break;
            }

            full_output.append(&mut output);
            prev_index = upper;
            prev_bound = curr_bound;
        }

        if self.is_initiator && full_output.len() == 1 {
            return Ok(Vec::new());
        }
        Ok(full_output)
    }

    fn flush_skip(&mut self, skip: &mut bool, prev_bound: &Bound, output: &mut Vec<u8>) {
        if *skip {
            *skip = false;
            prev_bound.encode_into(output, &mut self.last_timestamp_out);
            RangeMode::Skip.encode_into(output);
        }
    }

    fn split_range(&mut self, lower: usize, upper: usize, upper_bound: &Bound, output: &mut Vec<u8>) {
        let num_elems = upper - lower;

        if num_elems < BUCKETS * 2 {
            upper_bound.encode_into(output, &mut self.last_timestamp_out);
            RangeMode::IdList.encode_into(output);
            put_varint(output, num_elems as u64);
            for id in self.storage.ids(lower, upper) {
                output.extend_from_slice(id);
            }
            return;
        }

        let items_per_bucket = num_elems / BUCKETS;
        let buckets_with_extra = num_elems % BUCKETS;
        let mut curr = lower;

        for i in 0..BUCKETS {
            let bucket_size = items_per_bucket + usize::from(i < buckets_with_extra);
            let fingerprint = self.storage.fingerprint(curr, curr + bucket_size);
            curr += bucket_size;

            let next_bound = if curr == upper {
                upper_bound.clone()
            } else {
                Bound::minimal(self.storage.record(curr - 1), self.storage.record(curr))
            };

            next_bound.encode_into(output, &mut self.last_timestamp_out);
            RangeMode::Fingerprint.encode_into(output);
            output.extend_from_slice(&fingerprint);
        }
    }

    fn exceeded_frame_size_limit(&self, n: usize) -> bool {
        self.frame_size_limit != 0
            && n as u64 > self.frame_size_limit.saturating_sub(FRAME_SIZE_SLACK as u64)
    }
}
