use std::collections::BTreeSet;

use sha2::{Digest, Sha256};

use super::codec::Reader;
use super::*;

fn test_id(n: u32) -> EventId {
    let mut id = [0u8; 32];
    id.copy_from_slice(&Sha256::digest(n.to_le_bytes()));
    id
}

fn sealed(items: &[(u64, EventId)]) -> NegentropyStorage {
    let mut storage = NegentropyStorage::new();
    for (created_at, id) in items {
        storage.insert(*created_at, id).unwrap();
    }
    storage.seal().unwrap();
    storage
}

fn items(range: std::ops::Range<u32>) -> Vec<(u64, EventId)> {
    range
        .map(|n| (1_700_000_000 + u64::from(n / 3), test_id(n)))
        .collect()
}

struct SyncRun {
    have: BTreeSet<EventId>,
    need: BTreeSet<EventId>,
    rounds: usize,
}

fn run_sync(client_items: &[(u64, EventId)], server_items: &[(u64, EventId)], limit: u64) -> SyncRun {
    let mut client = Negentropy::new(sealed(client_items), limit).unwrap();
    let mut server = Negentropy::new(sealed(server_items), limit).unwrap();

    let mut message = client.initiate().unwrap();
    let mut run = SyncRun {
        have: BTreeSet::new(),
        need: BTreeSet::new(),
        rounds: 0,
    };

    loop {
        if limit != 0 {
            assert!(message.len() as u64 <= limit, "client frame too large");
        }
        let reply = server.reconcile(&message).unwrap();
        if limit != 0 {
            assert!(reply.len() as u64 <= limit, "server frame too large");
        }
        run.rounds += 1;

        let output = client.reconcile_with_ids(&reply).unwrap();
        run.have.extend(output.have);
        run.need.extend(output.need);
        if output.next.is_empty() {
            break;
        }
        message = output.next;
        assert!(run.rounds < 200, "reconciliation did not converge");
    }

    run
}

fn ids_of(items: &[(u64, EventId)]) -> BTreeSet<EventId> {
    items.iter().map(|(_, id)| *id).collect()
}

// === Codec ===

#[test]
fn test_varint_encode_known_values() {
    assert_eq!(encode_varint(0), vec![0]);
    assert_eq!(encode_varint(127), vec![127]);
    assert_eq!(encode_varint(128), vec![0x81, 0x00]);
    assert_eq!(encode_varint(300), vec![0x82, 0x2C]);
    assert_eq!(encode_varint(u64::MAX).len(), 10);
}

#[test]
fn test_varint_roundtrip_edges() {
    for value in [0, 1, 127, 128, 16383, 16384, u64::from(u32::MAX), u64::MAX] {
        let encoded = encode_varint(value);
        assert_eq!(decode_varint(&encoded).unwrap(), (value, encoded.len()));
    }
}

#[test]
fn test_varint_decode_errors() {
    assert!(matches!(decode_varint(&[]), Err(Nip77Error::VarintDecode(_))));
    assert!(matches!(decode_varint(&[0x80]), Err(Nip77Error::VarintDecode(_))));
    assert!(decode_varint(&[0x81, 0x80]).is_err());
    assert!(decode_varint(&[0x80; 11]).is_err());
    assert!(decode_varint(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x7F]).is_err());
}

#[test]
fn test_reader_reports_truncation() {
    let mut reader = Reader::new(&[0x01, 0x02]);
    assert_eq!(reader.byte().unwrap(), 0x01);
    assert!(matches!(
        reader.bytes(4),
        Err(Nip77Error::Truncated {
            needed: 4,
            remaining: 1
        })
    ));
}

// === Model ===

#[test]
fn test_fingerprint_is_order_independent() {
    let fp = calculate_fingerprint(&[[0x01; 32], [0x02; 32], [0x03; 32]]);
    assert_eq!(fp, calculate_fingerprint(&[[0x03; 32], [0x01; 32], [0x02; 32]]));
}

#[test]
fn test_fingerprint_includes_count() {
    let fp1 = calculate_fingerprint(&[[0x01; 32]]);
    let fp2 = calculate_fingerprint(&[[0x01; 32], [0x01; 32]]);
    assert_ne!(fp1, fp2);
}

#[test]
fn test_fingerprint_carries_across_bytes() {
    let mut max = [0u8; 32];
    max[0] = 0xFF;
    let mut one = [0u8; 32];
    one[0] = 0x01;
    let mut expected_sum = [0u8; 32];
    expected_sum[1] = 0x01;

    let mut hasher = Sha256::new();
    hasher.update(expected_sum);
    hasher.update([2u8]);
    let hash = hasher.finalize();

    assert_eq!(calculate_fingerprint(&[max, one]).as_slice(), &hash[..16]);
}

#[test]
fn test_record_sorting() {
    let mut records = vec![
        Record::new(100, [0x03; 32]),
        Record::new(50, [0x01; 32]),
        Record::new(100, [0x01; 32]),
        Record::new(200, [0x02; 32]),
    ];

    sort_records(&mut records);

    assert_eq!(records[0].timestamp, 50);
    assert_eq!(records[1], Record::new(100, [0x01; 32]));
    assert_eq!(records[2], Record::new(100, [0x03; 32]));
    assert_eq!(records[3].timestamp, 200);
}

#[test]
fn test_minimal_bound_uses_timestamp_when_different() {
    let bound = Bound::minimal(&Record::new(10, [0xAA; 32]), &Record::new(11, [0x00; 32]));
    assert_eq!(bound, Bound::new(11, vec![]).unwrap());
}

#[test]
fn test_minimal_bound_uses_shared_prefix_plus_one() {
    let mut prev = [0x00; 32];
    let mut curr = [0x00; 32];
    prev[..3].copy_from_slice(&[0x12, 0x34, 0x50]);
    curr[..3].copy_from_slice(&[0x12, 0x34, 0x60]);

    let bound = Bound::minimal(&Record::new(7, prev), &Record::new(7, curr));
    assert_eq!(bound.id_prefix, vec![0x12, 0x34, 0x60]);
    assert_eq!(bound.cmp_record(&Record::new(7, prev)), std::cmp::Ordering::Less);
    assert_ne!(bound.cmp_record(&Record::new(7, curr)), std::cmp::Ordering::Less);
}

#[test]
fn test_bound_rejects_long_prefix() {
    assert!(Bound::new(1, vec![0; 33]).is_err());
}

#[test]
fn test_bound_timestamps_are_delta_encoded() {
    let mut out = Vec::new();
    let mut last = 0;
    Bound::new(1000, vec![]).unwrap().encode_into(&mut out, &mut last);
    Bound::new(1005, vec![0xAB]).unwrap().encode_into(&mut out, &mut last);
    Bound::infinity().encode_into(&mut out, &mut last);

    let mut reader = Reader::new(&out);
    let mut last_in = 0;
    assert_eq!(Bound::decode(&mut reader, &mut last_in).unwrap().timestamp, 1000);
    let second = Bound::decode(&mut reader, &mut last_in).unwrap();
    assert_eq!(second.timestamp, 1005);
    assert_eq!(second.id_prefix, vec![0xAB]);
    assert_eq!(
        Bound::decode(&mut reader, &mut last_in).unwrap().timestamp,
        TIMESTAMP_INFINITY
    );
    assert!(reader.is_empty());
}

// === Storage ===

#[test]
fn test_storage_rejects_insert_after_seal() {
    let mut storage = NegentropyStorage::new();
    storage.insert(1, &[0x01; 32]).unwrap();
    storage.seal().unwrap();

    assert!(matches!(storage.insert(2, &[0x02; 32]), Err(Nip77Error::AlreadySealed)));
    assert!(matches!(storage.seal(), Err(Nip77Error::AlreadySealed)));
}

#[test]
fn test_storage_keeps_first_32_bytes_and_rejects_short_ids() {
    let mut storage = NegentropyStorage::new();
    storage.insert(1, &[0x07; 40]).unwrap();
    assert!(matches!(
        storage.insert(1, &[0x07; 8]),
        Err(Nip77Error::InvalidIdLength(8))
    ));
    storage.seal().unwrap();
    assert_eq!(storage.record(0).id, [0x07; 32]);
}

#[test]
fn test_storage_collapses_duplicates() {
    let storage = sealed(&[(5, [0x01; 32]), (5, [0x01; 32]), (4, [0x02; 32])]);
    assert_eq!(storage.len(), 2);
    assert_eq!(storage.record(0).timestamp, 4);
}

#[test]
fn test_engine_requires_sealed_storage() {
    let mut storage = NegentropyStorage::new();
    storage.insert(1, &[0x01; 32]).unwrap();
    assert!(matches!(Negentropy::new(storage, 4096), Err(Nip77Error::NotSealed)));
}

#[test]
fn test_engine_rejects_small_frame_limit() {
    assert!(matches!(
        Negentropy::new(sealed(&[]), 1024),
        Err(Nip77Error::FrameSizeLimitTooSmall(1024))
    ));
    assert!(Negentropy::new(sealed(&[]), 0).is_ok());
}

// === Engine roles ===

#[test]
fn test_roles_are_enforced() {
    let mut client = Negentropy::new(sealed(&items(0..3)), 4096).unwrap();
    let mut server = Negentropy::new(sealed(&items(0..3)), 4096).unwrap();

    let message = client.initiate().unwrap();
    assert!(matches!(client.initiate(), Err(Nip77Error::AlreadyInitiated)));
    assert!(matches!(
        client.reconcile(&message),
        Err(Nip77Error::InitiatorCannotReconcile)
    ));
    assert!(matches!(
        server.reconcile_with_ids(&message),
        Err(Nip77Error::NotInitiator)
    ));
}

#[test]
fn test_responder_answers_unknown_version_with_its_own() {
    let mut server = Negentropy::new(sealed(&items(0..3)), 4096).unwrap();
    assert_eq!(server.reconcile(&[0x62]).unwrap(), vec![PROTOCOL_VERSION_1]);
    assert!(matches!(
        server.reconcile(&[0x10]),
        Err(Nip77Error::InvalidProtocolVersion(0x10))
    ));
}

#[test]
fn test_initiator_rejects_downgrade() {
    let mut client = Negentropy::new(sealed(&items(0..3)), 4096).unwrap();
    client.initiate().unwrap();
    assert!(matches!(
        client.reconcile_with_ids(&[0x62]),
        Err(Nip77Error::UnsupportedProtocolVersion(0x62))
    ));
}

#[test]
fn test_truncated_message_is_an_error() {
    let mut client = Negentropy::new(sealed(&items(0..40)), 4096).unwrap();
    let mut server = Negentropy::new(sealed(&items(0..40)), 4096).unwrap();
    let message = client.initiate().unwrap();
    assert!(server.reconcile(&message[..message.len() - 5]).is_err());
}

#[test]
fn test_invalid_mode_is_an_error() {
    let mut server = Negentropy::new(sealed(&[]), 4096).unwrap();
    // infinity bound, empty prefix, mode 7
    assert!(matches!(
        server.reconcile(&[PROTOCOL_VERSION_1, 0x00, 0x00, 0x07]),
        Err(Nip77Error::InvalidMode(7))
    ));
}

// === Reconciliation ===

#[test]
fn test_identical_sets_converge_in_one_round() {
    let set = items(0..500);
    let run = run_sync(&set, &set, 4096);
    assert_eq!(run.rounds, 1);
    assert!(run.have.is_empty());
    assert!(run.need.is_empty());
}

#[test]
fn test_empty_sets_converge() {
    let run = run_sync(&[], &[], 4096);
    assert_eq!(run.rounds, 1);
    assert!(run.have.is_empty() && run.need.is_empty());
}

#[test]
fn test_one_side_empty() {
    let set = items(0..10);
    let run = run_sync(&set, &[], 4096);
    assert_eq!(run.have, ids_of(&set));
    assert!(run.need.is_empty());

    let run = run_sync(&[], &set, 4096);
    assert!(run.have.is_empty());
    assert_eq!(run.need, ids_of(&set));
}

#[test]
fn test_small_partial_overlap() {
    let client = items(1..4);
    let server = items(2..5);
    let run = run_sync(&client, &server, 4096);

    assert_eq!(run.have, ids_of(&items(1..2)));
    assert_eq!(run.need, ids_of(&items(4..5)));
}

#[test]
fn test_large_sets_with_scattered_differences() {
    let shared = items(0..3000);
    let mut client = shared.clone();
    let mut server = shared;
    client.extend(items(10_000..10_150));
    server.extend(items(20_000..20_075));
    // remove a few shared items from each side
    client.retain(|(_, id)| *id != test_id(17) && *id != test_id(1500));
    server.retain(|(_, id)| *id != test_id(2999));

    let run = run_sync(&client, &server, 4096);

    let client_ids = ids_of(&client);
    let server_ids = ids_of(&server);
    let expected_have: BTreeSet<EventId> = client_ids.difference(&server_ids).copied().collect();
    let expected_need: BTreeSet<EventId> = server_ids.difference(&client_ids).copied().collect();
    assert_eq!(run.have, expected_have);
    assert_eq!(run.need, expected_need);
    assert!(run.rounds > 1);
}

#[test]
fn test_frame_limit_spreads_disjoint_sets_over_rounds() {
    let client = items(0..1000);
    let server = items(5000..6000);

    let limited = run_sync(&client, &server, 4096);
    assert_eq!(limited.have, ids_of(&client));
    assert_eq!(limited.need, ids_of(&server));

    let unlimited = run_sync(&client, &server, 0);
    assert_eq!(unlimited.have, limited.have);
    assert_eq!(unlimited.need, limited.need);
    assert!(limited.rounds > unlimited.rounds);
}

#[test]
fn test_items_sharing_a_timestamp() {
    let client: Vec<(u64, EventId)> = (0..200).map(|n| (42, test_id(n))).collect();
    let server: Vec<(u64, EventId)> = (100..300).map(|n| (42, test_id(n))).collect();
    let run = run_sync(&client, &server, 4096);

    assert_eq!(run.have.len(), 100);
    assert_eq!(run.need.len(), 100);
    assert!(run.have.contains(&test_id(0)));
    assert!(run.need.contains(&test_id(299)));
}
