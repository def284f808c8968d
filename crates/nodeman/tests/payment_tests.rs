//! # Payment Queue and Persistence Integration Tests
//!
//! Payment history is read from the chain, the queue picks the node unpaid
//! the longest, and a saved registry answers the same after a reload.

use noir_common::{NodeIdentity, RegistryConfig};
use noir_nodeman::mock::{node_record, TestHarness};
use noir_nodeman::{LoadStatus, NotQualifyReason};
use tempfile::TempDir;

const T0: u64 = 1_700_000_000;

fn id(n: u8) -> NodeIdentity {
    NodeIdentity::new([n; 32], 0)
}

/// Nodes A (`id(1)`) paid at 100 and B (`id(2)`) paid at 50, tip 300.
fn paid_pair() -> TestHarness {
    let h = TestHarness::new(T0, 300);
    let a = node_record(id(1), T0 - 100);
    let b = node_record(id(2), T0 - 100);
    h.chain.set_payee(100, a.payee_script());
    h.chain.set_payee(50, b.payee_script());
    h.registry.add(a);
    h.registry.add(b);
    h.registry.update_last_paid();
    h
}

// ════════════════════════════════════════════════════════════════════════════════
// 1. QUEUE
// ════════════════════════════════════════════════════════════════════════════════

#[test]
fn test_longest_unpaid_node_is_next() {
    let h = paid_pair();
    assert_eq!(h.registry.get_info(&id(1)).expect("a").block_last_paid, 100);
    assert_eq!(h.registry.get_info(&id(2)).expect("b").block_last_paid, 50);

    let (winner, count) = h.registry.get_next_in_queue_for_payment(250, true);
    assert_eq!(count, 2);
    assert_eq!(winner.map(|w| w.identity), Some(id(2)));
}

#[test]
fn test_new_payment_moves_node_to_back() {
    let h = paid_pair();
    let b = h.registry.find(&id(2)).expect("b");
    h.chain.set_payee(260, b.payee_script());
    h.registry.update_last_paid();

    assert_eq!(
        h.registry.not_qualify_reason(&id(2), 300, true, None),
        Some(NotQualifyReason::RecentlyPaid { block_last_paid: 260 })
    );
    let (winner, count) = h.registry.get_next_in_queue_for_payment(300, true);
    assert_eq!(count, 1);
    assert_eq!(winner.map(|w| w.identity), Some(id(1)));
}

#[test]
fn test_protocol_floor_excludes_everyone() {
    let config = RegistryConfig { min_payments_protocol: 80_000, ..RegistryConfig::default() };
    let h = TestHarness::with_config(config, T0, 300);
    h.registry.add(node_record(id(1), T0 - 100));

    let (winner, count) = h.registry.get_next_in_queue_for_payment(250, false);
    assert!(winner.is_none());
    assert_eq!(count, 0);
    assert!(matches!(
        h.registry.not_qualify_reason(&id(1), 250, false, None),
        Some(NotQualifyReason::NotPayable(_)) | Some(NotQualifyReason::ObsoleteProtocol { .. })
    ));
}

// ════════════════════════════════════════════════════════════════════════════════
// 2. PERSISTENCE
// ════════════════════════════════════════════════════════════════════════════════

#[test]
fn test_reloaded_registry_picks_same_winner() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("noircache.dat");
    let h = paid_pair();
    h.registry.save_to_file(&path).expect("save");

    let reloaded = TestHarness::new(T0, 300);
    assert_eq!(reloaded.registry.load_from_file(&path).expect("load"), LoadStatus::Loaded { nodes: 2 });
    assert_eq!(reloaded.registry.ordinal_of(&id(1)), h.registry.ordinal_of(&id(1)));
    assert_eq!(reloaded.registry.ordinal_of(&id(2)), h.registry.ordinal_of(&id(2)));

    let (expected, _) = h.registry.get_next_in_queue_for_payment(250, true);
    let (winner, _) = reloaded.registry.get_next_in_queue_for_payment(250, true);
    assert_eq!(winner.map(|w| w.identity), expected.map(|w| w.identity));
}

#[test]
fn test_empty_file_is_an_error() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("noircache.dat");
    std::fs::write(&path, b"").expect("write");

    let h = paid_pair();
    assert!(h.registry.load_from_file(&path).is_err());
    assert_eq!(h.registry.size(), 2);
}
