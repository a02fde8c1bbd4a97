use cairn_cache::{sig, Cache, Config, Error, FsmState};
use cairn_pool::{
    pool::BLOCK_SIZE, Deadline, DeliveryPolicy, DtnTime, DuctDir, Eid, Handle, Pool,
};
use std::sync::Arc;

fn make_pool(blocks: usize) -> Arc<Pool> {
    Arc::new(
        Pool::new(&cairn_pool::Config {
            capacity: core::num::NonZeroUsize::new((blocks + 1) * BLOCK_SIZE).unwrap(),
            bundle_threshold: 0,
            internal_threshold: 0,
        })
        .unwrap(),
    )
}

fn make_cache(pool: &Arc<Pool>) -> Cache {
    Cache::attach(
        pool.clone(),
        Config {
            local_eid: Eid::Ipn {
                node: 1,
                service: 0,
            },
            intf_id: 1,
            duct_depth: 4,
            ..Default::default()
        },
        None,
    )
    .unwrap()
}

struct BundleSpec {
    source_node: u64,
    sequence: u64,
    created: DtnTime,
    lifetime: u64,
    policy: DeliveryPolicy,
    retx: u64,
}

fn make_bundle(pool: &Pool, spec: &BundleSpec) -> Handle {
    let primary = pool.alloc_primary(sig::PRIMARY, None, 255).unwrap();
    pool.with_primary_mut(primary, |p| {
        p.source = Eid::Ipn {
            node: spec.source_node,
            service: 1,
        };
        p.destination = Eid::Ipn {
            node: 99,
            service: 1,
        };
        p.creation.time = spec.created;
        p.creation.sequence = spec.sequence;
        p.lifetime = spec.lifetime;
        p.delivery.policy = spec.policy;
        p.delivery.local_retx_interval = spec.retx;
    })
    .unwrap();
    let chunk = pool
        .alloc_chunk(sig::CHUNK, bytes::Bytes::from_static(b"\x9f\x07\xff"), 255)
        .unwrap();
    pool.bundle_append_chunk(primary, chunk).unwrap();
    primary
}

/// Pulls one queue ref block from the cache duct, stamps the egress
/// metadata the way a CLA would after transmitting, and recycles the
/// ref block.
fn forward_one(pool: &Pool, cache: &Cache, intf: u32, at: DtnTime) -> Handle {
    let duct = cache.duct().unwrap();
    let refblock = pool
        .duct_pull(duct, DuctDir::Ingress, Deadline::poll())
        .unwrap();
    let primary = pool.dereference(refblock).unwrap();
    pool.with_primary_mut(primary, |p| {
        p.delivery.egress_intf_id = intf;
        p.delivery.egress_time = at;
    })
    .unwrap();
    pool.recycle_block(refblock).unwrap();
    pool.maintain();
    primary
}

#[test]
fn expired_bundle_is_discarded_and_all_blocks_recycled() {
    let pool = make_pool(16);
    let cache = make_cache(&pool);
    let baseline = pool.stats().free_blocks;

    let t0 = DtnTime::new(1_000_000);
    let bundle = make_bundle(
        &pool,
        &BundleSpec {
            source_node: 2,
            sequence: 1,
            created: t0,
            lifetime: 5_000,
            policy: DeliveryPolicy::Normal,
            retx: 0,
        },
    );
    assert!(cache.insert_bundle(bundle, 255, t0).unwrap());
    assert!(pool.stats().free_blocks < baseline);

    // One pass after expiry: terminal, and every owned block comes back.
    assert_eq!(cache.run_pass(t0.saturating_add(5_001)).unwrap(), 1);
    assert_eq!(pool.stats().free_blocks, baseline);
    assert_eq!(cache.stats().discards, 1);

    cache.detach().unwrap();
}

#[test]
fn duplicate_insert_is_an_idempotent_no_op() {
    let pool = make_pool(16);
    let cache = make_cache(&pool);
    let t0 = DtnTime::new(1_000_000);
    let spec = BundleSpec {
        source_node: 2,
        sequence: 7,
        created: t0,
        lifetime: 60_000,
        policy: DeliveryPolicy::Normal,
        retx: 0,
    };
    let a = make_bundle(&pool, &spec);
    let b = make_bundle(&pool, &spec);
    assert!(cache.insert_bundle(a, 255, t0).unwrap());
    assert!(!cache.insert_bundle(b, 255, t0).unwrap());
}

#[test]
fn insert_rejects_non_bundle_blocks() {
    let pool = make_pool(16);
    let cache = make_cache(&pool);
    let chunk = pool
        .alloc_chunk(sig::CHUNK, bytes::Bytes::from_static(b"x"), 255)
        .unwrap();
    assert!(matches!(
        cache.insert_bundle(chunk, 255, DtnTime::new(0)),
        Err(Error::NotABundle)
    ));
}

#[test]
fn full_duct_defers_forwarding_until_the_ref_block_is_reclaimed() {
    let pool = make_pool(24);
    let cache = Cache::attach(
        pool.clone(),
        Config {
            duct_depth: 1,
            ..Default::default()
        },
        None,
    )
    .unwrap();
    let duct = cache.duct().unwrap();

    // Occupy the single ingress slot so the entry's push must fail.
    let blocker = pool
        .alloc_chunk(sig::CHUNK, bytes::Bytes::from_static(b"z"), 255)
        .unwrap();
    pool.duct_push(duct, DuctDir::Ingress, blocker, Deadline::poll())
        .unwrap();

    let t0 = DtnTime::new(1_000_000);
    let bundle = make_bundle(
        &pool,
        &BundleSpec {
            source_node: 3,
            sequence: 1,
            created: t0,
            lifetime: 600_000,
            policy: DeliveryPolicy::Normal,
            retx: 0,
        },
    );
    cache.insert_bundle(bundle, 255, t0).unwrap();

    // Queue entry fails its push; the ref block is recycled at once and
    // its destructor re-wakes the entry.
    cache.run_pass(t0).unwrap();
    assert_eq!(pool.duct_depth(duct, DuctDir::Ingress).unwrap(), 1);
    assert_eq!(cache.stats().enters[FsmState::Queue.idx()], 1);

    // Make room, let the entry fall back to Idle, then requeue at the
    // fast retry.
    let pulled = pool
        .duct_pull(duct, DuctDir::Ingress, Deadline::poll())
        .unwrap();
    pool.recycle_block(pulled).unwrap();
    pool.maintain();
    cache.run_pass(t0.saturating_add(10)).unwrap();
    cache.run_pass(t0.saturating_add(3_011)).unwrap();

    assert_eq!(pool.duct_depth(duct, DuctDir::Ingress).unwrap(), 1);
    let queued = pool.duct_handles(duct, DuctDir::Ingress).unwrap();
    assert_eq!(pool.dereference(queued[0]).unwrap(), bundle);
    assert_eq!(cache.stats().enters[FsmState::Queue.idx()], 2);
}

#[test]
fn custody_tracking_requeues_once_per_retransmit_interval() {
    let pool = make_pool(24);
    let cache = make_cache(&pool);
    let duct = cache.duct().unwrap();

    let t0 = DtnTime::new(1_000_000);
    let bundle = make_bundle(
        &pool,
        &BundleSpec {
            source_node: 4,
            sequence: 1,
            created: t0,
            lifetime: 600_000,
            policy: DeliveryPolicy::CustodyTracking,
            retx: 30_000,
        },
    );
    cache.insert_bundle(bundle, 255, t0).unwrap();

    // First forward.
    assert_eq!(cache.run_pass(t0).unwrap(), 1);
    assert_eq!(pool.duct_depth(duct, DuctDir::Ingress).unwrap(), 1);
    forward_one(&pool, &cache, 5, t0);

    // Queue exit arms the retransmit timer at egress_time + 30s.
    cache.run_pass(t0.saturating_add(1)).unwrap();

    // Stays Idle until the timer fires; nothing is driven in between.
    assert_eq!(cache.run_pass(t0.saturating_add(15_000)).unwrap(), 0);
    assert_eq!(pool.duct_depth(duct, DuctDir::Ingress).unwrap(), 0);

    // At the interval it re-enters Queue exactly once.
    assert_eq!(cache.run_pass(t0.saturating_add(30_001)).unwrap(), 1);
    assert_eq!(pool.duct_depth(duct, DuctDir::Ingress).unwrap(), 1);
}

#[test]
fn custody_acks_aggregate_into_one_signal_bundle() {
    let pool = make_pool(24);
    let cache = make_cache(&pool);
    let duct = cache.duct().unwrap();
    let custodian = Eid::Ipn {
        node: 9,
        service: 1,
    };

    let t0 = DtnTime::new(1_000_000);
    for seq in [3u64, 4, 5] {
        cache.append_custody_ack(&custodian, seq, t0).unwrap();
    }

    // Open signals wait out their accumulation window.
    assert_eq!(cache.run_pass(t0.saturating_add(1)).unwrap(), 0);

    // Window elapsed: finalize into a bundle, then forward it.
    cache.run_pass(t0.saturating_add(10_001)).unwrap();
    cache.run_pass(t0.saturating_add(13_002)).unwrap();
    assert_eq!(pool.duct_depth(duct, DuctDir::Ingress).unwrap(), 1);

    let queued = pool.duct_handles(duct, DuctDir::Ingress).unwrap();
    let primary = pool.dereference(queued[0]).unwrap();
    pool.with_primary(primary, |p| {
        assert_eq!(p.destination, custodian);
        assert_eq!(
            p.source,
            Eid::Ipn {
                node: 1,
                service: 0
            }
        );
    })
    .unwrap();

    // Payload: ipn custodian, then one compressed (3, count 3) run.
    let cblocks = pool.bundle_cblocks(primary).unwrap();
    assert_eq!(cblocks.len(), 1);
    let chunks = pool.bundle_chunks(cblocks[0]).unwrap();
    let mut payload = Vec::new();
    for c in chunks {
        pool.with_chunk(c, |b| payload.extend_from_slice(b)).unwrap();
    }
    assert_eq!(payload[0], 1);
    assert_eq!(
        u32::from_le_bytes(payload[17..21].try_into().unwrap()),
        1
    );
    assert_eq!(
        u64::from_le_bytes(payload[21..29].try_into().unwrap()),
        3
    );
    assert_eq!(
        u64::from_le_bytes(payload[29..37].try_into().unwrap()),
        3
    );
}

#[test]
fn a_full_signal_is_finalized_early_and_a_fresh_one_opened() {
    let pool = make_pool(32);
    let cache = make_cache(&pool);
    let custodian = Eid::Ipn {
        node: 9,
        service: 1,
    };
    let t0 = DtnTime::new(1_000_000);

    // Default limit is 16 acks; the 17th forces early finalization.
    for seq in 0u64..17 {
        cache.append_custody_ack(&custodian, seq, t0).unwrap();
    }

    // The forced entry finalizes on the next pass, well before its
    // accumulation window would have elapsed.
    assert_eq!(cache.run_pass(t0.saturating_add(1)).unwrap(), 1);
    cache.run_pass(t0.saturating_add(3_002)).unwrap();
    assert_eq!(
        pool.duct_depth(cache.duct().unwrap(), DuctDir::Ingress)
            .unwrap(),
        1
    );
}

#[test]
fn detach_refuses_while_entries_remain_then_releases_everything() {
    let pool = make_pool(16);
    let cache = make_cache(&pool);
    let after_attach = pool.stats().free_blocks;

    let t0 = DtnTime::new(1_000_000);
    let bundle = make_bundle(
        &pool,
        &BundleSpec {
            source_node: 6,
            sequence: 1,
            created: t0,
            lifetime: 1_000,
            policy: DeliveryPolicy::Normal,
            retx: 0,
        },
    );
    cache.insert_bundle(bundle, 255, t0).unwrap();
    assert!(matches!(cache.detach(), Err(Error::IndexNotEmpty)));

    // Drain via expiry, then detach cleanly.
    cache.run_pass(t0.saturating_add(1_001)).unwrap();
    assert_eq!(pool.stats().free_blocks, after_attach);
    cache.detach().unwrap();
    assert!(matches!(cache.detach(), Err(Error::Detached)));
    pool.maintain();
}
