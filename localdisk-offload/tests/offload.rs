use cairn_cache::{offload::Error, offload::Offload, sig, Cache};
use cairn_localdisk_offload::{Config, LocalDiskOffload};
use cairn_pool::{
    pool::BLOCK_SIZE, BlockKind, Deadline, DeliveryPolicy, DtnTime, DuctDir, Eid, Handle,
    NullBlocktypeApi, Pool,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn make_pool(blocks: usize) -> Arc<Pool> {
    let pool = Pool::new(&cairn_pool::Config {
        capacity: core::num::NonZeroUsize::new((blocks + 1) * BLOCK_SIZE).unwrap(),
        bundle_threshold: 0,
        internal_threshold: 0,
    })
    .unwrap();
    pool.register_blocktype(sig::PRIMARY, BlockKind::Primary, Arc::new(NullBlocktypeApi), 0)
        .unwrap();
    pool.register_blocktype(
        sig::CANONICAL,
        BlockKind::Canonical,
        Arc::new(NullBlocktypeApi),
        0,
    )
    .unwrap();
    pool.register_blocktype(sig::CHUNK, BlockKind::Chunk, Arc::new(NullBlocktypeApi), 0)
        .unwrap();
    Arc::new(pool)
}

fn make_offload(dir: &Path) -> LocalDiskOffload {
    let off = LocalDiskOffload::new(Config {
        store_dir: Some(dir.to_path_buf()),
    });
    off.start().unwrap();
    off
}

/// A custody-tracked bundle: primary, one payload canonical, encoded
/// payload split across two chunks.
fn make_bundle(pool: &Pool) -> Handle {
    let primary = pool.alloc_primary(sig::PRIMARY, None, 255).unwrap();
    pool.with_primary_mut(primary, |p| {
        p.source = Eid::Dtn("node-a/agent".into());
        p.destination = Eid::Ipn {
            node: 99,
            service: 1,
        };
        p.creation.time = DtnTime::new(1_000_000);
        p.creation.sequence = 5;
        p.lifetime = 600_000;
        p.custody_seq = 3;
        p.delivery.policy = DeliveryPolicy::CustodyTracking;
        p.delivery.local_retx_interval = 30_000;
    })
    .unwrap();
    for part in [&b"abc"[..], &b"de"[..]] {
        let chunk = pool
            .alloc_chunk(sig::CHUNK, bytes::Bytes::copy_from_slice(part), 255)
            .unwrap();
        pool.bundle_append_chunk(primary, chunk).unwrap();
    }
    let cblock = pool.alloc_canonical(sig::CANONICAL, None, 255).unwrap();
    pool.with_canonical_mut(cblock, |c| {
        c.block_type = 1;
        c.block_num = 1;
        c.content_length = 7;
    })
    .unwrap();
    let chunk = pool
        .alloc_chunk(sig::CHUNK, bytes::Bytes::from_static(b"payload"), 255)
        .unwrap();
    pool.bundle_append_chunk(cblock, chunk).unwrap();
    pool.bundle_append_cblock(primary, cblock).unwrap();
    primary
}

fn concat_chunks(pool: &Pool, block: Handle) -> Vec<u8> {
    let mut out = Vec::new();
    for c in pool.bundle_chunks(block).unwrap() {
        pool.with_chunk(c, |b| out.extend_from_slice(b)).unwrap();
    }
    out
}

fn record_files(dir: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(d) = stack.pop() {
        for entry in std::fs::read_dir(&d).unwrap().flatten() {
            let p = entry.path();
            if p.is_dir() {
                stack.push(p);
            } else {
                out.push(p);
            }
        }
    }
    out
}

#[test]
fn restore_rebuilds_the_bundle_bit_for_bit() {
    let dir = tempfile::tempdir().unwrap();
    let pool = make_pool(16);
    let off = make_offload(dir.path());

    let original = make_bundle(&pool);
    let sid = off.offload(&pool, original).unwrap();
    assert_ne!(sid, 0);
    assert_eq!(record_files(dir.path()).len(), 1);

    let restored = off.restore(&pool, sid).unwrap();
    assert_ne!(restored, original);
    pool.with_primary(restored, |p| {
        assert_eq!(p.source, Eid::Dtn("node-a/agent".into()));
        assert_eq!(
            p.destination,
            Eid::Ipn {
                node: 99,
                service: 1
            }
        );
        assert_eq!(p.creation.sequence, 5);
        assert_eq!(p.custody_seq, 3);
        assert_eq!(p.delivery.policy, DeliveryPolicy::CustodyTracking);
        assert_eq!(p.delivery.local_retx_interval, 30_000);
        assert_eq!(p.delivery.committed_storage_id, sid);
    })
    .unwrap();

    // The primary stream is re-chunked on the resident chunking hint.
    assert_eq!(concat_chunks(&pool, restored), b"abcde");
    assert_eq!(pool.bundle_chunks(restored).unwrap().len(), 2);

    let cblocks = pool.bundle_cblocks(restored).unwrap();
    assert_eq!(cblocks.len(), 1);
    pool.with_canonical(cblocks[0], |c| {
        assert_eq!(c.block_type, 1);
        assert_eq!(c.content_length, 7);
    })
    .unwrap();
    assert_eq!(concat_chunks(&pool, cblocks[0]), b"payload");
}

#[test]
fn a_corrupt_record_is_discarded_and_never_retried() {
    let dir = tempfile::tempdir().unwrap();
    let pool = make_pool(16);
    let off = make_offload(dir.path());

    let sid = off.offload(&pool, make_bundle(&pool)).unwrap();
    let files = record_files(dir.path());
    assert_eq!(files.len(), 1);
    let mut data = std::fs::read(&files[0]).unwrap();
    let last = data.len() - 1;
    data[last] ^= 0x01;
    std::fs::write(&files[0], &data).unwrap();

    assert!(matches!(
        off.restore(&pool, sid),
        Err(Error::CorruptRecord { storage_id }) if storage_id == sid
    ));
    // The backend removed the damaged file; the id is gone for good.
    assert!(record_files(dir.path()).is_empty());
    assert!(matches!(off.restore(&pool, sid), Err(Error::NotFound(s)) if s == sid));
}

#[test]
fn release_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let pool = make_pool(16);
    let off = make_offload(dir.path());

    let sid = off.offload(&pool, make_bundle(&pool)).unwrap();
    off.release(sid).unwrap();
    assert!(record_files(dir.path()).is_empty());
    off.release(sid).unwrap();
}

#[test]
fn operations_require_start_and_reject_unknown_keys() {
    let pool = make_pool(16);
    let off = LocalDiskOffload::new(Config::default());
    assert!(matches!(
        off.offload(&pool, make_bundle(&pool)),
        Err(Error::NotStarted)
    ));
    assert!(matches!(
        off.configure("replication", "3"),
        Err(Error::UnknownKey(_))
    ));
    assert!(matches!(
        off.configure("store_dir", ""),
        Err(Error::InvalidValue { .. })
    ));
}

/// Pulls one queued ref block, stamps the egress metadata and recycles
/// the ref block, as an egress CLA would.
fn forward_one(pool: &Pool, cache: &Cache, at: DtnTime) {
    let duct = cache.duct().unwrap();
    let refblock = pool
        .duct_pull(duct, DuctDir::Ingress, Deadline::poll())
        .unwrap();
    let primary = pool.dereference(refblock).unwrap();
    pool.with_primary_mut(primary, |p| {
        p.delivery.egress_intf_id = 5;
        p.delivery.egress_time = at;
    })
    .unwrap();
    pool.recycle_block(refblock).unwrap();
    pool.maintain();
}

#[test]
fn custody_bundle_is_evicted_between_retransmits_and_restored_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let pool = make_pool(24);
    let cache = Cache::attach(
        pool.clone(),
        cairn_cache::Config::default(),
        Some(Arc::new(LocalDiskOffload::new(Config {
            store_dir: Some(dir.path().to_path_buf()),
        }))),
    )
    .unwrap();
    let duct = cache.duct().unwrap();

    let t0 = DtnTime::new(1_000_000);
    let bundle = make_bundle(&pool);
    pool.with_primary_mut(bundle, |p| p.creation.time = t0).unwrap();
    cache.insert_bundle(bundle, 255, t0).unwrap();

    // First forward; settling into Idle persists the record while the
    // resident copy stays in the pool.
    cache.run_pass(t0).unwrap();
    forward_one(&pool, &cache, t0);
    cache.run_pass(t0.saturating_add(1)).unwrap();
    assert_eq!(record_files(dir.path()).len(), 1);
    let resident_free = pool.stats().free_blocks;

    // Second forward; this Queue exit drops the resident blocks.
    cache.run_pass(t0.saturating_add(30_001)).unwrap();
    assert_eq!(pool.duct_depth(duct, DuctDir::Ingress).unwrap(), 1);
    forward_one(&pool, &cache, t0.saturating_add(30_001));
    cache.run_pass(t0.saturating_add(30_002)).unwrap();
    // Primary, two stream chunks, canonical and its payload chunk.
    assert_eq!(pool.stats().free_blocks, resident_free + 5);
    assert_eq!(record_files(dir.path()).len(), 1);

    // Third retransmit re-reads the record from disk.
    cache.run_pass(t0.saturating_add(60_002)).unwrap();
    assert_eq!(pool.duct_depth(duct, DuctDir::Ingress).unwrap(), 1);
    let queued = pool.duct_handles(duct, DuctDir::Ingress).unwrap();
    let restored = pool.dereference(queued[0]).unwrap();
    assert_ne!(restored, bundle);
    pool.with_primary(restored, |p| {
        assert_eq!(p.source, Eid::Dtn("node-a/agent".into()));
        assert_ne!(p.delivery.committed_storage_id, 0);
    })
    .unwrap();
    let cblocks = pool.bundle_cblocks(restored).unwrap();
    assert_eq!(concat_chunks(&pool, cblocks[0]), b"payload");
}
