use super::*;
use cairn_pool::{
    block::{BlockData, BlocktypeApi, NullBlocktypeApi, Registration},
    duct::{DuctEvent, DuctHandler},
};
use std::sync::{Mutex, MutexGuard};

pub(crate) struct Shared {
    pub pool: Arc<Pool>,
    pub config: Config,
    pub inner: Mutex<CacheInner>,
}

pub(crate) struct CacheInner {
    /// `None` once detached.
    pub state_block: Option<Handle>,
    pub duct: Option<Handle>,
    pub index: Indices,
    /// Open custody signal per previous custodian.
    pub custodians: hashbrown::HashMap<Eid, Handle>,
    pub offload: Option<Arc<dyn offload::Offload>>,
    pub stats: CacheStats,
    pub dacs_seq: u64,
}

impl CacheInner {
    /// Finds the entry holding a resident reference to `primary` by
    /// scanning the matching bundle-id key range.
    pub fn entry_for_primary(&self, pool: &Pool, primary: Handle) -> Option<Handle> {
        let key = pool
            .with_primary(primary, |p| key_of(&(p.source.clone(), p.creation)))
            .ok()?;
        for (_, &entry) in self.index.primary_id.range((key, 0)..=(key, u32::MAX)) {
            if pool
                .with_data::<CacheEntryData, _>(entry, |e| e.bundle_ref == Some(primary))
                .unwrap_or(false)
            {
                return Some(entry);
            }
        }
        None
    }
}

impl Shared {
    pub fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().trace_expect("Failed to lock cache mutex")
    }

    /// Entry block destructor: tears down every trace of the entry. Runs
    /// outside the pool lock.
    fn entry_destroyed(&self, pool: &Pool, block: Handle) {
        let Ok(data) = pool.with_data::<CacheEntryData, _>(block, |e| e.clone()) else {
            return;
        };
        let offload = {
            let mut inner = self.lock();
            if data.bundle_indexed {
                inner.index.primary_id.remove(&(data.key_primary, block.index()));
                inner
                    .index
                    .destination
                    .remove(&(data.key_destination, block.index()));
            }
            if data.time_key != 0 {
                inner.index.time.remove(&(data.time_key, block.index()));
            }
            if let Some(dacs) = &data.dacs {
                inner
                    .index
                    .custodian
                    .remove(&(data.key_custodian, block.index()));
                if inner.custodians.get(&dacs.custodian) == Some(&block) {
                    inner.custodians.remove(&dacs.custodian);
                }
            }
            inner.offload.clone()
        };
        if let Some(r) = data.bundle_ref {
            if let Err(e) = pool.ref_release(r) {
                warn!(entry = %block, error = %e, "Failed to release resident bundle reference");
            }
        }
        if data.storage_id != 0 {
            if let Some(off) = offload {
                if let Err(e) = off.release(data.storage_id) {
                    warn!(storage_id = data.storage_id, error = %e, "Failed to release offloaded record");
                }
            }
        }
    }

    /// Queue ref block destructor: the ref block has left its duct, so
    /// the owning entry is no longer queued. Wakes the entry promptly
    /// rather than letting it wait out the idle retry interval.
    fn queue_ref_destroyed(&self, pool: &Pool, block: Handle) {
        let Ok(primary) = pool.dereference(block) else {
            return;
        };
        let mut inner = self.lock();
        let Some(state) = inner.state_block else {
            return;
        };
        let Some(entry) = inner.entry_for_primary(pool, primary) else {
            trace!(refblock = %block, "Queue ref block outlived its entry");
            return;
        };
        let _ = pool.with_data_mut::<CacheEntryData, _>(entry, |e| {
            e.flags.remove(EntryFlags::LOCALLY_QUEUED);
            e.flags.insert(EntryFlags::ACTIVITY);
        });
        let _ = self.retarget_time(&mut inner, entry, 0);
        let _ = pool.sublist_append(state, PENDING, entry);
    }
}

struct StateApi;

impl BlocktypeApi for StateApi {
    fn new_content(&self) -> Option<Box<dyn BlockData>> {
        Some(Box::new(entry::CacheStateData))
    }
}

struct EntryApi {
    cache: Weak<Shared>,
}

impl BlocktypeApi for EntryApi {
    fn new_content(&self) -> Option<Box<dyn BlockData>> {
        Some(Box::new(CacheEntryData::default()))
    }

    fn destruct(&self, pool: &Pool, block: Handle) {
        if let Some(shared) = self.cache.upgrade() {
            shared.entry_destroyed(pool, block);
        }
    }
}

struct QueueRefApi {
    cache: Weak<Shared>,
}

impl BlocktypeApi for QueueRefApi {
    fn destruct(&self, pool: &Pool, block: Handle) {
        if let Some(shared) = self.cache.upgrade() {
            shared.queue_ref_destroyed(pool, block);
        }
    }
}

struct CacheDuctHandler;

impl DuctHandler for CacheDuctHandler {
    fn on_event(&self, _pool: &Pool, _duct: Handle, event: DuctEvent) {
        trace!(?event, "Cache duct event");
    }
}

/// The bundle retention cache engine over one storage interface.
///
/// One cache attaches to one pool for the pool's lifetime (the block
/// type registry has no unregister). Handles are cheap clones; the FSM
/// driver contract is single-threaded: exactly one caller runs
/// [`Cache::run_pass`] at a time.
#[derive(Clone)]
pub struct Cache {
    shared: Arc<Shared>,
}

impl Cache {
    /// Registers the well-known block types, allocates the cache-state
    /// block and interface duct, and starts the offload service if one
    /// is supplied.
    pub fn attach(
        pool: Arc<Pool>,
        config: Config,
        offload: Option<Arc<dyn offload::Offload>>,
    ) -> Result<Self, Error> {
        if let Some(o) = &offload {
            o.start()?;
        }

        let shared = Arc::new(Shared {
            pool: pool.clone(),
            config,
            inner: Mutex::new(CacheInner {
                state_block: None,
                duct: None,
                index: Indices::default(),
                custodians: hashbrown::HashMap::new(),
                offload,
                stats: CacheStats::default(),
                dacs_seq: 0,
            }),
        });

        pool.register_blocktype(
            sig::PRIMARY,
            BlockKind::Primary,
            Arc::new(NullBlocktypeApi),
            0,
        )?;
        pool.register_blocktype(
            sig::CANONICAL,
            BlockKind::Canonical,
            Arc::new(NullBlocktypeApi),
            0,
        )?;
        pool.register_blocktype(sig::CHUNK, BlockKind::Chunk, Arc::new(NullBlocktypeApi), 0)?;
        pool.register_blocktype(
            sig::CACHE_DUCT,
            BlockKind::Duct,
            Arc::new(NullBlocktypeApi),
            0,
        )?;
        pool.register_blocktype(
            sig::CACHE_STATE,
            BlockKind::Data,
            Arc::new(StateApi),
            core::mem::size_of::<entry::CacheStateData>(),
        )?;
        // These two carry destructor callbacks into this cache, so a
        // duplicate means another cache already owns this pool.
        if pool.register_blocktype(
            sig::CACHE_ENTRY,
            BlockKind::Data,
            Arc::new(EntryApi {
                cache: Arc::downgrade(&shared),
            }),
            core::mem::size_of::<CacheEntryData>(),
        )? == Registration::Duplicate
        {
            return Err(Error::AlreadyAttached);
        }
        pool.register_blocktype(
            sig::QUEUE_REF,
            BlockKind::Ref,
            Arc::new(QueueRefApi {
                cache: Arc::downgrade(&shared),
            }),
            0,
        )?;

        let state = pool.alloc_data(sig::CACHE_STATE, None, 255)?;
        // Self-keepalive: the cache owns one counted reference to its own
        // state block, released exactly once in detach.
        pool.ref_create(state)?;

        let duct = pool.alloc_duct(
            sig::CACHE_DUCT,
            shared.config.intf_id,
            Arc::new(CacheDuctHandler),
            shared.config.duct_depth,
            255,
        )?;
        pool.duct_enable(duct, DuctDir::Ingress, shared.config.duct_depth)?;
        pool.duct_enable(duct, DuctDir::Egress, shared.config.duct_depth)?;

        {
            let mut inner = shared.lock();
            inner.state_block = Some(state);
            inner.duct = Some(duct);
        }
        info!(intf_id = shared.config.intf_id, "Attached bundle cache");
        Ok(Self { shared })
    }

    /// Takes a bundle into the cache: one Idle entry with local custody,
    /// indexed and scheduled for the next pass. Returns `Ok(false)` if
    /// the bundle id is already resident. When the bundle is custody
    /// tracked, its acceptance is acknowledged to the previous custodian.
    pub fn insert_bundle(
        &self,
        bundle: Handle,
        priority: u8,
        now: DtnTime,
    ) -> Result<bool, Error> {
        let pool = &self.shared.pool;
        let primary = pool.dereference(bundle)?;
        if pool.kind_of(primary)? != BlockKind::Primary {
            return Err(Error::NotABundle);
        }
        let (source, creation, destination, custodian, custody_seq, policy, expiry) = pool
            .with_primary(primary, |p| {
                (
                    p.source.clone(),
                    p.creation,
                    p.destination.clone(),
                    p.previous_custodian.clone(),
                    p.custody_seq,
                    p.delivery.policy,
                    p.expiry(),
                )
            })?;
        let key_primary = key_of(&(source.clone(), creation));
        let key_destination = key_of(&destination);

        let mut inner = self.shared.lock();
        let state = inner.state_block.ok_or(Error::Detached)?;

        for (_, &e) in inner
            .index
            .primary_id
            .range((key_primary, 0)..=(key_primary, u32::MAX))
        {
            if pool
                .with_data::<CacheEntryData, _>(e, |d| d.source == source && d.creation == creation)
                .unwrap_or(false)
            {
                trace!(source = %source, "Duplicate bundle insert ignored");
                return Ok(false);
            }
        }

        let bref = pool.ref_create(primary)?;
        let entry = match pool.alloc_data(sig::CACHE_ENTRY, None, priority) {
            Ok(entry) => entry,
            Err(e) => {
                let _ = pool.ref_release(bref);
                return Err(e.into());
            }
        };
        pool.ref_create(entry)?;
        pool.with_data_mut::<CacheEntryData, _>(entry, |e| {
            e.state = FsmState::Idle;
            e.flags = EntryFlags::LOCAL_CUSTODY;
            e.bundle_ref = Some(bref);
            e.action_time = DtnTime::INFINITE;
            e.expire_time = expiry;
            e.source = source.clone();
            e.creation = creation;
            e.destination = destination.clone();
            e.key_primary = key_primary;
            e.key_destination = key_destination;
            e.bundle_indexed = true;
        })?;
        inner.index.primary_id.insert((key_primary, entry.index()), entry);
        inner
            .index
            .destination
            .insert((key_destination, entry.index()), entry);
        inner.stats.enters[FsmState::Idle.idx()] += 1;
        metrics::counter!("cache_bundles_inserted").increment(1);
        pool.sublist_append(state, PENDING, entry)?;

        if policy == DeliveryPolicy::CustodyTracking && custodian != Eid::Null {
            self.shared
                .append_ack_locked(&mut inner, &custodian, custody_seq, now)?;
        }
        Ok(true)
    }

    /// Records acceptance of custody sequence `custody_seq` from
    /// `custodian`, to be reported in the next compressed signal.
    pub fn append_custody_ack(
        &self,
        custodian: &Eid,
        custody_seq: u64,
        now: DtnTime,
    ) -> Result<(), Error> {
        let mut inner = self.shared.lock();
        inner.state_block.ok_or(Error::Detached)?;
        self.shared
            .append_ack_locked(&mut inner, custodian, custody_seq, now)
    }

    /// One driver pass: wakes entries whose next-action time is due,
    /// drives the state machine once per pending entry, then services
    /// duct events and pool maintenance. Returns the number of entries
    /// driven.
    pub fn run_pass(&self, now: DtnTime) -> Result<usize, Error> {
        let shared = &self.shared;
        let pool = &shared.pool;
        let mut driven = 0;
        {
            let mut inner = shared.lock();
            let state = inner.state_block.ok_or(Error::Detached)?;
            for ((key, slot), entry) in inner.index.due(now) {
                inner.index.time.remove(&(key, slot));
                pool.with_data_mut::<CacheEntryData, _>(entry, |e| e.time_key = 0)?;
                pool.sublist_append(state, PENDING, entry)?;
            }
            while let Some(entry) = pool.sublist_pop(state, PENDING)? {
                shared.drive(&mut inner, state, entry, now)?;
                driven += 1;
            }
        }
        pool.process_jobs();
        pool.maintain();
        Ok(driven)
    }

    /// The interface duct: entries selected for forwarding appear on its
    /// ingress as queue ref blocks; the egress CLA recycles each ref
    /// block once handled.
    pub fn duct(&self) -> Result<Handle, Error> {
        self.shared.lock().duct.ok_or(Error::Detached)
    }

    pub fn stats(&self) -> CacheStats {
        self.shared.lock().stats.clone()
    }

    /// Tears the cache down. Fails with [`Error::IndexNotEmpty`] while
    /// any entry is still indexed or listed; drain first.
    pub fn detach(&self) -> Result<(), Error> {
        let shared = &self.shared;
        let pool = &shared.pool;
        let (state, duct, offload) = {
            let mut inner = shared.lock();
            let state = inner.state_block.ok_or(Error::Detached)?;
            let busy = !inner.index.is_empty()
                || !pool.sublist_is_empty(state, PENDING)?
                || !pool.sublist_is_empty(state, IDLE)?;
            if busy {
                warn!("Cache still holds entries at detach");
                return Err(Error::IndexNotEmpty);
            }
            inner.state_block = None;
            (state, inner.duct.take(), inner.offload.take())
        };
        if let Some(duct) = duct {
            pool.duct_disable(duct, DuctDir::Ingress)?;
            pool.duct_disable(duct, DuctDir::Egress)?;
            pool.recycle_block(duct)?;
        }
        pool.ref_release(state)?;
        pool.maintain();
        if let Some(o) = offload {
            o.stop();
        }
        info!("Detached bundle cache");
        Ok(())
    }
}
