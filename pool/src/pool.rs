use super::*;
use block::{BlockKind, Payload, Registered, RefTarget, Slot};
use list::{LinkRef, LINKS_PER_SLOT};
use std::collections::BTreeMap;
use std::sync::{Condvar, Mutex, MutexGuard};

/// Fixed block granularity the capacity is divided into.
pub const BLOCK_SIZE: usize = 4096;

/// Nominal capacity of a block's content area, checked against every
/// registered content size at allocation time.
pub const MAX_CONTENT_SIZE: usize = BLOCK_SIZE - 128;

const ADMIN_SLOT: u32 = 0;
const MAINTENANCE_BATCH: usize = 64;

// Link positions within a slot.
pub(crate) const MEMBER: usize = 0;
pub(crate) const SUB_A: usize = 1;
pub(crate) const SUB_B: usize = 2;
pub(crate) const ACTIVE: usize = 3;

pub(crate) fn member(h: Handle) -> LinkRef {
    LinkRef::new(h.index, MEMBER)
}

/// Selects one of the two embedded sub-lists a block owns.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Sublist {
    A,
    B,
}

impl Sublist {
    pub(crate) fn pos(self) -> usize {
        match self {
            Sublist::A => SUB_A,
            Sublist::B => SUB_B,
        }
    }
}

#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Config {
    /// Total arena capacity in bytes; divided into [`BLOCK_SIZE`] blocks.
    pub capacity: core::num::NonZeroUsize,

    /// Minimum free blocks required to admit a priority-0 bundle-class
    /// allocation (primary/canonical/chunk).
    pub bundle_threshold: usize,

    /// As above for internal-class allocations (data/ref/duct/job).
    pub internal_threshold: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capacity: core::num::NonZeroUsize::new(1_048_576).unwrap(),
            bundle_threshold: 16,
            internal_threshold: 4,
        }
    }
}

/// Read-only usage snapshot for telemetry consumers.
#[derive(Copy, Clone, Debug, Default)]
pub struct PoolStats {
    pub total_blocks: usize,
    pub free_blocks: usize,
    pub used_high_water: usize,
    pub allocated: u64,
    pub recycled: u64,
}

pub(crate) struct PoolState {
    pub slots: Vec<Slot>,
    registry: BTreeMap<u32, Registered>,
    free_count: usize,
    used_high_water: usize,
    allocated: u64,
    recycled: u64,
    bundle_threshold: usize,
    internal_threshold: usize,
}

impl PoolState {
    pub fn free_head(&self) -> LinkRef {
        LinkRef::new(ADMIN_SLOT, SUB_A)
    }

    pub fn recycle_head(&self) -> LinkRef {
        LinkRef::new(ADMIN_SLOT, SUB_B)
    }

    pub fn job_head(&self) -> LinkRef {
        LinkRef::new(ADMIN_SLOT, ACTIVE)
    }

    pub fn slot(&self, h: Handle) -> Result<&Slot, Error> {
        let slot = self
            .slots
            .get(h.index as usize)
            .ok_or(Error::StaleHandle)?;
        if slot.generation != h.generation || matches!(slot.kind, BlockKind::Free) {
            return Err(Error::StaleHandle);
        }
        Ok(slot)
    }

    pub fn slot_mut(&mut self, h: Handle) -> Result<&mut Slot, Error> {
        let slot = self
            .slots
            .get_mut(h.index as usize)
            .ok_or(Error::StaleHandle)?;
        if slot.generation != h.generation || matches!(slot.kind, BlockKind::Free) {
            return Err(Error::StaleHandle);
        }
        Ok(slot)
    }

    pub fn duct(&self, h: Handle) -> Result<&duct::DuctState, Error> {
        let slot = self.slot(h)?;
        match &slot.payload {
            Payload::Duct(d) => Ok(d),
            _ => Err(Error::WrongBlockKind(slot.kind)),
        }
    }

    pub fn duct_mut(&mut self, h: Handle) -> Result<&mut duct::DuctState, Error> {
        let slot = self.slot_mut(h)?;
        let kind = slot.kind;
        match &mut slot.payload {
            Payload::Duct(d) => Ok(d),
            _ => Err(Error::WrongBlockKind(kind)),
        }
    }

    fn pop_free(&mut self) -> Option<u32> {
        let head = self.free_head();
        let node = list::pop_head(&mut self.slots, head)?;
        self.free_count -= 1;
        let used = (self.slots.len() - 1) - self.free_count;
        if used > self.used_high_water {
            self.used_high_water = used;
        }
        Some(node.slot())
    }

    fn push_free(&mut self, index: u32) {
        let head = self.free_head();
        list::insert_before(&mut self.slots, head, LinkRef::new(index, MEMBER));
        self.free_count += 1;
    }

    pub fn push_recycle(&mut self, index: u32) {
        let head = self.recycle_head();
        list::extract(&mut self.slots, LinkRef::new(index, MEMBER));
        list::insert_before(&mut self.slots, head, LinkRef::new(index, MEMBER));
    }

    pub fn mark_duct_active(&mut self, index: u32) {
        let active = LinkRef::new(index, ACTIVE);
        if list::is_detached(&self.slots, active) {
            let head = self.job_head();
            list::insert_before(&mut self.slots, head, active);
        }
    }

    /// Drops one counted reference; recycles the block when the count
    /// reaches zero. Must run with the pool lock held.
    pub fn release_ref(&mut self, h: Handle) {
        let Ok(slot) = self.slot_mut(h) else {
            warn!("Releasing reference to stale block {h}");
            return;
        };
        if slot.refcount == 0 {
            error!("Reference count underflow on {h}");
            debug_assert!(false, "reference count underflow");
            return;
        }
        slot.refcount -= 1;
        if slot.refcount == 0 {
            // A block dropping to zero must not sit in any content list.
            if !list::is_detached(&self.slots, member(h)) {
                error!("Block {h} reached refcount 0 while still linked");
                debug_assert!(false, "zero-refcount block is still linked");
            }
            self.push_recycle(h.index);
        }
    }
}

/// The fixed-capacity arena: one admin block plus N content blocks, a
/// block-type registry, and the single coarse lock guarding all of it.
pub struct Pool {
    state: Mutex<PoolState>,
    pub(crate) signal: Condvar,
}

impl Pool {
    pub fn new(config: &Config) -> Result<Self, Error> {
        let n = config.capacity.get() / BLOCK_SIZE;
        if n < 2 {
            return Err(Error::PoolTooSmall(n));
        }

        let mut slots = Vec::with_capacity(n);
        for _ in 0..n {
            slots.push(Slot::new_free(1));
        }
        for i in 0..n as u32 {
            for p in 0..LINKS_PER_SLOT {
                list::init(&mut slots, LinkRef::new(i, p));
            }
        }
        slots[ADMIN_SLOT as usize].kind = BlockKind::Admin;
        slots[ADMIN_SLOT as usize].payload = Payload::Admin;

        let mut state = PoolState {
            slots,
            registry: BTreeMap::new(),
            free_count: 0,
            used_high_water: 0,
            allocated: 0,
            recycled: 0,
            bundle_threshold: config.bundle_threshold,
            internal_threshold: config.internal_threshold,
        };
        for i in 1..n as u32 {
            state.push_free(i);
        }

        info!(
            blocks = n - 1,
            block_size = BLOCK_SIZE,
            "Created block pool"
        );

        Ok(Self {
            state: Mutex::new(state),
            signal: Condvar::new(),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().trace_expect("Failed to lock pool mutex")
    }

    /// Cooperatively waits on the pool condition up to `deadline`,
    /// releasing the lock while parked. A deadline in the past behaves as
    /// a non-blocking poll.
    pub(crate) fn wait<'a>(
        &'a self,
        guard: MutexGuard<'a, PoolState>,
        deadline: duct::Deadline,
    ) -> Result<MutexGuard<'a, PoolState>, Error> {
        match deadline {
            duct::Deadline::Infinite => Ok(self
                .signal
                .wait(guard)
                .trace_expect("Failed to re-lock pool mutex")),
            duct::Deadline::At(t) => {
                let now = std::time::Instant::now();
                if now >= t {
                    return Err(Error::Timeout);
                }
                let (guard, _) = self
                    .signal
                    .wait_timeout(guard, t - now)
                    .trace_expect("Failed to re-lock pool mutex");
                Ok(guard)
            }
        }
    }

    /// Installs construct/destruct callbacks and a content size for a
    /// 32-bit type signature. Registering an already-known signature is a
    /// no-op reported as [`Registration::Duplicate`].
    pub fn register_blocktype(
        &self,
        signature: u32,
        kind: BlockKind,
        api: Arc<dyn block::BlocktypeApi>,
        content_size: usize,
    ) -> Result<block::Registration, Error> {
        if !kind.is_allocatable() {
            return Err(Error::WrongBlockKind(kind));
        }
        let mut s = self.lock();
        if s.registry.contains_key(&signature) {
            trace!(signature, "Duplicate block type registration");
            return Ok(block::Registration::Duplicate);
        }
        s.registry.insert(
            signature,
            Registered {
                kind,
                api,
                content_size,
            },
        );
        Ok(block::Registration::Fresh)
    }

    /// Locked half of allocation: admission control, free-list pull, reset
    /// and per-kind payload initialization. Constructors run later,
    /// unlocked, via `finish_construct`.
    pub(crate) fn alloc_raw(
        &self,
        requested: BlockKind,
        signature: u32,
        priority: u8,
    ) -> Result<(Handle, Arc<dyn block::BlocktypeApi>), Error> {
        let mut s = self.lock();
        let reg = s
            .registry
            .get(&signature)
            .cloned()
            .ok_or(Error::UnregisteredSignature(signature))?;
        if reg.kind != requested {
            return Err(Error::SignatureKindMismatch {
                signature,
                registered: reg.kind,
                requested,
            });
        }
        if reg.content_size > MAX_CONTENT_SIZE {
            return Err(Error::ContentTooLarge(reg.content_size));
        }

        let threshold = if reg.kind.is_bundle_class() {
            s.bundle_threshold
        } else {
            s.internal_threshold
        };
        let min_free = (threshold * (255 - priority as usize)) / 255;
        if s.free_count <= min_free {
            metrics::counter!("pool_alloc_denied").increment(1);
            return Err(Error::OutOfMemory { priority });
        }
        let Some(index) = s.pop_free() else {
            metrics::counter!("pool_alloc_denied").increment(1);
            return Err(Error::OutOfMemory { priority });
        };

        let payload = match reg.kind {
            BlockKind::Data => match reg.api.new_content() {
                Some(content) => Payload::Data(content),
                None => {
                    s.push_free(index);
                    return Err(Error::ContentMismatch);
                }
            },
            BlockKind::Primary => Payload::Primary(bundle::PrimaryBlock::default()),
            BlockKind::Canonical => Payload::Canonical(bundle::CanonicalBlock::default()),
            BlockKind::Chunk => Payload::Chunk(Bytes::new()),
            BlockKind::ListHead => Payload::ListHead,
            BlockKind::Ref => Payload::Ref(RefTarget { target: None }),
            BlockKind::Duct => Payload::Duct(duct::DuctState::default()),
            BlockKind::Job => Payload::Job(None),
            BlockKind::Undefined | BlockKind::Admin | BlockKind::Free => unreachable!(),
        };

        let free = s.free_count;
        let slot = &mut s.slots[index as usize];
        slot.kind = reg.kind;
        slot.signature = signature;
        slot.refcount = 0;
        slot.payload = payload;
        let handle = slot.handle(index);
        s.allocated += 1;
        metrics::gauge!("pool_free_blocks").set(free as f64);
        Ok((handle, reg.api))
    }

    pub(crate) fn finish_construct(
        &self,
        handle: Handle,
        api: Arc<dyn block::BlocktypeApi>,
        arg: block::InitArg,
    ) -> Result<Handle, Error> {
        if let Err(e) = api.construct(self, handle, arg) {
            warn!(block = %handle, error = %e, "Block constructor failed");
            let _ = self.recycle_block(handle);
            return Err(e);
        }
        Ok(handle)
    }

    pub fn alloc_primary(
        &self,
        signature: u32,
        arg: block::InitArg,
        priority: u8,
    ) -> Result<Handle, Error> {
        let (h, api) = self.alloc_raw(BlockKind::Primary, signature, priority)?;
        self.finish_construct(h, api, arg)
    }

    pub fn alloc_canonical(
        &self,
        signature: u32,
        arg: block::InitArg,
        priority: u8,
    ) -> Result<Handle, Error> {
        let (h, api) = self.alloc_raw(BlockKind::Canonical, signature, priority)?;
        self.finish_construct(h, api, arg)
    }

    pub fn alloc_chunk(&self, signature: u32, data: Bytes, priority: u8) -> Result<Handle, Error> {
        let (h, api) = self.alloc_raw(BlockKind::Chunk, signature, priority)?;
        {
            let mut s = self.lock();
            let slot = s.slot_mut(h)?;
            slot.payload = Payload::Chunk(data);
        }
        self.finish_construct(h, api, None)
    }

    pub fn alloc_data(
        &self,
        signature: u32,
        arg: block::InitArg,
        priority: u8,
    ) -> Result<Handle, Error> {
        let (h, api) = self.alloc_raw(BlockKind::Data, signature, priority)?;
        self.finish_construct(h, api, arg)
    }

    pub fn alloc_list_head(&self, signature: u32, priority: u8) -> Result<Handle, Error> {
        let (h, api) = self.alloc_raw(BlockKind::ListHead, signature, priority)?;
        self.finish_construct(h, api, None)
    }

    pub fn alloc_duct(
        &self,
        signature: u32,
        intf_id: u32,
        handler: Arc<dyn duct::DuctHandler>,
        configured_depth: u32,
        priority: u8,
    ) -> Result<Handle, Error> {
        let (h, api) = self.alloc_raw(BlockKind::Duct, signature, priority)?;
        {
            let mut s = self.lock();
            let d = s.duct_mut(h)?;
            d.intf_id = intf_id;
            d.configured_depth = configured_depth;
            d.handler = Some(handler);
        }
        self.finish_construct(h, api, None)
    }

    pub fn alloc_job(
        &self,
        signature: u32,
        handler: Arc<dyn block::JobHandler>,
        priority: u8,
    ) -> Result<Handle, Error> {
        let (h, api) = self.alloc_raw(BlockKind::Job, signature, priority)?;
        {
            let mut s = self.lock();
            let slot = s.slot_mut(h)?;
            slot.payload = Payload::Job(Some(handler));
        }
        self.finish_construct(h, api, None)
    }

    /// Queues a job block for the next [`Pool::process_jobs`] pass.
    pub fn post_job(&self, job: Handle) -> Result<(), Error> {
        let mut s = self.lock();
        let slot = s.slot(job)?;
        if !matches!(slot.payload, Payload::Job(_)) {
            return Err(Error::WrongBlockKind(slot.kind));
        }
        let head = s.job_head();
        list::extract(&mut s.slots, member(job));
        list::insert_before(&mut s.slots, head, member(job));
        Ok(())
    }

    /// Extracts the block from every list it is on and pushes it onto the
    /// recycle queue. The destructor runs later, in [`Pool::collect_blocks`].
    pub fn recycle_block(&self, h: Handle) -> Result<(), Error> {
        let mut s = self.lock();
        let slot = s.slot(h)?;
        if slot.refcount != 0 {
            error!(block = %h, refcount = slot.refcount, "Recycling a block with live references");
            debug_assert!(false, "recycling a block with live references");
        }
        list::extract(&mut s.slots, LinkRef::new(h.index, ACTIVE));
        s.push_recycle(h.index);
        Ok(())
    }

    /// Drains up to `limit` blocks from the recycle queue. For each:
    /// registered destructor (outside the lock), then type-specific
    /// cleanup merging any owned sub-lists back into the recycle queue,
    /// then return to the free queue.
    pub fn collect_blocks(&self, limit: usize) -> usize {
        let mut collected = 0;
        while collected < limit {
            let (h, api) = {
                let mut s = self.lock();
                let head = s.recycle_head();
                let Some(node) = list::pop_head(&mut s.slots, head) else {
                    break;
                };
                let index = node.slot();
                let slot = &s.slots[index as usize];
                (slot.handle(index), s.registry.get(&slot.signature).map(|r| r.api.clone()))
            };

            // Destructors must not hold the pool lock; any pool state they
            // touch goes back through the public API.
            if let Some(api) = &api {
                api.destruct(self, h);
            }

            {
                let mut s = self.lock();
                let index = h.index as usize;
                let kind = s.slots[index].kind;
                let recycle = s.recycle_head();
                match kind {
                    BlockKind::Primary | BlockKind::Duct => {
                        list::merge_tail(&mut s.slots, recycle, LinkRef::new(h.index, SUB_A));
                        list::merge_tail(&mut s.slots, recycle, LinkRef::new(h.index, SUB_B));
                    }
                    BlockKind::Canonical => {
                        list::merge_tail(&mut s.slots, recycle, LinkRef::new(h.index, SUB_A));
                    }
                    BlockKind::Ref => {
                        let target = match &mut s.slots[index].payload {
                            Payload::Ref(r) => r.target.take(),
                            _ => None,
                        };
                        if let Some(t) = target {
                            s.release_ref(t);
                        }
                    }
                    _ => {}
                }
                list::extract(&mut s.slots, LinkRef::new(h.index, ACTIVE));

                let slot = &mut s.slots[index];
                slot.kind = BlockKind::Free;
                slot.signature = 0;
                slot.refcount = 0;
                slot.payload = Payload::Free;
                slot.generation = slot.generation.wrapping_add(1);
                if slot.generation == 0 {
                    slot.generation = 1;
                }
                s.push_free(h.index);
                s.recycled += 1;
                metrics::gauge!("pool_free_blocks").set(s.free_count as f64);
            }

            // Space became available.
            self.signal.notify_all();
            collected += 1;
        }
        collected
    }

    /// Opportunistic bounded collection; call from any maintenance loop.
    pub fn maintain(&self) {
        let pending = {
            let s = self.lock();
            let head = s.recycle_head();
            !list::is_detached(&s.slots, head)
        };
        if pending {
            self.collect_blocks(MAINTENANCE_BATCH);
        }
    }

    pub fn stats(&self) -> PoolStats {
        let s = self.lock();
        PoolStats {
            total_blocks: s.slots.len() - 1,
            free_blocks: s.free_count,
            used_high_water: s.used_high_water,
            allocated: s.allocated,
            recycled: s.recycled,
        }
    }

    pub fn kind_of(&self, h: Handle) -> Result<BlockKind, Error> {
        Ok(self.lock().slot(h)?.kind)
    }

    pub fn signature_of(&self, h: Handle) -> Result<u32, Error> {
        Ok(self.lock().slot(h)?.signature)
    }

    pub fn refcount_of(&self, h: Handle) -> Result<u32, Error> {
        Ok(self.lock().slot(h)?.refcount)
    }

    // Typed payload accessors. All run under the pool lock; the closure
    // must not call back into the pool or take the cache lock.

    pub fn with_primary<R>(
        &self,
        h: Handle,
        f: impl FnOnce(&bundle::PrimaryBlock) -> R,
    ) -> Result<R, Error> {
        let s = self.lock();
        let slot = s.slot(h)?;
        match &slot.payload {
            Payload::Primary(p) => Ok(f(p)),
            _ => Err(Error::WrongBlockKind(slot.kind)),
        }
    }

    pub fn with_primary_mut<R>(
        &self,
        h: Handle,
        f: impl FnOnce(&mut bundle::PrimaryBlock) -> R,
    ) -> Result<R, Error> {
        let mut s = self.lock();
        let slot = s.slot_mut(h)?;
        let kind = slot.kind;
        match &mut slot.payload {
            Payload::Primary(p) => Ok(f(p)),
            _ => Err(Error::WrongBlockKind(kind)),
        }
    }

    pub fn with_canonical<R>(
        &self,
        h: Handle,
        f: impl FnOnce(&bundle::CanonicalBlock) -> R,
    ) -> Result<R, Error> {
        let s = self.lock();
        let slot = s.slot(h)?;
        match &slot.payload {
            Payload::Canonical(c) => Ok(f(c)),
            _ => Err(Error::WrongBlockKind(slot.kind)),
        }
    }

    pub fn with_canonical_mut<R>(
        &self,
        h: Handle,
        f: impl FnOnce(&mut bundle::CanonicalBlock) -> R,
    ) -> Result<R, Error> {
        let mut s = self.lock();
        let slot = s.slot_mut(h)?;
        let kind = slot.kind;
        match &mut slot.payload {
            Payload::Canonical(c) => Ok(f(c)),
            _ => Err(Error::WrongBlockKind(kind)),
        }
    }

    pub fn with_chunk<R>(&self, h: Handle, f: impl FnOnce(&Bytes) -> R) -> Result<R, Error> {
        let s = self.lock();
        let slot = s.slot(h)?;
        match &slot.payload {
            Payload::Chunk(b) => Ok(f(b)),
            _ => Err(Error::WrongBlockKind(slot.kind)),
        }
    }

    pub fn with_data<T: 'static, R>(
        &self,
        h: Handle,
        f: impl FnOnce(&T) -> R,
    ) -> Result<R, Error> {
        let s = self.lock();
        let slot = s.slot(h)?;
        match &slot.payload {
            Payload::Data(d) => Ok(f((**d)
                .as_any()
                .downcast_ref::<T>()
                .ok_or(Error::ContentMismatch)?)),
            _ => Err(Error::WrongBlockKind(slot.kind)),
        }
    }

    pub fn with_data_mut<T: 'static, R>(
        &self,
        h: Handle,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R, Error> {
        let mut s = self.lock();
        let slot = s.slot_mut(h)?;
        let kind = slot.kind;
        match &mut slot.payload {
            Payload::Data(d) => Ok(f((**d)
                .as_any_mut()
                .downcast_mut::<T>()
                .ok_or(Error::ContentMismatch)?)),
            _ => Err(Error::WrongBlockKind(kind)),
        }
    }

    // Sub-list (index-neutral grouping) operations.

    pub fn sublist_append(&self, owner: Handle, l: Sublist, node: Handle) -> Result<(), Error> {
        let mut s = self.lock();
        s.slot(owner)?;
        s.slot(node)?;
        let head = LinkRef::new(owner.index, l.pos());
        list::extract(&mut s.slots, member(node));
        list::insert_before(&mut s.slots, head, member(node));
        Ok(())
    }

    pub fn sublist_pop(&self, owner: Handle, l: Sublist) -> Result<Option<Handle>, Error> {
        let mut s = self.lock();
        s.slot(owner)?;
        let head = LinkRef::new(owner.index, l.pos());
        Ok(list::pop_head(&mut s.slots, head).map(|n| {
            let index = n.slot();
            s.slots[index as usize].handle(index)
        }))
    }

    pub fn sublist_is_empty(&self, owner: Handle, l: Sublist) -> Result<bool, Error> {
        let s = self.lock();
        s.slot(owner)?;
        Ok(list::is_detached(&s.slots, LinkRef::new(owner.index, l.pos())))
    }

    pub fn sublist_len(&self, owner: Handle, l: Sublist) -> Result<usize, Error> {
        let s = self.lock();
        s.slot(owner)?;
        Ok(list::len(&s.slots, LinkRef::new(owner.index, l.pos())))
    }

    /// Snapshot of the member handles of a sub-list, head first.
    pub fn sublist_handles(&self, owner: Handle, l: Sublist) -> Result<Vec<Handle>, Error> {
        let s = self.lock();
        s.slot(owner)?;
        let head = LinkRef::new(owner.index, l.pos());
        let mut out = Vec::new();
        let mut cur = list::peek_head(&s.slots, head);
        while let Some(n) = cur {
            let index = n.slot();
            out.push(s.slots[index as usize].handle(index));
            cur = list::next_of(&s.slots, head, n);
        }
        Ok(out)
    }

    /// Detaches a block from whatever list currently holds it.
    pub fn extract_node(&self, node: Handle) -> Result<(), Error> {
        let mut s = self.lock();
        s.slot(node)?;
        list::extract(&mut s.slots, member(node));
        Ok(())
    }

    // Bundle chain conveniences over the sub-list machinery.

    /// Appends an encoded CBOR chunk to a primary or canonical block's chain.
    pub fn bundle_append_chunk(&self, block: Handle, chunk: Handle) -> Result<(), Error> {
        {
            let s = self.lock();
            let slot = s.slot(block)?;
            if !matches!(slot.kind, BlockKind::Primary | BlockKind::Canonical) {
                return Err(Error::WrongBlockKind(slot.kind));
            }
            let c = s.slot(chunk)?;
            if !matches!(c.kind, BlockKind::Chunk) {
                return Err(Error::WrongBlockKind(c.kind));
            }
        }
        self.sublist_append(block, Sublist::A, chunk)
    }

    /// Appends a canonical block to a primary block's canonical chain.
    pub fn bundle_append_cblock(&self, primary: Handle, cblock: Handle) -> Result<(), Error> {
        {
            let s = self.lock();
            let slot = s.slot(primary)?;
            if !matches!(slot.kind, BlockKind::Primary) {
                return Err(Error::WrongBlockKind(slot.kind));
            }
            let c = s.slot(cblock)?;
            if !matches!(c.kind, BlockKind::Canonical) {
                return Err(Error::WrongBlockKind(c.kind));
            }
        }
        self.sublist_append(primary, Sublist::B, cblock)
    }

    pub fn bundle_chunks(&self, block: Handle) -> Result<Vec<Handle>, Error> {
        self.sublist_handles(block, Sublist::A)
    }

    pub fn bundle_cblocks(&self, primary: Handle) -> Result<Vec<Handle>, Error> {
        self.sublist_handles(primary, Sublist::B)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use block::{NullBlocktypeApi, Registration};

    const SIG_TEST_CHUNK: u32 = 0x7e570001;
    const SIG_TEST_PRIMARY: u32 = 0x7e570002;
    const SIG_TEST_DATA: u32 = 0x7e570003;

    struct TestDataApi;

    impl block::BlocktypeApi for TestDataApi {
        fn new_content(&self) -> Option<Box<dyn block::BlockData>> {
            Some(Box::new(0u64))
        }
    }

    fn make_pool(blocks: usize) -> Pool {
        let pool = Pool::new(&Config {
            capacity: core::num::NonZeroUsize::new((blocks + 1) * BLOCK_SIZE).unwrap(),
            bundle_threshold: 0,
            internal_threshold: 0,
        })
        .unwrap();
        pool.register_blocktype(SIG_TEST_CHUNK, BlockKind::Chunk, Arc::new(NullBlocktypeApi), 0)
            .unwrap();
        pool.register_blocktype(
            SIG_TEST_PRIMARY,
            BlockKind::Primary,
            Arc::new(NullBlocktypeApi),
            0,
        )
        .unwrap();
        pool.register_blocktype(SIG_TEST_DATA, BlockKind::Data, Arc::new(TestDataApi), 8)
            .unwrap();
        pool
    }

    #[test]
    fn pool_too_small() {
        assert!(matches!(
            Pool::new(&Config {
                capacity: core::num::NonZeroUsize::new(BLOCK_SIZE).unwrap(),
                ..Default::default()
            }),
            Err(Error::PoolTooSmall(1))
        ));
    }

    #[test]
    fn duplicate_registration_is_idempotent() {
        let pool = make_pool(4);
        assert_eq!(
            pool.register_blocktype(
                SIG_TEST_CHUNK,
                BlockKind::Chunk,
                Arc::new(NullBlocktypeApi),
                0
            )
            .unwrap(),
            Registration::Duplicate
        );
    }

    #[test]
    fn unregistered_signature_is_rejected() {
        let pool = make_pool(4);
        assert!(matches!(
            pool.alloc_chunk(0xdeadbeef, Bytes::new(), 255),
            Err(Error::UnregisteredSignature(0xdeadbeef))
        ));
    }

    #[test]
    fn kind_mismatch_is_rejected() {
        let pool = make_pool(4);
        assert!(matches!(
            pool.alloc_primary(SIG_TEST_CHUNK, None, 255),
            Err(Error::SignatureKindMismatch { .. })
        ));
    }

    #[test]
    fn oversized_content_is_rejected() {
        let pool = make_pool(4);
        pool.register_blocktype(
            0x7e57aaaa,
            BlockKind::Data,
            Arc::new(TestDataApi),
            MAX_CONTENT_SIZE + 1,
        )
        .unwrap();
        assert!(matches!(
            pool.alloc_data(0x7e57aaaa, None, 255),
            Err(Error::ContentTooLarge(_))
        ));
    }

    #[test]
    fn alloc_recycle_collect_round_trip() {
        let pool = make_pool(4);
        assert_eq!(pool.stats().free_blocks, 4);
        let h = pool.alloc_chunk(SIG_TEST_CHUNK, Bytes::from_static(b"abc"), 255).unwrap();
        assert_eq!(pool.stats().free_blocks, 3);
        pool.recycle_block(h).unwrap();
        assert_eq!(pool.stats().free_blocks, 3);
        pool.maintain();
        assert_eq!(pool.stats().free_blocks, 4);
        // The old handle is now stale.
        assert!(matches!(pool.kind_of(h), Err(Error::StaleHandle)));
    }

    #[test]
    fn recycling_a_primary_frees_its_chunk_chain() {
        let pool = make_pool(6);
        let p = pool.alloc_primary(SIG_TEST_PRIMARY, None, 255).unwrap();
        for _ in 0..3 {
            let c = pool
                .alloc_chunk(SIG_TEST_CHUNK, Bytes::from_static(b"x"), 255)
                .unwrap();
            pool.bundle_append_chunk(p, c).unwrap();
        }
        assert_eq!(pool.stats().free_blocks, 2);
        pool.recycle_block(p).unwrap();
        pool.collect_blocks(16);
        assert_eq!(pool.stats().free_blocks, 6);
    }

    #[test]
    fn admission_denies_low_priority_first() {
        let pool = Pool::new(&Config {
            capacity: core::num::NonZeroUsize::new(11 * BLOCK_SIZE).unwrap(),
            bundle_threshold: 8,
            internal_threshold: 0,
        })
        .unwrap();
        pool.register_blocktype(SIG_TEST_CHUNK, BlockKind::Chunk, Arc::new(NullBlocktypeApi), 0)
            .unwrap();

        // 10 free blocks, threshold 8: drain to the priority-0 boundary.
        pool.alloc_chunk(SIG_TEST_CHUNK, Bytes::new(), 255).unwrap();
        pool.alloc_chunk(SIG_TEST_CHUNK, Bytes::new(), 255).unwrap();
        assert!(matches!(
            pool.alloc_chunk(SIG_TEST_CHUNK, Bytes::new(), 0),
            Err(Error::OutOfMemory { priority: 0 })
        ));
        // Mid and max priorities are still admitted.
        pool.alloc_chunk(SIG_TEST_CHUNK, Bytes::new(), 128).unwrap();
        pool.alloc_chunk(SIG_TEST_CHUNK, Bytes::new(), 255).unwrap();
        // Max priority is only shed once the free list is exhausted.
        for _ in 0..6 {
            pool.alloc_chunk(SIG_TEST_CHUNK, Bytes::new(), 255).unwrap();
        }
        assert!(matches!(
            pool.alloc_chunk(SIG_TEST_CHUNK, Bytes::new(), 255),
            Err(Error::OutOfMemory { priority: 255 })
        ));
    }

    #[test]
    fn high_water_mark_tracks_peak_usage() {
        let pool = make_pool(4);
        let a = pool.alloc_chunk(SIG_TEST_CHUNK, Bytes::new(), 255).unwrap();
        let b = pool.alloc_chunk(SIG_TEST_CHUNK, Bytes::new(), 255).unwrap();
        pool.recycle_block(a).unwrap();
        pool.recycle_block(b).unwrap();
        pool.maintain();
        let stats = pool.stats();
        assert_eq!(stats.free_blocks, 4);
        assert_eq!(stats.used_high_water, 2);
    }

    #[test]
    fn data_block_content_is_typed() {
        let pool = make_pool(4);
        let h = pool.alloc_data(SIG_TEST_DATA, None, 255).unwrap();
        pool.with_data_mut::<u64, _>(h, |v| *v = 42).unwrap();
        assert_eq!(pool.with_data::<u64, _>(h, |v| *v).unwrap(), 42);
        assert!(matches!(
            pool.with_data::<u32, _>(h, |_| ()),
            Err(Error::ContentMismatch)
        ));
    }
}
