//! Ducts: bounded, backpressure-aware ingress/egress queue pairs.
//!
//! Depth state is implicit in the push/pull counter pair; there are no
//! named queue states. All waiting is deadline-based and cooperative:
//! the pool lock is released while parked on the pool condition.

use super::*;
use block::Payload;
use list::LinkRef;
use pool::{member, Sublist, SUB_A, SUB_B};

/// Absolute wait bound for blocking queue operations. A deadline in the
/// past behaves as a non-blocking poll; there is no cancellation token.
#[derive(Copy, Clone, Debug)]
pub enum Deadline {
    Infinite,
    At(std::time::Instant),
}

impl Deadline {
    /// Non-blocking: fail immediately if the operation cannot proceed.
    pub fn poll() -> Self {
        Deadline::At(std::time::Instant::now())
    }

    pub fn in_millisecs(ms: u64) -> Self {
        Deadline::At(std::time::Instant::now() + std::time::Duration::from_millis(ms))
    }
}

/// One direction of a duct.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DuctDir {
    Ingress,
    Egress,
}

impl DuctDir {
    fn pos(self) -> usize {
        match self {
            DuctDir::Ingress => SUB_A,
            DuctDir::Egress => SUB_B,
        }
    }

    fn sublist(self) -> Sublist {
        match self {
            DuctDir::Ingress => Sublist::A,
            DuctDir::Egress => Sublist::B,
        }
    }
}

/// Interface state-change and poll events delivered to the registered
/// per-interface handler by [`Pool::process_jobs`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum DuctEvent {
    #[default]
    Undefined,
    Poll(u32),
    Up(u32),
    Down(u32),
}

pub trait DuctHandler: Send + Sync {
    /// Runs outside the pool lock.
    fn on_event(&self, pool: &Pool, duct: Handle, event: DuctEvent);
}

#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct SubqState {
    pub push_count: u32,
    pub pull_count: u32,
    /// 0 behaves as permanently full.
    pub depth_limit: u32,
}

impl SubqState {
    pub fn depth(&self) -> u32 {
        self.push_count.wrapping_sub(self.pull_count)
    }
}

#[derive(Default)]
pub(crate) struct DuctState {
    pub intf_id: u32,
    pub up_pending: bool,
    pub up_current: bool,
    /// Depth limit restored on an Up transition.
    pub configured_depth: u32,
    pub ingress: SubqState,
    pub egress: SubqState,
    pub handler: Option<Arc<dyn DuctHandler>>,
}

impl DuctState {
    pub fn subq(&self, dir: DuctDir) -> &SubqState {
        match dir {
            DuctDir::Ingress => &self.ingress,
            DuctDir::Egress => &self.egress,
        }
    }

    pub fn subq_mut(&mut self, dir: DuctDir) -> &mut SubqState {
        match dir {
            DuctDir::Ingress => &mut self.ingress,
            DuctDir::Egress => &mut self.egress,
        }
    }
}

impl Pool {
    /// Appends `block` to the subqueue, waiting for room until `deadline`.
    /// A successful push marks the duct active for the next
    /// [`Pool::process_jobs`] pass.
    pub fn duct_push(
        &self,
        duct: Handle,
        dir: DuctDir,
        block: Handle,
        deadline: Deadline,
    ) -> Result<(), Error> {
        let mut s = self.lock();
        loop {
            let sq = s.duct(duct)?.subq(dir);
            if sq.depth_limit > 0 && sq.depth() < sq.depth_limit {
                break;
            }
            s = self.wait(s, deadline)?;
        }

        {
            // Content nodes must be referenced before they sit on a queue.
            let b = s.slot(block)?;
            if b.kind.is_content() && b.refcount == 0 {
                return Err(Error::ZeroRefcount);
            }
        }

        list::extract(&mut s.slots, member(block));
        list::insert_before(&mut s.slots, LinkRef::new(duct.index, dir.pos()), member(block));
        {
            let sq = s.duct_mut(duct)?.subq_mut(dir);
            sq.push_count = sq.push_count.wrapping_add(1);
        }
        s.mark_duct_active(duct.index);
        drop(s);
        self.signal.notify_all();
        Ok(())
    }

    /// Removes and returns the head of the subqueue, waiting for content
    /// until `deadline`.
    pub fn duct_pull(&self, duct: Handle, dir: DuctDir, deadline: Deadline) -> Result<Handle, Error> {
        let mut s = self.lock();
        let node = loop {
            s.duct(duct)?;
            if let Some(node) = list::pop_head(&mut s.slots, LinkRef::new(duct.index, dir.pos())) {
                break node;
            }
            s = self.wait(s, deadline)?;
        };
        let sq = s.duct_mut(duct)?.subq_mut(dir);
        sq.pull_count = sq.pull_count.wrapping_add(1);
        let index = node.slot();
        let h = s.slots[index as usize].handle(index);
        drop(s);
        self.signal.notify_all();
        Ok(h)
    }

    /// Atomically transfers the entire source subqueue to the destination
    /// once it has room for all of it, re-computing the required space if
    /// the source grows while waiting. Returns the number moved.
    pub fn duct_move_all(
        &self,
        src: Handle,
        src_dir: DuctDir,
        dst: Handle,
        dst_dir: DuctDir,
        deadline: Deadline,
    ) -> Result<u32, Error> {
        let mut s = self.lock();
        let moved = loop {
            let needed = s.duct(src)?.subq(src_dir).depth();
            if needed == 0 {
                return Ok(0);
            }
            let d = s.duct(dst)?.subq(dst_dir);
            if d.depth_limit > 0 && d.depth().saturating_add(needed) <= d.depth_limit {
                break needed;
            }
            s = self.wait(s, deadline)?;
        };

        list::merge_tail(
            &mut s.slots,
            LinkRef::new(dst.index, dst_dir.pos()),
            LinkRef::new(src.index, src_dir.pos()),
        );
        {
            let sq = s.duct_mut(src)?.subq_mut(src_dir);
            sq.pull_count = sq.pull_count.wrapping_add(moved);
        }
        {
            let sq = s.duct_mut(dst)?.subq_mut(dst_dir);
            sq.push_count = sq.push_count.wrapping_add(moved);
        }
        s.mark_duct_active(dst.index);
        drop(s);
        self.signal.notify_all();
        Ok(moved)
    }

    /// Restores a depth limit without affecting queued content.
    pub fn duct_enable(&self, duct: Handle, dir: DuctDir, limit: u32) -> Result<(), Error> {
        let mut s = self.lock();
        s.duct_mut(duct)?.subq_mut(dir).depth_limit = limit;
        drop(s);
        self.signal.notify_all();
        Ok(())
    }

    /// Zeroes the depth limit and drops (recycles) everything queued.
    pub fn duct_disable(&self, duct: Handle, dir: DuctDir) -> Result<(), Error> {
        let mut s = self.lock();
        {
            let sq = s.duct_mut(duct)?.subq_mut(dir);
            sq.depth_limit = 0;
            sq.pull_count = sq.push_count;
        }
        let head = LinkRef::new(duct.index, dir.pos());
        while let Some(node) = list::pop_head(&mut s.slots, head) {
            s.push_recycle(node.slot());
        }
        drop(s);
        self.signal.notify_all();
        Ok(())
    }

    pub fn duct_depth(&self, duct: Handle, dir: DuctDir) -> Result<u32, Error> {
        Ok(self.lock().duct(duct)?.subq(dir).depth())
    }

    /// Snapshot of the queued handles, head first.
    pub fn duct_handles(&self, duct: Handle, dir: DuctDir) -> Result<Vec<Handle>, Error> {
        self.sublist_handles(duct, dir.sublist())
    }

    /// Stages an interface up/down transition; the depth scaling and the
    /// Up/Down event are applied on the next [`Pool::process_jobs`] pass.
    pub fn duct_set_state(&self, duct: Handle, up: bool) -> Result<(), Error> {
        let mut s = self.lock();
        s.duct_mut(duct)?.up_pending = up;
        s.mark_duct_active(duct.index);
        Ok(())
    }

    /// Drains the active-job list: state-change and poll events for
    /// active ducts, then one-shot job blocks. Handlers run outside the
    /// pool lock. Returns the number of work items processed.
    pub fn process_jobs(&self) -> usize {
        enum Work {
            Duct {
                h: Handle,
                handler: Option<Arc<dyn DuctHandler>>,
                events: Vec<DuctEvent>,
                went_down: bool,
            },
            Job {
                h: Handle,
                handler: Option<Arc<dyn block::JobHandler>>,
            },
        }

        let mut processed = 0;
        loop {
            let work = {
                let mut s = self.lock();
                let head = s.job_head();
                let Some(node) = list::pop_head(&mut s.slots, head) else {
                    break;
                };
                let index = node.slot();
                let h = s.slots[index as usize].handle(index);
                match &mut s.slots[index as usize].payload {
                    Payload::Duct(d) => {
                        let mut events = Vec::new();
                        let mut went_down = false;
                        if d.up_pending != d.up_current {
                            d.up_current = d.up_pending;
                            if d.up_current {
                                d.ingress.depth_limit = d.configured_depth;
                                d.egress.depth_limit = d.configured_depth;
                                events.push(DuctEvent::Up(d.intf_id));
                            } else {
                                went_down = true;
                                events.push(DuctEvent::Down(d.intf_id));
                            }
                        }
                        events.push(DuctEvent::Poll(d.intf_id));
                        Work::Duct {
                            h,
                            handler: d.handler.clone(),
                            events,
                            went_down,
                        }
                    }
                    Payload::Job(j) => Work::Job {
                        h,
                        handler: j.clone(),
                    },
                    _ => {
                        warn!(block = %h, "Non-processable block on the active-job list");
                        continue;
                    }
                }
            };

            match work {
                Work::Duct {
                    h,
                    handler,
                    events,
                    went_down,
                } => {
                    if went_down {
                        let _ = self.duct_disable(h, DuctDir::Ingress);
                        let _ = self.duct_disable(h, DuctDir::Egress);
                    }
                    if let Some(handler) = handler {
                        for e in events {
                            handler.on_event(self, h, e);
                        }
                    }
                }
                Work::Job { h, handler } => {
                    if let Some(handler) = handler {
                        handler.run(self, h);
                    }
                    let _ = self.recycle_block(h);
                }
            }
            processed += 1;
        }
        processed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use block::{BlockKind, NullBlocktypeApi};
    use pool::{Config, BLOCK_SIZE};
    use std::sync::atomic::{AtomicU32, Ordering};

    const SIG_CHUNK: u32 = 0x7e570020;
    const SIG_DUCT: u32 = 0x7e570021;

    struct NullDuctHandler;

    impl DuctHandler for NullDuctHandler {
        fn on_event(&self, _pool: &Pool, _duct: Handle, _event: DuctEvent) {}
    }

    struct CountingHandler(AtomicU32);

    impl DuctHandler for CountingHandler {
        fn on_event(&self, _pool: &Pool, _duct: Handle, event: DuctEvent) {
            match event {
                DuctEvent::Up(_) => self.0.fetch_or(0x100, Ordering::SeqCst),
                DuctEvent::Down(_) => self.0.fetch_or(0x200, Ordering::SeqCst),
                DuctEvent::Poll(_) => self.0.fetch_add(1, Ordering::SeqCst),
                DuctEvent::Undefined => 0,
            };
        }
    }

    fn make_pool(blocks: usize) -> Arc<Pool> {
        let pool = Pool::new(&Config {
            capacity: core::num::NonZeroUsize::new((blocks + 1) * BLOCK_SIZE).unwrap(),
            bundle_threshold: 0,
            internal_threshold: 0,
        })
        .unwrap();
        pool.register_blocktype(SIG_CHUNK, BlockKind::Chunk, Arc::new(NullBlocktypeApi), 0)
            .unwrap();
        pool.register_blocktype(SIG_DUCT, BlockKind::Duct, Arc::new(NullBlocktypeApi), 0)
            .unwrap();
        Arc::new(pool)
    }

    fn make_duct(pool: &Pool, depth: u32) -> Handle {
        let duct = pool
            .alloc_duct(SIG_DUCT, 1, Arc::new(NullDuctHandler), depth, 255)
            .unwrap();
        pool.duct_enable(duct, DuctDir::Ingress, depth).unwrap();
        pool.duct_enable(duct, DuctDir::Egress, depth).unwrap();
        duct
    }

    fn chunk(pool: &Pool, data: &'static [u8]) -> Handle {
        pool.alloc_chunk(SIG_CHUNK, Bytes::from_static(data), 255)
            .unwrap()
    }

    #[test]
    fn push_within_depth_never_blocks() {
        let pool = make_pool(8);
        let duct = make_duct(&pool, 4);
        for _ in 0..4 {
            let c = chunk(&pool, b"x");
            pool.duct_push(duct, DuctDir::Ingress, c, Deadline::poll())
                .unwrap();
        }
        assert_eq!(pool.duct_depth(duct, DuctDir::Ingress).unwrap(), 4);
    }

    #[test]
    fn push_at_full_depth_times_out() {
        let pool = make_pool(8);
        let duct = make_duct(&pool, 1);
        let a = chunk(&pool, b"a");
        pool.duct_push(duct, DuctDir::Ingress, a, Deadline::poll())
            .unwrap();
        let b = chunk(&pool, b"b");
        assert!(matches!(
            pool.duct_push(duct, DuctDir::Ingress, b, Deadline::poll()),
            Err(Error::Timeout)
        ));
        assert!(matches!(
            pool.duct_push(duct, DuctDir::Ingress, b, Deadline::in_millisecs(20)),
            Err(Error::Timeout)
        ));
    }

    #[test]
    fn fifo_order_within_one_subqueue() {
        let pool = make_pool(8);
        let duct = make_duct(&pool, 4);
        let seq: [&'static [u8]; 3] = [b"1", b"2", b"3"];
        for data in seq {
            let c = chunk(&pool, data);
            pool.duct_push(duct, DuctDir::Ingress, c, Deadline::poll())
                .unwrap();
        }
        for expect in seq {
            let h = pool
                .duct_pull(duct, DuctDir::Ingress, Deadline::poll())
                .unwrap();
            pool.with_chunk(h, |b| assert_eq!(b.as_ref(), expect)).unwrap();
            pool.recycle_block(h).unwrap();
        }
        assert!(matches!(
            pool.duct_pull(duct, DuctDir::Ingress, Deadline::poll()),
            Err(Error::Timeout)
        ));
    }

    #[test]
    fn concurrent_pull_unblocks_push() {
        let pool = make_pool(8);
        let duct = make_duct(&pool, 1);
        let a = chunk(&pool, b"a");
        pool.duct_push(duct, DuctDir::Ingress, a, Deadline::poll())
            .unwrap();

        let puller = {
            let pool = pool.clone();
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(50));
                pool.duct_pull(duct, DuctDir::Ingress, Deadline::Infinite)
                    .unwrap()
            })
        };

        // Blocks until the puller makes room.
        let b = chunk(&pool, b"b");
        pool.duct_push(duct, DuctDir::Ingress, b, Deadline::in_millisecs(5_000))
            .unwrap();
        let pulled = puller.join().unwrap();
        pool.with_chunk(pulled, |b| assert_eq!(b.as_ref(), b"a"))
            .unwrap();
    }

    #[test]
    fn disable_drops_queued_entries() {
        let pool = make_pool(8);
        let duct = make_duct(&pool, 4);
        for _ in 0..3 {
            let c = chunk(&pool, b"x");
            pool.duct_push(duct, DuctDir::Ingress, c, Deadline::poll())
                .unwrap();
        }
        let free_before = pool.stats().free_blocks;
        pool.duct_disable(duct, DuctDir::Ingress).unwrap();
        pool.maintain();
        assert_eq!(pool.stats().free_blocks, free_before + 3);
        assert_eq!(pool.duct_depth(duct, DuctDir::Ingress).unwrap(), 0);
        // Depth limit 0: permanently full.
        let c = chunk(&pool, b"y");
        assert!(matches!(
            pool.duct_push(duct, DuctDir::Ingress, c, Deadline::poll()),
            Err(Error::Timeout)
        ));
    }

    #[test]
    fn move_all_transfers_everything() {
        let pool = make_pool(12);
        let src = make_duct(&pool, 4);
        let dst = make_duct(&pool, 8);
        for _ in 0..3 {
            let c = chunk(&pool, b"x");
            pool.duct_push(src, DuctDir::Egress, c, Deadline::poll())
                .unwrap();
        }
        assert_eq!(
            pool.duct_move_all(src, DuctDir::Egress, dst, DuctDir::Ingress, Deadline::poll())
                .unwrap(),
            3
        );
        assert_eq!(pool.duct_depth(src, DuctDir::Egress).unwrap(), 0);
        assert_eq!(pool.duct_depth(dst, DuctDir::Ingress).unwrap(), 3);
    }

    #[test]
    fn state_change_events_are_delivered() {
        let pool = make_pool(8);
        let handler = Arc::new(CountingHandler(AtomicU32::new(0)));
        let duct = pool
            .alloc_duct(SIG_DUCT, 7, handler.clone(), 4, 255)
            .unwrap();

        pool.duct_set_state(duct, true).unwrap();
        pool.process_jobs();
        assert_eq!(handler.0.load(Ordering::SeqCst) & 0x100, 0x100);
        assert_eq!(pool.duct_depth(duct, DuctDir::Ingress).unwrap(), 0);

        // Up restored the configured depth limit.
        let c = chunk(&pool, b"x");
        pool.duct_push(duct, DuctDir::Ingress, c, Deadline::poll())
            .unwrap();

        pool.duct_set_state(duct, false).unwrap();
        pool.process_jobs();
        assert_eq!(handler.0.load(Ordering::SeqCst) & 0x200, 0x200);
        // Down dropped the queued entry.
        pool.maintain();
        assert_eq!(pool.duct_depth(duct, DuctDir::Ingress).unwrap(), 0);
    }
}
